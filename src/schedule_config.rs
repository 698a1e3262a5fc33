use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::EchoNotesError;

/// One week in minutes. A summary interval of exactly this value switches the
/// summary job to day/hour gating.
pub const WEEK_MINUTES: u32 = 10080;

/// Persisted scheduling settings for the daemon
///
/// Every field falls back to its default when missing from the stored JSON so
/// records written by older versions keep loading. Unknown keys are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minimum gap between note-processing runs, in minutes
    pub processing_interval: u32,
    /// Minimum gap between summary runs, in minutes
    pub summary_interval: u32,
    /// Target weekday for the weekly summary (0 = Monday)
    pub summary_day: u8,
    /// Target hour of day for the weekly summary
    pub summary_hour: u8,
    /// Master switch, re-read every daemon tick
    pub daemon_enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            processing_interval: 60,
            summary_interval: WEEK_MINUTES,
            summary_day: 6,
            summary_hour: 12,
            daemon_enabled: true,
        }
    }
}

impl ScheduleConfig {
    pub const WEEKDAYS: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];

    pub fn is_weekly(&self) -> bool {
        self.summary_interval == WEEK_MINUTES
    }

    pub fn summary_day_name(&self) -> &'static str {
        Self::WEEKDAYS
            .get(self.summary_day as usize)
            .copied()
            .unwrap_or("Unknown")
    }

    /// Check the record's invariants, describing the first violation found
    pub fn validate(&self) -> Result<(), String> {
        if self.processing_interval == 0 {
            return Err("processing_interval must be greater than 0".to_string());
        }
        if self.summary_interval == 0 {
            return Err("summary_interval must be greater than 0".to_string());
        }
        if self.summary_day > 6 {
            return Err(format!(
                "summary_day must be between 0 and 6, got {}",
                self.summary_day
            ));
        }
        if self.summary_hour > 23 {
            return Err(format!(
                "summary_hour must be between 0 and 23, got {}",
                self.summary_hour
            ));
        }
        Ok(())
    }

    /// Replace out-of-range fields with their defaults
    fn ensure_valid(&mut self) {
        let defaults = ScheduleConfig::default();

        if self.processing_interval == 0 {
            warn!(
                "Schedule config: processing_interval of 0 is invalid - using default of {}",
                defaults.processing_interval
            );
            self.processing_interval = defaults.processing_interval;
        }
        if self.summary_interval == 0 {
            warn!(
                "Schedule config: summary_interval of 0 is invalid - using default of {}",
                defaults.summary_interval
            );
            self.summary_interval = defaults.summary_interval;
        }
        if self.summary_day > 6 {
            warn!(
                "Schedule config: summary_day of {} is invalid - using default of {}",
                self.summary_day, defaults.summary_day
            );
            self.summary_day = defaults.summary_day;
        }
        if self.summary_hour > 23 {
            warn!(
                "Schedule config: summary_hour of {} is invalid - using default of {}",
                self.summary_hour, defaults.summary_hour
            );
            self.summary_hour = defaults.summary_hour;
        }
    }
}

/// Parse a weekday given either as a number (0 = Monday) or a name
pub fn parse_weekday(input: &str) -> Result<u8, String> {
    let trimmed = input.trim();
    if let Ok(day) = trimmed.parse::<u8>() {
        if day <= 6 {
            return Ok(day);
        }
        return Err(format!("Weekday number must be between 0 and 6, got {}", day));
    }

    let lower = trimmed.to_ascii_lowercase();
    ScheduleConfig::WEEKDAYS
        .iter()
        .position(|name| {
            let name = name.to_ascii_lowercase();
            name == lower || (lower.len() >= 3 && name.starts_with(&lower))
        })
        .map(|idx| idx as u8)
        .ok_or_else(|| format!("Invalid weekday: {}", input))
}

/// Source of schedule snapshots for the daemon loop
///
/// `reload` must return a fresh snapshot of the persisted state on every call
/// rather than a cached value.
pub trait ConfigStore: Send + Sync {
    fn reload(&self) -> Result<ScheduleConfig, EchoNotesError>;
}

/// Schedule configuration stored as a JSON file
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted record, writing the defaults first when it doesn't exist.
    ///
    /// Never fails: a malformed record is logged and the defaults are returned.
    pub fn load(&self) -> ScheduleConfig {
        if !self.path.exists() {
            let defaults = ScheduleConfig::default();
            info!(
                "No schedule config at {}, writing defaults",
                self.path.display()
            );
            if let Err(e) = self.save(&defaults) {
                error!(
                    "Failed to write default schedule config to {}: {}",
                    self.path.display(),
                    e
                );
            }
            return defaults;
        }

        self.read().unwrap_or_else(|e| {
            error!(
                "Could not load schedule config {}: {}. Using default schedule.",
                self.path.display(),
                e
            );
            ScheduleConfig::default()
        })
    }

    /// Overwrite the persisted record.
    ///
    /// The record is written to a sibling temporary file and renamed over the
    /// target, so concurrent readers see either the old or the new content.
    pub fn save(&self, config: &ScheduleConfig) -> Result<(), EchoNotesError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(config)?;
        let tmp_path = self.temp_path();

        let write_result = (|| -> Result<(), EchoNotesError> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();

        if write_result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        } else {
            debug!("Saved schedule config to {}", self.path.display());
        }

        write_result
    }

    /// Validate and persist a new schedule. A running daemon picks it up on
    /// its next tick.
    pub fn reconfigure(&self, config: &ScheduleConfig) -> Result<(), EchoNotesError> {
        config.validate().map_err(EchoNotesError::Config)?;
        self.save(config)?;
        info!("Schedule configuration updated: {:?}", config);
        Ok(())
    }

    fn read(&self) -> Result<ScheduleConfig, EchoNotesError> {
        let contents = fs::read_to_string(&self.path)?;
        let mut config: ScheduleConfig = serde_json::from_str(&contents)?;
        config.ensure_valid();
        Ok(config)
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "schedule_config.json".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
    }
}

impl ConfigStore for JsonConfigStore {
    fn reload(&self) -> Result<ScheduleConfig, EchoNotesError> {
        if !self.path.exists() {
            // Deleted out from under us; recreate it like a first run
            return Ok(self.load());
        }
        self.read()
    }
}
