use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{error, info, Level};
use logging_timer::timer;

use crate::error::EchoNotesError;
use crate::time_gate::Clock;

/// A unit of scheduled work the daemon can invoke
///
/// Jobs own all of their side effects. The runner only cares whether a run
/// finished.
pub trait Job: Send + Sync {
    /// Human-readable name for logs (e.g., "note processing")
    fn name(&self) -> &str;

    /// Execute one full run of the job
    fn run(&self) -> Result<(), EchoNotesError>;
}

/// Invokes the two scheduled jobs and reports when they completed.
///
/// Neither method ever propagates a failure: errors and panics inside a job
/// are logged and reported as `None`, so one failing job can't take down the
/// daemon loop or block the other job.
pub struct JobRunner {
    note_processor: Box<dyn Job>,
    summary_generator: Box<dyn Job>,
    clock: Arc<dyn Clock>,
}

impl JobRunner {
    pub fn new(
        note_processor: Box<dyn Job>,
        summary_generator: Box<dyn Job>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        JobRunner {
            note_processor,
            summary_generator,
            clock,
        }
    }

    /// Run the note-processing job, returning its completion time on success
    pub fn run_note_processing(&self) -> Option<NaiveDateTime> {
        self.run_job(self.note_processor.as_ref())
    }

    /// Run the summary-generation job, returning its completion time on success
    pub fn run_summary_generation(&self) -> Option<NaiveDateTime> {
        self.run_job(self.summary_generator.as_ref())
    }

    fn run_job(&self, job: &dyn Job) -> Option<NaiveDateTime> {
        let _tmr = timer!(Level::Trace; "JobRunner::run_job");
        info!("Running {}...", job.name());

        match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(())) => {
                let finished = self.clock.now();
                info!("{} completed successfully at {}", capitalize(job.name()), finished);
                Some(finished)
            }
            Ok(Err(e)) => {
                error!("Error during {}: {}", job.name(), e);
                None
            }
            Err(payload) => {
                error!("{} panicked: {}", capitalize(job.name()), panic_message(payload.as_ref()));
                None
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
