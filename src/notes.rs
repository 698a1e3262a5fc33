use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDateTime};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::EchoNotesError;
use crate::jobs::Job;
use crate::llm::LlmClient;
use crate::time_gate::Clock;

/// Marker whose presence in a note body means it has already been processed
pub const PROCESSED_MARKER: &str = "CLEANED & STRUCTURED NOTES";

const WEEKLY_SUMMARY_PREFIX: &str = "Weekly Summary";
const NOTE_EXTENSION: &str = "md";
const RECENT_DAYS: i64 = 7;

static SUMMARY_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SUMMARY\s*\((\d{4}-\d{2}-\d{2} \d{2}:\d{2})\)").expect("valid regex")
});

pub fn is_processed_note(text: &str) -> bool {
    text.contains(PROCESSED_MARKER)
}

fn is_weekly_summary(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(WEEKLY_SUMMARY_PREFIX))
}

/// Markdown files directly inside `notes_dir`, sorted by name
fn list_notes(notes_dir: &Path) -> Result<Vec<PathBuf>, EchoNotesError> {
    if !notes_dir.is_dir() {
        return Err(EchoNotesError::Error(format!(
            "Notes directory '{}' does not exist or is not a directory",
            notes_dir.display()
        )));
    }

    let mut notes = Vec::new();
    for entry in fs::read_dir(notes_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == NOTE_EXTENSION) {
            notes.push(path);
        }
    }
    notes.sort();
    Ok(notes)
}

/// Timestamp embedded as `SUMMARY (YYYY-MM-DD HH:MM)` in a note body
fn extract_summary_timestamp(text: &str) -> Option<NaiveDateTime> {
    let caps = SUMMARY_TIMESTAMP.captures(text)?;
    NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M").ok()
}

/// Note contents, or `None` with a warning if the file can't be read as UTF-8 text.
/// One unreadable note must not stall the notes after it.
fn read_note(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Skipping unreadable note {}: {}", path.display(), e);
            None
        }
    }
}

/// Date of a note: the embedded summary timestamp, else the file's mtime
fn note_date(path: &Path, text: &str) -> Result<NaiveDateTime, EchoNotesError> {
    if let Some(ts) = extract_summary_timestamp(text) {
        return Ok(ts);
    }
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified).naive_local())
}

/// Cleans up every unprocessed note in the notes directory with the LLM
pub struct NoteProcessor {
    notes_dir: PathBuf,
    llm: Arc<dyn LlmClient>,
    prompt: String,
}

impl NoteProcessor {
    pub fn new(
        notes_dir: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        prompt: impl Into<String>,
    ) -> Self {
        NoteProcessor {
            notes_dir: notes_dir.into(),
            llm,
            prompt: prompt.into(),
        }
    }

    /// Process one note. Returns false if the note was already processed.
    fn process_note(&self, path: &Path, text: &str) -> Result<bool, EchoNotesError> {
        if is_processed_note(text) {
            return Ok(false);
        }

        debug!("Processing note {}", path.display());
        let mut processed = self.llm.complete(text, &self.prompt)?;
        if !is_processed_note(&processed) {
            processed = format!("## {}\n\n{}", PROCESSED_MARKER, processed);
        }
        fs::write(path, processed)?;
        Ok(true)
    }
}

impl Job for NoteProcessor {
    fn name(&self) -> &str {
        "note processing"
    }

    fn run(&self) -> Result<(), EchoNotesError> {
        let mut processed = 0;
        let mut skipped = 0;
        let mut unreadable = 0;

        for path in list_notes(&self.notes_dir)? {
            if is_weekly_summary(&path) {
                continue;
            }
            let Some(text) = read_note(&path) else {
                unreadable += 1;
                continue;
            };
            if self.process_note(&path, &text)? {
                processed += 1;
            } else {
                skipped += 1;
            }
        }

        info!(
            "Processed {} note(s), {} already processed, {} unreadable, in {}",
            processed,
            skipped,
            unreadable,
            self.notes_dir.display()
        );
        Ok(())
    }
}

/// Aggregates the last week of notes into a weekly digest
pub struct SummaryGenerator {
    notes_dir: PathBuf,
    llm: Arc<dyn LlmClient>,
    prompt: String,
    clock: Arc<dyn Clock>,
}

impl SummaryGenerator {
    pub fn new(
        notes_dir: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        prompt: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SummaryGenerator {
            notes_dir: notes_dir.into(),
            llm,
            prompt: prompt.into(),
            clock,
        }
    }

    fn collect_recent(&self, now: NaiveDateTime) -> Result<Vec<String>, EchoNotesError> {
        let cutoff = now - Duration::days(RECENT_DAYS);
        let mut collected = Vec::new();

        for path in list_notes(&self.notes_dir)? {
            if is_weekly_summary(&path) {
                continue;
            }
            let Some(text) = read_note(&path) else {
                continue;
            };
            if note_date(&path, &text)? > cutoff {
                collected.push(text);
            }
        }
        Ok(collected)
    }

    pub fn summary_path(&self, now: NaiveDateTime) -> PathBuf {
        self.notes_dir.join(format!(
            "{} - {}.md",
            WEEKLY_SUMMARY_PREFIX,
            now.format("%Y-%m-%d")
        ))
    }
}

impl Job for SummaryGenerator {
    fn name(&self) -> &str {
        "summary generation"
    }

    fn run(&self) -> Result<(), EchoNotesError> {
        let now = self.clock.now();
        let collected = self.collect_recent(now)?;

        if collected.is_empty() {
            info!(
                "No notes from the last {} days in {}, skipping weekly summary",
                RECENT_DAYS,
                self.notes_dir.display()
            );
            return Ok(());
        }

        let summary = self.llm.complete(&collected.join("\n\n"), &self.prompt)?;
        let output = self.summary_path(now);
        fs::write(&output, summary)?;
        info!(
            "Wrote weekly summary of {} note(s) to {}",
            collected.len(),
            output.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::ManualClock;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every prompt and answers with a canned reply
    struct FakeLlm {
        reply: Result<String, String>,
        prompts: Mutex<Vec<(String, String)>>,
    }

    impl FakeLlm {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(FakeLlm {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(FakeLlm {
                reply: Err("timed out".to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<(String, String)> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl LlmClient for FakeLlm {
        fn complete(&self, prompt: &str, system: &str) -> Result<String, EchoNotesError> {
            self.prompts
                .lock()
                .unwrap()
                .push((prompt.to_string(), system.to_string()));
            self.reply.clone().map_err(EchoNotesError::Llm)
        }
    }

    const CLEANUP: &str = "Clean up this note.";
    const DIGEST: &str = "Summarize this week.";

    fn today() -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn summary_generator(dir: &Path, llm: Arc<FakeLlm>, now: NaiveDateTime) -> SummaryGenerator {
        SummaryGenerator::new(dir, llm, DIGEST, Arc::new(ManualClock::new(now)))
    }

    #[test]
    fn test_processes_only_unprocessed_markdown_notes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "raw thoughts").unwrap();
        fs::write(
            dir.path().join("b.md"),
            format!("## {}\n\nalready done", PROCESSED_MARKER),
        )
        .unwrap();
        fs::write(dir.path().join("c.txt"), "not a note").unwrap();
        fs::write(dir.path().join("Weekly Summary - 2024-01-07.md"), "digest").unwrap();

        let llm = FakeLlm::replying("## CLEANED & STRUCTURED NOTES\n\n- tidy thoughts");
        let processor = NoteProcessor::new(dir.path(), llm.clone(), CLEANUP);
        processor.run().unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "raw thoughts");
        assert_eq!(prompts[0].1, CLEANUP);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.md")).unwrap(),
            "## CLEANED & STRUCTURED NOTES\n\n- tidy thoughts"
        );
        assert_eq!(fs::read_to_string(dir.path().join("c.txt")).unwrap(), "not a note");
    }

    #[test]
    fn test_unreadable_note_does_not_block_the_rest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), [0xffu8, 0xfe]).unwrap();
        fs::write(dir.path().join("b.md"), "raw thoughts").unwrap();

        let llm = FakeLlm::replying("## CLEANED & STRUCTURED NOTES\n\n- tidy thoughts");
        NoteProcessor::new(dir.path(), llm.clone(), CLEANUP)
            .run()
            .unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "raw thoughts");
        assert!(is_processed_note(
            &fs::read_to_string(dir.path().join("b.md")).unwrap()
        ));
        assert_eq!(fs::read(dir.path().join("a.md")).unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn test_configured_prompts_are_sent_to_the_llm() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "raw thoughts").unwrap();
        let now = today();

        let llm = FakeLlm::replying("## CLEANED & STRUCTURED NOTES\n\n- tidy");
        NoteProcessor::new(dir.path(), llm.clone(), "Rewrite as terse bullets.")
            .run()
            .unwrap();
        SummaryGenerator::new(
            dir.path(),
            llm.clone(),
            "List this week's decisions.",
            Arc::new(ManualClock::new(now)),
        )
        .run()
        .unwrap();

        let systems: Vec<String> = llm.prompts().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            systems,
            vec![
                "Rewrite as terse bullets.".to_string(),
                "List this week's decisions.".to_string()
            ]
        );
    }

    #[test]
    fn test_processing_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "raw thoughts").unwrap();

        // Model forgets the heading; the marker is added so the note isn't reprocessed
        let llm = FakeLlm::replying("tidy thoughts");
        let processor = NoteProcessor::new(dir.path(), llm.clone(), CLEANUP);
        processor.run().unwrap();
        processor.run().unwrap();

        assert_eq!(llm.prompts().len(), 1);
        let text = fs::read_to_string(dir.path().join("a.md")).unwrap();
        assert!(is_processed_note(&text));
        assert!(text.ends_with("tidy thoughts"));
    }

    #[test]
    fn test_processing_failure_leaves_note_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "raw thoughts").unwrap();

        let processor = NoteProcessor::new(dir.path(), FakeLlm::failing(), CLEANUP);
        assert!(processor.run().is_err());
        assert_eq!(fs::read_to_string(dir.path().join("a.md")).unwrap(), "raw thoughts");
    }

    #[test]
    fn test_missing_notes_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let processor =
            NoteProcessor::new(dir.path().join("nope"), FakeLlm::replying("x"), CLEANUP);
        assert!(processor.run().is_err());
    }

    #[test]
    fn test_extract_summary_timestamp() {
        let text = "# Notes\nSUMMARY (2024-01-05 09:30)\nstuff";
        assert_eq!(
            extract_summary_timestamp(text),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap().and_hms_opt(9, 30, 0)
        );
        assert_eq!(extract_summary_timestamp("SUMMARY (2024-13-45 99:99)"), None);
        assert_eq!(extract_summary_timestamp("no stamp here"), None);
    }

    #[test]
    fn test_summary_collects_recent_notes() {
        let dir = TempDir::new().unwrap();
        let now = today();
        let old_stamp = (now - Duration::days(10)).format("%Y-%m-%d %H:%M");
        let recent_stamp = (now - Duration::days(2)).format("%Y-%m-%d %H:%M");

        fs::write(dir.path().join("a.md"), format!("SUMMARY ({})\nold", old_stamp)).unwrap();
        fs::write(
            dir.path().join("b.md"),
            format!("SUMMARY ({})\nrecent", recent_stamp),
        )
        .unwrap();
        // No stamp: falls back to mtime, which is now
        fs::write(dir.path().join("c.md"), "fresh").unwrap();
        fs::write(dir.path().join("Weekly Summary - old.md"), "previous digest").unwrap();

        let llm = FakeLlm::replying("the digest");
        let generator = summary_generator(dir.path(), llm.clone(), now);
        generator.run().unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, format!("SUMMARY ({})\nrecent\n\nfresh", recent_stamp));
        assert_eq!(prompts[0].1, DIGEST);
        assert_eq!(
            fs::read_to_string(generator.summary_path(now)).unwrap(),
            "the digest"
        );
    }

    #[test]
    fn test_summary_skips_unreadable_notes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), [0xffu8, 0xfe]).unwrap();
        fs::write(dir.path().join("b.md"), "fresh").unwrap();
        let now = today();

        let llm = FakeLlm::replying("the digest");
        let generator = summary_generator(dir.path(), llm.clone(), now);
        generator.run().unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "fresh");
        assert_eq!(
            fs::read_to_string(generator.summary_path(now)).unwrap(),
            "the digest"
        );
    }

    #[test]
    fn test_summary_without_recent_notes_skips_llm() {
        let dir = TempDir::new().unwrap();
        let now = today();
        let old_stamp = (now - Duration::days(30)).format("%Y-%m-%d %H:%M");
        fs::write(dir.path().join("a.md"), format!("SUMMARY ({})\nold", old_stamp)).unwrap();

        let llm = FakeLlm::replying("unused");
        let generator = summary_generator(dir.path(), llm.clone(), now);
        generator.run().unwrap();

        assert!(llm.prompts().is_empty());
        assert!(!generator.summary_path(now).exists());
    }

    #[test]
    fn test_summary_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "fresh").unwrap();
        let now = today();

        let generator = summary_generator(dir.path(), FakeLlm::failing(), now);
        assert!(generator.run().is_err());
        assert!(!generator.summary_path(now).exists());
    }

    #[test]
    fn test_summary_file_name() {
        let now = NaiveDate::from_ymd_opt(2024, 1, 7)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let generator = summary_generator(Path::new("/notes"), FakeLlm::replying("x"), now);
        assert_eq!(
            generator.summary_path(now),
            PathBuf::from("/notes/Weekly Summary - 2024-01-07.md")
        );
    }
}
