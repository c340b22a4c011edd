//! Log-synchronized waiting over file-backed logs.
//!
//! The agent and controller processes under test append to their log files
//! independently of the test driver. `wait_for` is the synchronization
//! primitive: poll the log until a pattern appears after a known line offset,
//! or give up at the deadline.
//!
//! ## Offset contract
//!
//! Lines are 0-indexed and `start_line` is exclusive: a line at index
//! `<= start_line` is never considered, whatever its content. A caller that
//! persists the matched line and passes it back on the next wait will never
//! re-match the same occurrence. On timeout the caller's `start_line` is
//! echoed back unchanged so the next wait is unaffected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Fixed interval between full log re-reads.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Outcome of a `wait_for` call on either log source variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogWait {
    /// Pattern found; `line` is the absolute 0-indexed line of the match.
    Matched {
        line: usize,
        /// Captured groups, in pattern order (group 1 first).
        groups: Vec<Option<String>>,
    },
    /// Deadline expired (or the log was unreadable); `last_line` echoes the
    /// `start_line` the caller passed in.
    TimedOut { last_line: usize },
}

impl LogWait {
    /// Whether the pattern was found.
    #[must_use]
    pub fn found(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    /// Matched line on success, echoed start line on timeout. Either way the
    /// value is safe to pass as the next wait's `start_line`.
    #[must_use]
    pub fn line(&self) -> usize {
        match self {
            Self::Matched { line, .. } => *line,
            Self::TimedOut { last_line } => *last_line,
        }
    }

    /// Captured group `index` (1-based, like regex group numbering).
    #[must_use]
    pub fn group(&self, index: usize) -> Option<&str> {
        match self {
            Self::Matched { groups, .. } => index
                .checked_sub(1)
                .and_then(|i| groups.get(i))
                .and_then(|g| g.as_deref()),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Find the first line strictly after `start_line` whose text matches
/// `pattern` (regex search, not full match).
///
/// Both log source variants apply this identically so test assertions are
/// backend-independent. Returns the absolute line index and captured groups.
pub fn find_after<'a, I>(
    pattern: &Regex,
    lines: I,
    start_line: usize,
) -> Option<(usize, Vec<Option<String>>)>
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    for (index, text) in lines {
        if index <= start_line {
            continue;
        }
        if let Some(caps) = pattern.captures(text) {
            let groups = caps
                .iter()
                .skip(1)
                .map(|m| m.map(|g| g.as_str().to_string()))
                .collect();
            return Some((index, groups));
        }
    }
    None
}

/// Extract capture groups from a single already-matched line.
pub(crate) fn groups_of(pattern: &Regex, text: &str) -> Vec<Option<String>> {
    pattern
        .captures(text)
        .map(|caps| {
            caps.iter()
                .skip(1)
                .map(|m| m.map(|g| g.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// File-backed log source.
///
/// Reads a log file from a shared filesystem location. The file is opened
/// fresh on every poll attempt and scanned from the top, which tolerates the
/// file being truncated, rotated, or symlink-swapped between polls.
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
    poll_interval: Duration,
    pointer_record: bool,
}

impl FileLog {
    /// Create a file log source for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: POLL_INTERVAL,
            pointer_record: false,
        }
    }

    /// Enable pointer-record resolution for storage that does not support the
    /// "current log file" symlink convention. The nominal file then ends with
    /// a record naming the real log file (a sibling path), and that name is
    /// read before every open.
    #[must_use]
    pub fn with_pointer_record(mut self, enabled: bool) -> Self {
        self.pointer_record = enabled;
        self
    }

    /// Override the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Path of the nominal log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll the log until `pattern` appears after `start_line` or `timeout`
    /// elapses.
    ///
    /// A missing or unreadable log is evidence of absence of the expected
    /// event, not a defect: I/O failures are logged and reported as
    /// `TimedOut`, preserving the same caller contract as a transient
    /// non-match.
    pub async fn wait_for(&self, pattern: &Regex, start_line: usize, timeout: Duration) -> LogWait {
        let deadline = Instant::now() + timeout;
        loop {
            match self.scan(pattern, start_line).await {
                Ok(Some((line, groups))) => {
                    debug!(
                        path = %self.path.display(),
                        pattern = pattern.as_str(),
                        line,
                        "log pattern found"
                    );
                    return LogWait::Matched { line, groups };
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "log unreadable; reporting not-found"
                    );
                    return LogWait::TimedOut {
                        last_line: start_line,
                    };
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    path = %self.path.display(),
                    pattern = pattern.as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    "log pattern not found before deadline"
                );
                return LogWait::TimedOut {
                    last_line: start_line,
                };
            }
            sleep(self.poll_interval).await;
        }
    }

    /// One full read-and-scan pass from the top of the file.
    async fn scan(
        &self,
        pattern: &Regex,
        start_line: usize,
    ) -> std::io::Result<Option<(usize, Vec<Option<String>>)>> {
        let path = if self.pointer_record {
            self.resolve_pointer().await?
        } else {
            self.path.clone()
        };
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(find_after(pattern, content.lines().enumerate(), start_line))
    }

    /// Resolve the pointer record: the last non-empty line of the nominal
    /// file names the current log file, relative to the same directory.
    async fn resolve_pointer(&self) -> std::io::Result<PathBuf> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let name = content
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("empty pointer record in {}", self.path.display()),
                )
            })?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        Ok(dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn re(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    #[test]
    fn find_after_matches_first_occurrence() {
        let lines = ["a", "start", "EVENT X"];
        let found = find_after(&re("EVENT X"), lines.iter().map(|s| *s).enumerate(), 0);
        assert_eq!(found, Some((2, vec![])));
    }

    #[test]
    fn find_after_never_reconsiders_offset_lines() {
        let lines = ["a", "start", "EVENT X"];
        // start_line equal to the previous match is idempotent
        let found = find_after(&re("EVENT X"), lines.iter().map(|s| *s).enumerate(), 2);
        assert_eq!(found, None);
        // even content before the offset is invisible
        let found = find_after(&re("start"), lines.iter().map(|s| *s).enumerate(), 1);
        assert_eq!(found, None);
    }

    #[test]
    fn find_after_is_search_not_full_match() {
        let lines = ["", "prefix EVENT AP-STA-CONNECTED 51:a1:10:20:00:00 suffix"];
        let found = find_after(
            &re(r"EVENT AP-STA-CONNECTED (\S+)"),
            lines.iter().map(|s| *s).enumerate(),
            0,
        );
        let (line, groups) = found.unwrap();
        assert_eq!(line, 1);
        assert_eq!(groups, vec![Some("51:a1:10:20:00:00".to_string())]);
    }

    #[test]
    fn find_after_matches_strictly_later_occurrence() {
        let lines = ["EVENT X", "noise", "EVENT X"];
        let found = find_after(&re("EVENT X"), lines.iter().map(|s| *s).enumerate(), 0);
        assert_eq!(found.unwrap().0, 2);
    }

    #[test]
    fn log_wait_accessors() {
        let matched = LogWait::Matched {
            line: 7,
            groups: vec![Some("g1".to_string()), None],
        };
        assert!(matched.found());
        assert_eq!(matched.line(), 7);
        assert_eq!(matched.group(1), Some("g1"));
        assert_eq!(matched.group(2), None);
        assert_eq!(matched.group(0), None);

        let timed_out = LogWait::TimedOut { last_line: 3 };
        assert!(!timed_out.found());
        assert_eq!(timed_out.line(), 3);
        assert_eq!(timed_out.group(1), None);
    }

    fn write_log(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_finds_existing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "mesh_agent.log", "a\nstart\nEVENT X\n");
        let log = FileLog::new(&path);

        let wait = log
            .wait_for(&re("EVENT X"), 0, Duration::from_secs(1))
            .await;
        assert_eq!(
            wait,
            LogWait::Matched {
                line: 2,
                groups: vec![]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_timeout_echoes_start_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "mesh_agent.log", "a\nstart\nEVENT X\n");
        let log = FileLog::new(&path);

        // no new lines after the previous match: not-found, offset unchanged
        let wait = log
            .wait_for(&re("EVENT X"), 2, Duration::from_secs(1))
            .await;
        assert_eq!(wait, LogWait::TimedOut { last_line: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path().join("never_created.log"));

        let wait = log
            .wait_for(&re("anything"), 0, Duration::from_secs(5))
            .await;
        assert_eq!(wait, LogWait::TimedOut { last_line: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_bounded_by_timeout_plus_one_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "mesh_controller.log", "nothing here\n");
        let log = FileLog::new(&path);

        let timeout = Duration::from_secs(2);
        let started = Instant::now();
        let wait = log.wait_for(&re("absent"), 0, timeout).await;
        let elapsed = started.elapsed();

        assert!(!wait.found());
        assert!(
            elapsed <= timeout + POLL_INTERVAL,
            "waited {elapsed:?} for a {timeout:?} timeout"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sees_lines_appended_while_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "mesh_agent_wlan0.log", "boot\n");
        let log = FileLog::new(&path);

        let appender_path = path.clone();
        let appender = tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&appender_path)
                .unwrap();
            writeln!(file, "EVENT AP-STA-CONNECTED 51:a1:10:20:00:01").unwrap();
        });

        let wait = log
            .wait_for(
                &re(r"EVENT AP-STA-CONNECTED (\S+)"),
                0,
                Duration::from_secs(10),
            )
            .await;
        appender.await.unwrap();

        assert_eq!(wait.line(), 1);
        assert_eq!(wait.group(1), Some("51:a1:10:20:00:01"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_tolerates_file_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, "mesh_agent.log", "old line 0\nold line 1\n");
        let log = FileLog::new(&path);

        let rotate_path = path.clone();
        let rotator = tokio::spawn(async move {
            sleep(Duration::from_millis(400)).await;
            // rotation: the whole file is replaced, shorter than before
            std::fs::write(&rotate_path, "fresh 0\nEVENT ROTATED\n").unwrap();
        });

        let wait = log
            .wait_for(&re("EVENT ROTATED"), 0, Duration::from_secs(10))
            .await;
        rotator.await.unwrap();

        assert_eq!(wait.line(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_record_resolves_indirection() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir, "mesh_agent.log.1", "a\nEVENT VIA POINTER\n");
        let nominal = write_log(&dir, "mesh_agent.log", "rotated\nmesh_agent.log.1\n");

        let log = FileLog::new(&nominal).with_pointer_record(true);
        let wait = log
            .wait_for(&re("EVENT VIA POINTER"), 0, Duration::from_secs(1))
            .await;
        assert_eq!(wait.line(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_record_empty_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let nominal = write_log(&dir, "mesh_agent.log", "\n\n");

        let log = FileLog::new(&nominal).with_pointer_record(true);
        let wait = log
            .wait_for(&re("anything"), 0, Duration::from_secs(1))
            .await;
        assert_eq!(wait, LogWait::TimedOut { last_line: 0 });
    }
}
