//! Console-backed log waiting over an interactive session.
//!
//! Some devices are reachable only through a line-oriented console (serial or
//! ssh), with no direct filesystem access from the test driver. The log is
//! tailed remotely and matches surface through pattern expectation on the
//! session's output stream.
//!
//! The console transport is stateful: one prompt, one match buffer, at most
//! one outstanding command. Every operation here takes the session lock for
//! its whole exchange and leaves the console back at its idle prompt before
//! returning, on every exit path. Breaking that invariant corrupts all
//! subsequent console interactions for the entity.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ConsoleError, Error, Result};
use crate::logwatch::{LogWait, groups_of};

/// Idle prompt marker of the remote device shell.
pub const PROMPT: &str = ":/#";

/// How long to wait for the prompt to return after an interrupt or a plain
/// command.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Compiled prompt pattern, shared by every console exchange.
pub static PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&regex::escape(PROMPT)).unwrap_or_else(|_| unreachable!()));

/// Leading `<number>:` prefix of `grep -n` output, anchored to an uppercase
/// content character. The console echoes the command just sent, and a station
/// MAC inside it is full of digit-colon sequences; bare `[0-9]+:` would match
/// the echo before the real reply.
static GREP_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+):[A-Z]").unwrap_or_else(|_| unreachable!()));

/// Line-oriented interactive transport to a remote device.
///
/// The transport itself (serial, ssh, telnet) is an external collaborator;
/// this trait is the send-line / expect-pattern / read-buffer surface the
/// harness assumes. Test doubles implement it with scripted responses.
#[async_trait]
pub trait ConsoleSession: Send {
    /// Send one command line, terminated by the transport.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Read output until `pattern` matches or `timeout` elapses.
    ///
    /// Returns `Ok(Some(matched_text))` on a match, `Ok(None)` on timeout.
    /// `Err` is reserved for transport failures.
    async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<Option<String>>;

    /// Send an interrupt (Ctrl-C) to the remote foreground process.
    async fn interrupt(&mut self) -> Result<()>;

    /// Everything read before the most recent match.
    fn before(&self) -> &str;
}

/// Shared handle to a console session. One session per device; the mutex
/// enforces the one-outstanding-command rule.
pub type SharedConsole = Arc<Mutex<dyn ConsoleSession>>;

/// Console-backed log source.
///
/// Same `wait_for` contract as [`crate::logwatch::FileLog`], distinct
/// mechanics: a remote `tail -f` streams the log through the console, and the
/// absolute line number of a match is recovered afterwards with a remote
/// `grep -n`.
pub struct ConsoleLog {
    session: SharedConsole,
    path: String,
}

impl ConsoleLog {
    /// Create a console log source for the remote file at `path`.
    #[must_use]
    pub fn new(session: SharedConsole, path: impl Into<String>) -> Self {
        Self {
            session,
            path: path.into(),
        }
    }

    /// Remote path of the log file.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for `pattern` to appear after `start_line` within `timeout`.
    ///
    /// Transport failures are logged and reported as `TimedOut`, matching the
    /// file-backed contract. Whatever happens, the console is resynchronized
    /// to its idle prompt before this returns.
    pub async fn wait_for(&self, pattern: &Regex, start_line: usize, timeout: Duration) -> LogWait {
        let mut session = self.session.lock().await;
        match self
            .wait_locked(&mut *session, pattern, start_line, timeout)
            .await
        {
            Ok(wait) => wait,
            Err(err) => {
                warn!(
                    path = %self.path,
                    pattern = pattern.as_str(),
                    error = %err,
                    "console log wait failed; reporting not-found"
                );
                LogWait::TimedOut {
                    last_line: start_line,
                }
            }
        }
    }

    async fn wait_locked(
        &self,
        session: &mut dyn ConsoleSession,
        pattern: &Regex,
        start_line: usize,
        timeout: Duration,
    ) -> Result<LogWait> {
        // 0-indexed exclusive start_line -> 1-indexed inclusive tail argument
        session
            .send_line(&format!("tail -f -n +{} {}", start_line + 1, self.path))
            .await?;

        // Resync runs before the outcome is inspected: the streaming tail must
        // be interrupted and the prompt recovered on every path, or the next
        // command on this console reads garbage.
        let outcome = session.expect(pattern, timeout).await;
        let resync = resync_to_prompt(session).await;
        let matched = outcome?;
        resync?;

        let Some(matched) = matched else {
            debug!(
                path = %self.path,
                pattern = pattern.as_str(),
                "console pattern not found before deadline"
            );
            return Ok(LogWait::TimedOut {
                last_line: start_line,
            });
        };

        // Recover the absolute line number: tail does not report it. This
        // re-search assumes the matched text is unique and still present at
        // the same position; if the log rotates in between, the number may be
        // wrong. Accepted limitation of the console-only backend.
        session
            .send_line(&format!("grep -n \"{matched}\" {}", self.path))
            .await?;
        let numbered = session
            .expect(&GREP_LINE_RE, timeout)
            .await?
            .ok_or(ConsoleError::Transport(
                "grep produced no numbered line".to_string(),
            ))?;
        // Drain grep output so the console is back at its prompt.
        let prompt = session.expect(&PROMPT_RE, PROMPT_TIMEOUT).await?;
        if prompt.is_none() {
            return Err(ConsoleError::PromptLost.into());
        }

        let line = parse_grep_line(&numbered)?;
        debug!(
            path = %self.path,
            pattern = pattern.as_str(),
            line,
            "console pattern found"
        );
        Ok(LogWait::Matched {
            line,
            groups: groups_of(pattern, &matched),
        })
    }
}

/// Interrupt the streaming command and wait for the idle prompt.
async fn resync_to_prompt(session: &mut dyn ConsoleSession) -> Result<()> {
    session.interrupt().await?;
    match session.expect(&PROMPT_RE, PROMPT_TIMEOUT).await? {
        Some(_) => Ok(()),
        None => Err(ConsoleError::PromptLost.into()),
    }
}

/// Parse the `<number>:` prefix of `grep -n` output into a 0-indexed line.
fn parse_grep_line(numbered: &str) -> Result<usize> {
    let digits = numbered
        .split(':')
        .next()
        .unwrap_or_default()
        .trim()
        .parse::<usize>()
        .map_err(|_| {
            Error::from(ConsoleError::Transport(format!(
                "unparseable grep line number: {numbered:?}"
            )))
        })?;
    // grep -n is 1-indexed; the wait contract is 0-indexed
    digits.checked_sub(1).ok_or_else(|| {
        ConsoleError::Transport(format!("grep reported line 0: {numbered:?}")).into()
    })
}
