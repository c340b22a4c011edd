//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::backend::CommandRunner;
use crate::console::ConsoleSession;
use crate::control::ControlChannel;
use crate::error::{ConsoleError, ControlError, Result};

/// Scripted console session: `expect` pops pre-queued outcomes in order,
/// sent lines and interrupts are recorded for assertions.
pub(crate) struct ScriptedConsole {
    expects: VecDeque<ExpectOutcome>,
    sent: Vec<String>,
    interrupts: usize,
    before: String,
}

enum ExpectOutcome {
    Match(Option<String>),
    Scan(String),
    Fail(String),
}

impl ScriptedConsole {
    pub(crate) fn new() -> Self {
        Self {
            expects: VecDeque::new(),
            sent: Vec::new(),
            interrupts: 0,
            before: String::new(),
        }
    }

    /// Queue an `expect` outcome: `Some(text)` for a match, `None` for a
    /// timeout.
    pub(crate) fn expect_returns(mut self, outcome: Option<String>) -> Self {
        self.expects.push_back(ExpectOutcome::Match(outcome));
        self
    }

    /// Queue raw output for the next `expect` to scan with its pattern, the
    /// way a real transport searches its stream (echoed input included).
    pub(crate) fn expect_scans(mut self, output: impl Into<String>) -> Self {
        self.expects.push_back(ExpectOutcome::Scan(output.into()));
        self
    }

    /// Queue a transport failure for the next `expect`.
    pub(crate) fn expect_fails(mut self, reason: &str) -> Self {
        self.expects
            .push_back(ExpectOutcome::Fail(reason.to_string()));
        self
    }

    /// Set the buffer `before()` reports.
    pub(crate) fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = before.into();
        self
    }

    pub(crate) fn sent_lines(&self) -> &[String] {
        &self.sent
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts
    }
}

#[async_trait]
impl ConsoleSession for ScriptedConsole {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.sent.push(line.to_string());
        Ok(())
    }

    async fn expect(&mut self, pattern: &Regex, _timeout: Duration) -> Result<Option<String>> {
        match self.expects.pop_front() {
            Some(ExpectOutcome::Match(outcome)) => Ok(outcome),
            Some(ExpectOutcome::Scan(output)) => {
                Ok(pattern.find(&output).map(|m| m.as_str().to_string()))
            }
            Some(ExpectOutcome::Fail(reason)) => Err(ConsoleError::Transport(reason).into()),
            None => Ok(None),
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.interrupts += 1;
        Ok(())
    }

    fn before(&self) -> &str {
        &self.before
    }
}

/// Command runner double: records every argv and answers through a handler.
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    handler: Box<dyn Fn(&[&str]) -> Result<String> + Send + Sync>,
}

impl FakeRunner {
    pub(crate) fn new(
        handler: impl Fn(&[&str]) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[&str]) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(argv.iter().map(ToString::to_string).collect());
        (self.handler)(argv)
    }
}

/// Control channel double answering `dev_get_parameter("ALid")`.
pub(crate) struct FakeControl {
    pub(crate) alid: String,
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn dev_get_parameter(&self, name: &str) -> Result<String> {
        if name.eq_ignore_ascii_case("ALid") {
            Ok(self.alid.clone())
        } else {
            Err(ControlError::MissingParameter(name.to_string()).into())
        }
    }

    async fn cmd_reply(&self, command: &str) -> Result<String> {
        Ok(format!("echo,{command}"))
    }

    async fn dev_send_1905(
        &self,
        _dest_mac: &str,
        _message_type: u16,
        _tlvs: &str,
    ) -> Result<String> {
        Ok("mid,0x1".to_string())
    }

    async fn start_wps_registration(&self, _band: &str) -> Result<String> {
        Ok(String::new())
    }
}
