//! Scripted in-memory session for tests. No network involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::session::{CommandOutput, Connector, RemoteEntry, RemoteSession, SshTarget};

struct Rule {
    pattern: String,
    reply: Result<CommandOutput, ConnectionError>,
}

/// Answers commands from substring rules.
///
/// One-shot rules are consumed first, in insertion order; otherwise the most
/// recently added sticky rule whose pattern occurs in the command wins.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedSession {
    once: Mutex<Vec<Rule>>,
    sticky: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    closed: AtomicBool,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, output: CommandOutput) {
        self.push_sticky(pattern, Ok(output));
    }

    pub fn on_error(&self, pattern: &str, error: ConnectionError) {
        self.push_sticky(pattern, Err(error));
    }

    pub fn once(&self, pattern: &str, output: CommandOutput) {
        self.push_once(pattern, Ok(output));
    }

    pub fn once_error(&self, pattern: &str, error: ConnectionError) {
        self.push_once(pattern, Err(error));
    }

    fn push_sticky(&self, pattern: &str, reply: Result<CommandOutput, ConnectionError>) {
        if let Ok(mut rules) = self.sticky.lock() {
            rules.push(Rule { pattern: pattern.to_string(), reply });
        }
    }

    fn push_once(&self, pattern: &str, reply: Result<CommandOutput, ConnectionError>) {
        if let Ok(mut rules) = self.once.lock() {
            rules.push(Rule { pattern: pattern.to_string(), reply });
        }
    }

    /// Every command executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_string(), contents.to_vec());
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().ok()?.get(path).cloned()
    }

    pub fn put_dir(&self, path: &str, entries: Vec<RemoteEntry>) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.insert(path.to_string(), entries);
        }
    }

    /// Simulate the transport dying underneath the manager.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn reply(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        if let Ok(mut once) = self.once.lock() {
            if let Some(idx) = once.iter().position(|r| command.contains(&r.pattern)) {
                return once.remove(idx).reply;
            }
        }
        if let Ok(sticky) = self.sticky.lock() {
            if let Some(rule) = sticky.iter().rev().find(|r| command.contains(&r.pattern)) {
                return rule.reply.clone();
            }
        }
        Ok(CommandOutput::default())
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectionError::ConnectionLost("scripted session closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ConnectionError> {
        self.ensure_open()?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.to_string());
        }
        self.reply(command)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ConnectionError> {
        self.ensure_open()?;
        self.dirs
            .lock()
            .ok()
            .and_then(|d| d.get(path).cloned())
            .ok_or_else(|| ConnectionError::NotFound(path.to_string()))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_open()?;
        self.file(path).ok_or_else(|| ConnectionError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.put_file(path, contents);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out the same scripted session on every connect.
pub struct ScriptedConnector {
    session: Arc<ScriptedSession>,
    connects: AtomicUsize,
    fail: Mutex<Option<ConnectionError>>,
}

impl ScriptedConnector {
    pub fn new(session: Arc<ScriptedSession>) -> Self {
        Self {
            session,
            connects: AtomicUsize::new(0),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, error: ConnectionError) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = Some(error);
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _target: &SshTarget) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        if let Some(error) = self.fail.lock().ok().and_then(|mut f| f.take()) {
            return Err(error);
        }
        self.session.reopen();
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }
}
