//! A scripted executor for tests, analogous to the teacher's
//! `MockAuditSource`: replays preconfigured responses per host instead of
//! opening a real WinRM session.

use super::{Credentials, ExecutionOutput, RemoteExecutor};
use crate::error::{Result, SentinelError};
use crate::model::HostTarget;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted response for a given host: either a successful output or a
/// transport failure, optionally after an artificial delay (used by the
/// concurrency-cap test, scenario S6).
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(ExecutionOutput),
    TransportError(String),
}

pub struct MockExecutor {
    responses: Mutex<HashMap<String, Vec<ScriptedResponse>>>,
    delay: Duration,
    connect_failures: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            connect_failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Queues a response to return the next time `host` is executed
    /// against. Responses for a host are consumed in FIFO order.
    pub fn push(&self, host: &str, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .push(response);
    }

    pub fn push_stdout(&self, host: &str, stdout: impl Into<Vec<u8>>) {
        self.push(
            host,
            ScriptedResponse::Output(ExecutionOutput {
                stdout: stdout.into(),
                stderr: Vec::new(),
                status: 0,
            }),
        );
    }

    pub fn fail_connect(&self, host: &str, times: usize) {
        self.connect_failures
            .lock()
            .unwrap()
            .insert(host.to_string(), times);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteExecutor for MockExecutor {
    fn connect(&self, target: &HostTarget, _credentials: &Credentials) -> Result<()> {
        let mut failures = self.connect_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&target.ip) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SentinelError::Transport {
                    host: target.ip.clone(),
                    message: "mock connect failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        target: &HostTarget,
        credentials: &Credentials,
        _script: &str,
    ) -> Result<ExecutionOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.connect(target, credentials)?;

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut responses = self.responses.lock().unwrap();
        let queue = responses.entry(target.ip.clone()).or_default();

        if queue.is_empty() {
            return Ok(ExecutionOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                status: 0,
            });
        }

        match queue.remove(0) {
            ScriptedResponse::Output(out) => Ok(out),
            ScriptedResponse::TransportError(message) => Err(SentinelError::Transport {
                host: target.ip.clone(),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_queued_responses_in_order() {
        let exec = MockExecutor::new();
        exec.push_stdout("10.0.0.1", b"first".to_vec());
        exec.push_stdout("10.0.0.1", b"second".to_vec());

        let target = HostTarget {
            ip: "10.0.0.1".to_string(),
            port: 5985,
            transport: Default::default(),
            timeout: 120,
            credentials: None,
        };
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };

        let first = exec.execute(&target, &creds, "script").unwrap();
        assert_eq!(first.stdout, b"first");
        let second = exec.execute(&target, &creds, "script").unwrap();
        assert_eq!(second.stdout, b"second");
    }

    #[test]
    fn transport_error_is_retriable() {
        let err = SentinelError::Transport {
            host: "h".into(),
            message: "boom".into(),
        };
        assert!(super::super::is_retriable(&err));
    }
}
