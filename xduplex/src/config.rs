use std::time::Duration;

use crate::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_THREAD_NAME};

/// Tunables for a [`DuplexConnection`](crate::DuplexConnection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long the receiver sleeps when the socket has nothing to read.
    pub poll_interval: Duration,
    /// Prefix for worker thread names; `-send` / `-recv` is appended.
    pub thread_name: String,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub(crate) fn worker_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.thread_name, suffix)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
