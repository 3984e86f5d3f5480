use std::future;
use std::time::Duration;

use tokio::time::{self, Instant};

/// Countdown that forces session shutdown after a period of control-channel
/// inactivity. Re-armed on every successful line read, suspended entirely
/// while a transfer is running so a slow client is not mistaken for an idle
/// one.
pub struct IdleSupervisor {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl IdleSupervisor {
    /// Starts out suspended; callers arm it before the first read.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// (Re)starts the countdown from now.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    /// Stops the countdown until the next `arm`.
    pub fn suspend(&mut self) {
        self.deadline = None;
    }

    /// Resolves once the armed deadline passes. Pends forever while
    /// suspended.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }
}
