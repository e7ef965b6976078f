//! Retrying fallible async operations

use crate::Result;
use std::{future::Future, time::Duration};

/// Runs an operation up to `max_attempts` times with a fixed delay in between
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    pub max_attempts: usize,
    pub delay: Duration,
}
impl Retrier {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
    /// Returns the first success or the last error
    pub async fn run<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    log::warn!(
                        "attempt {attempt}/{} failed: {e}. Retrying in {:?}.",
                        self.max_attempts,
                        self.delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
