//! Bounded-attempt delivery on top of a command channel
//!
//! At-least-once semantics: a command is re-sent until the vehicle answers
//! exactly `ok` or the attempt budget runs out. The delay between attempts is
//! constant. The protocol carries no request id, so a retry after a lost
//! *reply* repeats a command the vehicle may already have executed; movement
//! commands can therefore be applied twice.

use std::time::Duration;
use swarm_shared::channel::{ChannelError, CommandResult, CommandSender};
use swarm_shared::codec::{self, ProtocolError};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Attempt budget, inter-attempt delay and per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration, timeout: Duration) -> Self {
        Self {
            retries,
            delay,
            timeout,
        }
    }

    /// Same timeout, different budget
    pub fn with_retries(&self, retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            timeout: self.timeout,
        }
    }

    /// Send `text` until it is acknowledged with `ok`.
    ///
    /// Returns `Ok(false)` once all attempts are spent. Transport failures end
    /// the loop immediately with `Err`.
    pub async fn send_with_retry<S>(&self, sender: &S, text: &str) -> Result<bool, ChannelError>
    where
        S: CommandSender + ?Sized,
    {
        for attempt in 1..=self.retries {
            let result = sender.send(text, self.timeout).await?;

            if matches!(result.reply(), Some(reply) if codec::is_ok(reply)) {
                info!("'{}' - ok", text);
                return Ok(true);
            }

            warn!(
                "Attempt {}/{}: '{}' -> {}",
                attempt,
                self.retries,
                text,
                describe(&result)
            );

            if attempt < self.retries {
                sleep(self.delay).await;
            }
        }

        error!("Command '{}' failed after {} attempts", text, self.retries);
        Ok(false)
    }

    /// Send a query and parse its reply, retrying timeouts and unparseable
    /// replies within the same budget.
    pub async fn query<S, T, F>(
        &self,
        sender: &S,
        text: &str,
        parse: F,
    ) -> Result<Option<T>, ChannelError>
    where
        S: CommandSender + ?Sized,
        F: Fn(&str) -> Result<T, ProtocolError>,
    {
        for attempt in 1..=self.retries {
            let result = sender.send(text, self.timeout).await?;

            match result.reply().map(&parse) {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(e)) => warn!("Attempt {}/{}: '{}' -> {}", attempt, self.retries, text, e),
                None => warn!(
                    "Attempt {}/{}: '{}' -> {}",
                    attempt,
                    self.retries,
                    text,
                    describe(&result)
                ),
            }

            if attempt < self.retries {
                sleep(self.delay).await;
            }
        }

        error!("Query '{}' unanswered after {} attempts", text, self.retries);
        Ok(None)
    }
}

fn describe(result: &CommandResult) -> String {
    match result {
        CommandResult::Ok(reply) => format!("'{}'", reply),
        CommandResult::Failed(reason) => format!("failed ({})", reason),
        CommandResult::TimedOut => "timed out".into(),
    }
}
