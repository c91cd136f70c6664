//! Bounded retry for deliveries outside the run loop.
//
// Inside a run, the command channel retries transport failures until the
// controller acknowledges. Once the scheduler is shutting down there is no
// loop left to wait on, so the final light-off is delivered here with a fixed
// attempt budget instead.

use crate::link::{Command, DeviceLink, LinkError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Deliver `command` directly over `link`, retrying transport failures.
///
/// Rejections end the attempt immediately. The same command value is resent on
/// every attempt.
///
/// # Errors
/// The last link error once the policy is exhausted, or the rejection.
pub async fn deliver_with_retry(
    link: &dyn DeviceLink,
    command: &Command,
    policy: &RetryPolicy,
) -> Result<(), LinkError> {
    let mut last_error = LinkError::NotConnected;
    for attempt in 1..=policy.max_attempts {
        match link.send_command(command).await {
            Ok(()) => {
                debug!("Delivered {} on attempt {}", command, attempt);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Delivery of {} failed (attempt {}/{}): {}",
                    command, attempt, policy.max_attempts, e
                );
                last_error = e;
                if attempt < policy.max_attempts {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LightPower, MockLink};

    fn light_off() -> Command {
        Command {
            token: 7,
            target: "B3".parse().unwrap(),
            light: LightPower::Off,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let link = MockLink::new();
        link.fail_next_commands(1).await;

        let result = deliver_with_retry(&link, &light_off(), &policy()).await;
        assert!(result.is_ok());

        let received = link.received_commands().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], received[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let link = MockLink::new();
        link.fail_next_commands(5).await;

        let result = deliver_with_retry(&link, &light_off(), &policy()).await;
        assert!(matches!(result, Err(LinkError::ServerFailure(_))));
        assert_eq!(link.received_commands().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let link = MockLink::new();
        link.reject_next_commands(1).await;

        let result = deliver_with_retry(&link, &light_off(), &policy()).await;
        assert!(matches!(result, Err(LinkError::Rejected(_))));
        assert_eq!(link.received_commands().await.len(), 1);
    }
}
