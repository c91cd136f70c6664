//! Sync-token command channel.
//!
//! Every outbound command gets a fresh token. The controller echoes the token of
//! the last command it accepted in each status reply, and only a reply carrying
//! the latest issued token counts as current. Issuing a new command therefore
//! supersedes any earlier one: its replies become stale even if they arrive
//! later.
//!
//! Delivery failures reported by the transport are retried until the command is
//! acknowledged. A retry resends the identical [`Command`], token included, so
//! tokens only advance when a new command is issued. A failed command that has
//! already been superseded is not retried, because the newer command carries the
//! full desired device state. Rejections by the controller are surfaced and
//! never retried.

use crate::link::{Command, LightPower, LinkError, Token};
use crate::well::Well;
use tracing::{debug, warn};

/// What to do after a dispatch attempt completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The controller accepted the command.
    Delivered,
    /// The transport failed; resend this exact command.
    Retry(Command),
    /// The transport failed but a newer command has replaced this one.
    Superseded,
    /// The controller refused the command.
    Rejected(String),
}

/// Token source and in-flight command tracker.
#[derive(Debug, Default)]
pub struct CommandChannel {
    last_token: Token,
    latest: Option<Command>,
    retries: u64,
}

impl CommandChannel {
    /// Channel that has issued nothing yet. The first token is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new command with a fresh token; it becomes the in-flight command.
    pub fn issue(&mut self, target: Well, light: LightPower) -> Command {
        self.last_token += 1;
        let command = Command {
            token: self.last_token,
            target,
            light,
        };
        debug!("Issued command {}", command);
        self.latest = Some(command);
        command
    }

    /// Most recently issued command.
    pub fn latest(&self) -> Option<&Command> {
        self.latest.as_ref()
    }

    /// Token of the most recently issued command.
    pub fn latest_token(&self) -> Option<Token> {
        self.latest.map(|c| c.token)
    }

    /// True if `token` belongs to the most recently issued command.
    pub fn is_current(&self, token: Token) -> bool {
        self.latest_token() == Some(token)
    }

    /// Number of retries requested so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Classify the result of delivering `command`.
    pub fn on_dispatch_result(
        &mut self,
        command: &Command,
        result: Result<(), LinkError>,
    ) -> DispatchOutcome {
        match result {
            Ok(()) => {
                debug!("Command {} delivered", command);
                DispatchOutcome::Delivered
            }
            Err(e) if e.is_retryable() => {
                if self.is_current(command.token) {
                    self.retries += 1;
                    debug!("Command {} failed ({}), retrying", command, e);
                    DispatchOutcome::Retry(*command)
                } else {
                    debug!("Command {} failed ({}) but was superseded", command, e);
                    DispatchOutcome::Superseded
                }
            }
            Err(e) => {
                warn!("Command {} rejected: {}", command, e);
                DispatchOutcome::Rejected(e.to_string())
            }
        }
    }
}
