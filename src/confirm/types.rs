use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// Field name -> proposed value, in the order the fields were proposed
pub type ChangeSet = Map<String, Value>;

/// A mutation proposed by the agent, awaiting human approval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChange {
    /// Correlation id carried by the confirmation URL
    pub id: String,
    /// Platform object the change applies to
    pub target_id: String,
    pub changes: ChangeSet,
    pub requested_at: DateTime<Utc>,
}

impl PendingChange {
    pub fn new(id: String, target_id: String, changes: ChangeSet) -> Self {
        Self {
            id,
            target_id,
            changes,
            requested_at: Utc::now(),
        }
    }
}

/// Decision recorded when a human approves a pending change
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfirmationResult {
    pub approved: bool,
    pub decided_at: DateTime<Utc>,
}

/// Status of a correlation id as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    /// Armed, waiting for the human
    Pending { expires_at: DateTime<Utc> },
    /// Approved and not yet applied
    Approved { decided_at: DateTime<Utc> },
    /// Overwritten by a newer change, cleared, or never armed
    Stale,
    /// Armed but not approved within its TTL
    Expired,
}

/// Result of an approval attempt from the confirmation page
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved(ConfirmationResult),
    /// The change was approved earlier; nothing happened
    AlreadyApproved(ConfirmationResult),
    Stale,
    Expired,
    InvalidCapability,
    ChangesMismatch,
}

/// A freshly armed confirmation
#[derive(Debug, Clone)]
pub struct ArmedConfirmation {
    pub id: String,
    pub url: Url,
    pub expires_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfirmError {
    #[error("Confirmation {0} is stale: it was replaced by a newer change or already cleared")]
    Stale(String),

    #[error("Confirmation {0} expired before it was approved")]
    Expired(String),

    #[error("Confirmation {0} is still awaiting human approval")]
    Pending(String),

    #[error("Change-set does not match the pending confirmation")]
    ChangesMismatch,

    #[error("Confirmation URL would be {len} characters; the limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Change-set is empty")]
    EmptyChangeSet,

    #[error("Failed to build confirmation URL: {0}")]
    InvalidUrl(String),
}
