pub mod coordinator;
pub mod types;

pub use coordinator::{ConfirmationCoordinator, MAX_CONFIRMATION_URL_LEN};
pub use types::{
    ApprovalOutcome, ArmedConfirmation, ChangeSet, ConfirmError, ConfirmationResult,
    ConfirmationStatus, PendingChange,
};
