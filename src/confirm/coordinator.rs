use super::types::{
    ApprovalOutcome, ArmedConfirmation, ChangeSet, ConfirmError, ConfirmationResult,
    ConfirmationStatus, PendingChange,
};
use crate::callback::CallbackLease;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

/// Longest confirmation URL we hand out; browsers and chat clients truncate beyond this
pub const MAX_CONFIRMATION_URL_LEN: usize = 8000;

/// Default lifetime of an armed confirmation, in seconds
pub const DEFAULT_CONFIRMATION_TTL_SECS: i64 = 30 * 60;

/// Slack past the TTL before the expiry timer checks the slot
const EXPIRY_GRACE: std::time::Duration = std::time::Duration::from_millis(10);

/// The one armed change and its approval state
struct ArmedSlot {
    change: PendingChange,
    /// SHA-256 of the URL capability; taken on approval so it works once
    capability_digest: Option<[u8; 32]>,
    expires_at: DateTime<Utc>,
    decision: Option<ConfirmationResult>,
    /// Keeps the callback server listening while the change is armed;
    /// released once the change expires unapproved
    lease: Option<CallbackLease>,
}

impl ArmedSlot {
    fn is_expired(&self) -> bool {
        self.decision.is_none() && Utc::now() > self.expires_at
    }

    fn release_if_expired(&mut self) {
        if self.is_expired() && self.lease.take().is_some() {
            info!(change_id = %self.change.id, "Confirmation expired; releasing callback server");
        }
    }
}

/// Single-slot approval gate for mutating operations.
///
/// Only one change is armed at a time; arming another replaces it, and any
/// later approval or status check against the replaced id reports stale.
/// `arm`, `approve`, `clear` and `take_approved` are the only mutators.
#[derive(Clone)]
pub struct ConfirmationCoordinator {
    slot: Arc<Mutex<Option<ArmedSlot>>>,
    ttl: Duration,
}

impl Default for ConfirmationCoordinator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_CONFIRMATION_TTL_SECS))
    }
}

impl ConfirmationCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    /// Arm `change` and return the URL a human visits to approve it.
    ///
    /// The URL carries the correlation id, a single-use capability and the
    /// full change-set, so the page needs nothing beyond this slot to render.
    pub async fn arm(
        &self,
        change: PendingChange,
        base_url: &Url,
        lease: Option<CallbackLease>,
    ) -> Result<ArmedConfirmation, ConfirmError> {
        if change.changes.is_empty() {
            return Err(ConfirmError::EmptyChangeSet);
        }

        let capability = new_capability();
        let url = confirmation_url(base_url, &change.id, &capability, &change.changes)?;

        let expires_at = Utc::now() + self.ttl;
        let id = change.id.clone();

        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.as_ref() {
            if previous.decision.is_none() {
                warn!(
                    previous_id = %previous.change.id,
                    new_id = %id,
                    "Replacing unresolved confirmation"
                );
            }
        }

        info!(
            change_id = %id,
            target_id = %change.target_id,
            fields = change.changes.len(),
            "Confirmation armed"
        );

        let holds_lease = lease.is_some();
        *slot = Some(ArmedSlot {
            change,
            capability_digest: Some(digest(&capability)),
            expires_at,
            decision: None,
            lease,
        });
        drop(slot);

        if holds_lease {
            self.schedule_expiry(id.clone(), expires_at);
        }

        Ok(ArmedConfirmation {
            id,
            url,
            expires_at,
        })
    }

    pub async fn status(&self, change_id: &str) -> ConfirmationStatus {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(armed) if armed.change.id == change_id => {
                armed.release_if_expired();
                status_of(armed)
            }
            _ => ConfirmationStatus::Stale,
        }
    }

    pub async fn is_approved(&self, change_id: &str) -> bool {
        matches!(
            self.status(change_id).await,
            ConfirmationStatus::Approved { .. }
        )
    }

    /// The armed change and its status, if `change_id` is current and
    /// `changes` matches what was armed
    pub async fn inspect(
        &self,
        change_id: &str,
        changes: &ChangeSet,
    ) -> Result<(PendingChange, ConfirmationStatus), ConfirmError> {
        let slot = self.slot.lock().await;
        let armed = match slot.as_ref() {
            Some(armed) if armed.change.id == change_id => armed,
            _ => return Err(ConfirmError::Stale(change_id.to_string())),
        };

        if &armed.change.changes != changes {
            return Err(ConfirmError::ChangesMismatch);
        }

        Ok((armed.change.clone(), status_of(armed)))
    }

    /// Record a human approval presented with the URL's capability.
    ///
    /// Approving twice is a no-op that reports the original decision.
    pub async fn approve(
        &self,
        change_id: &str,
        capability: &str,
        changes: &ChangeSet,
    ) -> ApprovalOutcome {
        let mut slot = self.slot.lock().await;
        let armed = match slot.as_mut() {
            Some(armed) if armed.change.id == change_id => armed,
            _ => {
                warn!(change_id = %change_id, "Approval attempted on stale confirmation");
                return ApprovalOutcome::Stale;
            }
        };

        if let Some(decision) = armed.decision {
            return ApprovalOutcome::AlreadyApproved(decision);
        }
        if armed.is_expired() {
            armed.release_if_expired();
            return ApprovalOutcome::Expired;
        }
        if &armed.change.changes != changes {
            warn!(change_id = %change_id, "Approval attempted with altered change-set");
            return ApprovalOutcome::ChangesMismatch;
        }
        if armed.capability_digest != Some(digest(capability)) {
            warn!(change_id = %change_id, "Approval attempted with invalid capability");
            return ApprovalOutcome::InvalidCapability;
        }

        let decision = ConfirmationResult {
            approved: true,
            decided_at: Utc::now(),
        };
        armed.decision = Some(decision);
        armed.capability_digest = None;

        info!(change_id = %change_id, "Confirmation approved");
        ApprovalOutcome::Approved(decision)
    }

    /// Drop the armed change if it is `change_id`; returns whether it was
    pub async fn clear(&self, change_id: &str) -> bool {
        let mut slot = self.slot.lock().await;
        let is_current = slot
            .as_ref()
            .is_some_and(|armed| armed.change.id == change_id);

        if is_current {
            *slot = None;
            info!(change_id = %change_id, "Confirmation cleared");
        }
        is_current
    }

    /// Remove and return the change if it has been approved, so it can be
    /// applied exactly once
    pub async fn take_approved(&self, change_id: &str) -> Result<PendingChange, ConfirmError> {
        let mut slot = self.slot.lock().await;
        let status = match slot.as_ref() {
            Some(armed) if armed.change.id == change_id => status_of(armed),
            _ => return Err(ConfirmError::Stale(change_id.to_string())),
        };

        match status {
            ConfirmationStatus::Approved { .. } => {}
            ConfirmationStatus::Pending { .. } => {
                return Err(ConfirmError::Pending(change_id.to_string()))
            }
            ConfirmationStatus::Expired => {
                *slot = None;
                return Err(ConfirmError::Expired(change_id.to_string()));
            }
            ConfirmationStatus::Stale => return Err(ConfirmError::Stale(change_id.to_string())),
        }

        let armed = slot
            .take()
            .ok_or_else(|| ConfirmError::Stale(change_id.to_string()))?;
        Ok(armed.change)
    }

    /// The currently armed change, if any
    pub async fn current(&self) -> Option<PendingChange> {
        self.slot.lock().await.as_ref().map(|armed| armed.change.clone())
    }

    /// Drop the callback lease of `change_id` if it is still unapproved at
    /// `expires_at`. The slot itself stays so its status reads as expired.
    fn schedule_expiry(&self, change_id: String, expires_at: DateTime<Utc>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let slot: Weak<Mutex<Option<ArmedSlot>>> = Arc::downgrade(&self.slot);
        let wait = (expires_at - Utc::now()).to_std().unwrap_or_default() + EXPIRY_GRACE;

        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(slot) = slot.upgrade() else {
                return;
            };

            let mut slot = slot.lock().await;
            if let Some(armed) = slot.as_mut().filter(|armed| armed.change.id == change_id) {
                armed.release_if_expired();
            }
        });
    }
}

fn status_of(armed: &ArmedSlot) -> ConfirmationStatus {
    match armed.decision {
        Some(decision) => ConfirmationStatus::Approved {
            decided_at: decision.decided_at,
        },
        None if armed.is_expired() => ConfirmationStatus::Expired,
        None => ConfirmationStatus::Pending {
            expires_at: armed.expires_at,
        },
    }
}

fn new_capability() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn digest(capability: &str) -> [u8; 32] {
    Sha256::digest(capability.as_bytes()).into()
}

/// Build `<base>/confirm-update?id=..&token=..&changes=<json>`
pub fn confirmation_url(
    base_url: &Url,
    change_id: &str,
    capability: &str,
    changes: &ChangeSet,
) -> Result<Url, ConfirmError> {
    let changes_json =
        serde_json::to_string(changes).map_err(|e| ConfirmError::InvalidUrl(e.to_string()))?;

    let mut url = base_url
        .join("confirm-update")
        .map_err(|e| ConfirmError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("id", change_id)
        .append_pair("token", capability)
        .append_pair("changes", &changes_json);

    let len = url.as_str().len();
    if len > MAX_CONFIRMATION_URL_LEN {
        return Err(ConfirmError::TooLarge {
            len,
            max: MAX_CONFIRMATION_URL_LEN,
        });
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("http://localhost:8888/").unwrap()
    }

    fn changes(value: serde_json::Value) -> ChangeSet {
        value.as_object().unwrap().clone()
    }

    fn capability_of(url: &Url) -> String {
        url.query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn arm(
        coordinator: &ConfirmationCoordinator,
        id: &str,
        fields: serde_json::Value,
    ) -> ArmedConfirmation {
        let change = PendingChange::new(id.to_string(), "120210".to_string(), changes(fields));
        coordinator.arm(change, &base(), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_arm_embeds_identifiers_and_changes() {
        let coordinator = ConfirmationCoordinator::default();
        let fields = json!({"status": "PAUSED", "bid_amount": 250});
        let armed = arm(&coordinator, "change-1", fields.clone()).await;

        let pairs: std::collections::HashMap<_, _> = armed.url.query_pairs().into_owned().collect();
        assert_eq!(armed.url.path(), "/confirm-update");
        assert_eq!(pairs["id"], "change-1");
        let decoded: ChangeSet = serde_json::from_str(&pairs["changes"]).unwrap();
        assert_eq!(decoded, changes(fields));
        assert!(matches!(
            coordinator.status("change-1").await,
            ConfirmationStatus::Pending { .. }
        ));
    }

    #[tokio::test]
    async fn test_approve_flips_once() {
        let coordinator = ConfirmationCoordinator::default();
        let fields = json!({"status": "PAUSED"});
        let armed = arm(&coordinator, "change-1", fields.clone()).await;
        let token = capability_of(&armed.url);

        assert!(!coordinator.is_approved("change-1").await);

        let first = coordinator.approve("change-1", &token, &changes(fields.clone())).await;
        let decided_at = match first {
            ApprovalOutcome::Approved(result) => result.decided_at,
            other => panic!("Expected Approved, got {:?}", other),
        };
        assert!(coordinator.is_approved("change-1").await);

        let second = coordinator.approve("change-1", &token, &changes(fields)).await;
        match second {
            ApprovalOutcome::AlreadyApproved(result) => assert_eq!(result.decided_at, decided_at),
            other => panic!("Expected AlreadyApproved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rearm_makes_first_stale() {
        let coordinator = ConfirmationCoordinator::default();
        let first_fields = json!({"status": "PAUSED"});
        let first = arm(&coordinator, "first", first_fields.clone()).await;
        arm(&coordinator, "second", json!({"status": "ACTIVE"})).await;

        let outcome = coordinator
            .approve("first", &capability_of(&first.url), &changes(first_fields))
            .await;

        assert_eq!(outcome, ApprovalOutcome::Stale);
        assert_eq!(coordinator.status("first").await, ConfirmationStatus::Stale);
        assert!(!coordinator.is_approved("second").await);
        assert_eq!(
            coordinator.take_approved("first").await,
            Err(ConfirmError::Stale("first".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_capability_rejected() {
        let coordinator = ConfirmationCoordinator::default();
        let fields = json!({"status": "PAUSED"});
        arm(&coordinator, "change-1", fields.clone()).await;

        let outcome = coordinator
            .approve("change-1", "forged", &changes(fields))
            .await;

        assert_eq!(outcome, ApprovalOutcome::InvalidCapability);
        assert!(!coordinator.is_approved("change-1").await);
    }

    #[tokio::test]
    async fn test_altered_changes_rejected() {
        let coordinator = ConfirmationCoordinator::default();
        let armed = arm(&coordinator, "change-1", json!({"bid_amount": 100})).await;

        let outcome = coordinator
            .approve(
                "change-1",
                &capability_of(&armed.url),
                &changes(json!({"bid_amount": 100000})),
            )
            .await;

        assert_eq!(outcome, ApprovalOutcome::ChangesMismatch);
    }

    #[tokio::test]
    async fn test_expired_confirmation() {
        let coordinator = ConfirmationCoordinator::new(Duration::milliseconds(-1));
        let fields = json!({"status": "PAUSED"});
        let armed = arm(&coordinator, "change-1", fields.clone()).await;

        assert_eq!(coordinator.status("change-1").await, ConfirmationStatus::Expired);
        assert_eq!(
            coordinator
                .approve("change-1", &capability_of(&armed.url), &changes(fields))
                .await,
            ApprovalOutcome::Expired
        );
        assert_eq!(
            coordinator.take_approved("change-1").await,
            Err(ConfirmError::Expired("change-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_take_approved_only_once() {
        let coordinator = ConfirmationCoordinator::default();
        let fields = json!({"daily_budget": 5000});
        let armed = arm(&coordinator, "change-1", fields.clone()).await;

        assert_eq!(
            coordinator.take_approved("change-1").await,
            Err(ConfirmError::Pending("change-1".to_string()))
        );

        coordinator
            .approve("change-1", &capability_of(&armed.url), &changes(fields.clone()))
            .await;

        let taken = coordinator.take_approved("change-1").await.unwrap();
        assert_eq!(taken.changes, changes(fields));
        assert!(coordinator.take_approved("change-1").await.is_err());
        assert!(coordinator.current().await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let coordinator = ConfirmationCoordinator::default();
        arm(&coordinator, "change-1", json!({"status": "PAUSED"})).await;

        assert!(!coordinator.clear("other").await);
        assert!(coordinator.clear("change-1").await);
        assert_eq!(coordinator.status("change-1").await, ConfirmationStatus::Stale);
    }

    #[tokio::test]
    async fn test_oversized_change_set_refused() {
        let coordinator = ConfirmationCoordinator::default();
        let change = PendingChange::new(
            "big".to_string(),
            "1".to_string(),
            changes(json!({"name": "x".repeat(MAX_CONFIRMATION_URL_LEN)})),
        );

        let result = coordinator.arm(change, &base(), None).await;

        assert!(matches!(result, Err(ConfirmError::TooLarge { .. })));
        assert!(coordinator.current().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_change_set_refused() {
        let coordinator = ConfirmationCoordinator::default();
        let change = PendingChange::new("e".to_string(), "1".to_string(), ChangeSet::new());

        assert_eq!(
            coordinator.arm(change, &base(), None).await.unwrap_err(),
            ConfirmError::EmptyChangeSet
        );
    }
}
