use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::domain::{
    CatecheticalYear, Channel, ChildInfo, ClassLevel, DocumentId, EnrollmentId, EnrollmentType,
    Extraction, ParentInfo, PaymentId, UserId, ValidationId, WorkflowId,
};
use super::eligibility::ClassSuggestion;
use super::machine::Step;
use crate::workflows::legacy::{LegacyCatechumen, LegacyParent};

/// Partial results gathered while the conversation advances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legacy_children: Vec<LegacyCatechumen>,
    pub legacy_child: Option<LegacyCatechumen>,
    pub suggestion: Option<ClassSuggestion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admissible_levels: Vec<ClassLevel>,
    pub level: Option<ClassLevel>,
    pub parent: Option<ParentInfo>,
    /// Child data proposed from a certificate or the legacy register, awaiting confirmation.
    pub child_prefill: Option<ChildInfo>,
    pub child: Option<ChildInfo>,
    pub birth_date: Option<NaiveDate>,
    pub age: Option<u8>,
    pub birth_document: Option<DocumentId>,
    pub extraction: Option<Extraction>,
    pub catechetical_year: Option<CatecheticalYear>,
    pub payment_reference: Option<String>,
    pub receipt_document: Option<DocumentId>,
    pub enrollment_id: Option<EnrollmentId>,
    pub enrollment_number: Option<String>,
    pub payment_id: Option<PaymentId>,
    pub validation_id: Option<ValidationId>,
}

/// Per-user conversation state. At most one per user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub phone: String,
    pub channel: Channel,
    pub current_step: Step,
    pub enrollment_type: EnrollmentType,
    pub legacy_parent: Option<LegacyParent>,
    pub collected: CollectedData,
    /// Invalid inputs received at the current step.
    pub retries: u8,
    pub escalation_reason: Option<String>,
    /// Optimistic concurrency token; zero until first stored.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(user_id: UserId, phone: &str, channel: Channel, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: WorkflowId::generate(),
            user_id,
            phone: phone.trim().to_string(),
            channel,
            current_step: Step::InitialChoice,
            enrollment_type: EnrollmentType::Unset,
            legacy_parent: None,
            collected: CollectedData::default(),
            retries: 0,
            escalation_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Keyed session storage with a single writer per key.
pub trait SessionStore: Send + Sync {
    fn load(&self, user_id: &UserId) -> Result<Option<WorkflowSession>, SessionStoreError>;
    /// Store `session` if its version matches the stored one; returns it with the new version.
    fn save(&self, session: WorkflowSession) -> Result<WorkflowSession, SessionStoreError>;
    /// Drop sessions idle since before `cutoff`, sparing parked ones. Returns how many went.
    fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<usize, SessionStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session for {user_id} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        user_id: UserId,
        expected: u64,
        found: u64,
    },
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<UserId, WorkflowSession>>,
}

impl InMemorySessionStore {
    pub fn len(&self) -> usize {
        self.sessions.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> SessionStoreError {
    SessionStoreError::Unavailable("session map poisoned".to_string())
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, user_id: &UserId) -> Result<Option<WorkflowSession>, SessionStoreError> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        Ok(sessions.get(user_id).cloned())
    }

    fn save(&self, mut session: WorkflowSession) -> Result<WorkflowSession, SessionStoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        let found = sessions
            .get(&session.user_id)
            .map(|stored| stored.version)
            .unwrap_or(0);
        if found != session.version {
            return Err(SessionStoreError::VersionConflict {
                user_id: session.user_id.clone(),
                expected: session.version,
                found,
            });
        }
        session.version += 1;
        sessions.insert(session.user_id.clone(), session.clone());
        Ok(session)
    }

    fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<usize, SessionStoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        let before = sessions.len();
        sessions.retain(|_, session| session.current_step.is_parked() || session.updated_at >= cutoff);
        Ok(before - sessions.len())
    }
}

/// One async mutex per user so messages of the same user are handled one at a time.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, user_id: &UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(user_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(user: &str, now: DateTime<Utc>) -> WorkflowSession {
        WorkflowSession::new(UserId::from(user), "70112233", Channel::Whatsapp, now)
    }

    #[test]
    fn save_rejects_stale_versions() {
        let store = InMemorySessionStore::default();
        let now = Utc::now();
        let stored = store.save(session("u1", now)).expect("first save");
        assert_eq!(stored.version, 1);

        let again = store.save(stored.clone()).expect("second save");
        assert_eq!(again.version, 2);

        match store.save(stored) {
            Err(SessionStoreError::VersionConflict {
                expected, found, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn purge_spares_parked_sessions() {
        let store = InMemorySessionStore::default();
        let now = Utc::now();
        let old = now - Duration::hours(100);

        store.save(session("idle", old)).expect("save");
        let mut parked = session("parked", old);
        parked.current_step = Step::PendingHuman;
        store.save(parked).expect("save");
        let mut waiting = session("waiting", old);
        waiting.current_step = Step::TreasurerValidation;
        store.save(waiting).expect("save");
        store.save(session("fresh", now)).expect("save");

        let purged = store
            .purge_idle(now - Duration::hours(72))
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(store.load(&UserId::from("idle")).expect("load").is_none());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn locks_serialize_one_user_and_are_pruned() {
        let locks = SessionLocks::default();
        let user = UserId::from("u1");
        let guard = locks.acquire(&user).await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), locks.acquire(&user))
                .await
                .is_err()
        );
        let _other = locks.acquire(&UserId::from("u2")).await;
        drop(guard);
        locks.prune();
        assert_eq!(locks.len(), 1);
    }
}
