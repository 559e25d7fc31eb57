//! Session registry: the single owner of the id → session mapping.
//!
//! The map lock is only held for map operations; all per-session work goes
//! through the `Arc<Session>` handed out, so sessions never block each other.

use super::state::Session;
use bgproc_core::{ProcError, ProcResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `starting` state.
    pub async fn create(&self, command: &str) -> Arc<Session> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = generate_session_id(seq);
        let session = Arc::new(Session::new(session_id.clone(), command.to_string(), seq));

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.clone(), session.clone());
        debug!(session_id = %session_id, command, "session registered");
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Like [`get`](Self::get), but absence is an error.
    pub async fn require(&self, session_id: &str) -> ProcResult<Arc<Session>> {
        self.get(session_id)
            .await
            .ok_or_else(|| ProcError::SessionNotFound(session_id.to_string()))
    }

    /// All sessions in creation order.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq());
        sessions
    }

    pub async fn remove(&self, session_id: &str) -> ProcResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(session_id) {
            Some(session) => {
                info!(session_id, "session removed");
                Ok(session)
            }
            None => Err(ProcError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Remove terminated sessions that ended at or before `cutoff`.
    ///
    /// Returns the IDs of sessions that were removed, oldest first.
    pub async fn reap(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|s| s.ended_at().is_some_and(|ended| ended <= cutoff))
            .map(|s| s.id().to_string())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for session_id in expired {
            if self.remove(&session_id).await.is_ok() {
                removed.push(session_id);
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "reaper removed sessions");
        }

        removed
    }
}

/// Session ID: the creation sequence number plus 4 random bytes of hex.
///
/// The sequence part makes an ID unique for the life of the process, even
/// after the session it named has been removed.
fn generate_session_id(seq: u64) -> String {
    use rand::Rng;
    let bytes: [u8; 4] = rand::thread_rng().gen();
    format!("proc-{seq}-{}", hex::encode(bytes))
}
