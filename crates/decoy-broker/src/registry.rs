//! The call registry: call identifier → session handle.
//!
//! Lookup only, never ownership: each session's state lives inside its
//! actor task, and ended sessions remove themselves through the reaper
//! channel. Attach is atomic per call id because the session inbox
//! serialises it; the map itself is a plain read-write-locked table.

use crate::collab::Collaborators;
use crate::config::BrokerConfig;
use crate::egress::EgressQueue;
use crate::error::AttachError;
use crate::session::{self, AttachOutcome, SessionHandle};
use decoy_types::{CallId, CallStatus, EndReason, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

struct Inner {
    sessions: RwLock<HashMap<CallId, SessionHandle>>,
    config: Arc<BrokerConfig>,
    collab: Collaborators,
    reaper_tx: mpsc::UnboundedSender<CallId>,
}

/// Shared registry handle.
#[derive(Clone)]
pub struct CallRegistry {
    inner: Arc<Inner>,
}

impl CallRegistry {
    /// Builds a registry with explicit collaborator wiring and spawns the
    /// reaper that removes ended sessions from the map.
    pub fn new(config: BrokerConfig, collab: Collaborators) -> Self {
        let (reaper_tx, mut reaper_rx) = mpsc::unbounded_channel::<CallId>();
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            config: Arc::new(config),
            collab,
            reaper_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(call_id) = reaper_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let mut sessions = inner.sessions.write().await;
                // Only reap the ended incarnation; a fresh session may have
                // taken the id in the meantime.
                if sessions.get(&call_id).is_some_and(SessionHandle::is_ended) {
                    sessions.remove(&call_id);
                    tracing::debug!(call_id = %call_id, "session reaped");
                }
            }
        });

        Self { inner }
    }

    /// Looks up or creates the session for `call_id` and binds a leg.
    ///
    /// Refuses with `RoleOccupied` when the role is taken and `ServerBusy`
    /// at the session cap. An attach against an already-ended id gets a
    /// fresh session; callers never see prior incarnations.
    pub async fn attach(
        &self,
        call_id: &CallId,
        role: Role,
        egress: EgressQueue,
    ) -> Result<(SessionHandle, AttachOutcome), AttachError> {
        // Two passes at most: a session can only end once between lookup
        // and attach.
        for _ in 0..2 {
            let handle = self.get_or_create(call_id).await?;
            match handle.attach(role, egress.clone()).await {
                Ok(outcome) => return Ok((handle, outcome)),
                Err(AttachError::Ended) => {
                    let mut sessions = self.inner.sessions.write().await;
                    if sessions.get(call_id).is_some_and(SessionHandle::is_ended) {
                        sessions.remove(call_id);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(AttachError::Ended)
    }

    async fn get_or_create(&self, call_id: &CallId) -> Result<SessionHandle, AttachError> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(handle) = sessions.get(call_id) {
                if !handle.is_ended() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut sessions = self.inner.sessions.write().await;
        // Re-check under the write lock.
        if let Some(handle) = sessions.get(call_id) {
            if !handle.is_ended() {
                return Ok(handle.clone());
            }
            sessions.remove(call_id);
        }
        let live = sessions.values().filter(|h| !h.is_ended()).count();
        if live >= self.inner.config.max_sessions {
            return Err(AttachError::ServerBusy);
        }
        let handle = session::spawn(
            call_id.clone(),
            self.inner.config.clone(),
            self.inner.collab.clone(),
            self.inner.reaper_tx.clone(),
        );
        sessions.insert(call_id.clone(), handle.clone());
        tracing::info!(call_id = %call_id, "session created");
        Ok(handle)
    }

    /// Requests orderly teardown. Returns false for unknown or already
    /// ended calls.
    pub async fn end(&self, call_id: &CallId) -> bool {
        let Some(handle) = self.lookup(call_id).await else {
            return false;
        };
        handle.end(EndReason::Requested).await;
        true
    }

    /// Read-only lookup; ended sessions are invisible.
    pub async fn lookup(&self, call_id: &CallId) -> Option<SessionHandle> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(call_id)
            .filter(|h| !h.is_ended())
            .cloned()
    }

    /// Control-plane status snapshot.
    pub async fn status(&self, call_id: &CallId) -> Option<CallStatus> {
        self.lookup(call_id).await?.status().await
    }

    /// Live session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.values().filter(|h| !h.is_ended()).count()
    }

    /// The broker configuration this registry was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }
}
