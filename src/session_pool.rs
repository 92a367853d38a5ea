//! The SessionPool (§4.D): a bounded collection of [`Session`]s with
//! rotation and retirement. Acquisition follows the source's "construct
//! with probability proportional to free capacity, else pick a usable one
//! at random, retrying on a non-usable pick" algorithm directly; no pack
//! example implements this shape (the closest candidate pool acquires
//! deterministically through a semaphore-gated FIFO, not a random pick).

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SessionPoolError;
use crate::events::{Event, EventManager};
use crate::session::{Session, SessionOptions};

const MAX_ACQUIRE_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct SessionPoolOptions {
    pub max_pool_size: usize,
    pub session_options: SessionOptions,
    /// Observed status codes that trigger retirement; defaults to
    /// `[401, 403, 429]` per §4.D, extendable per pool instance.
    pub blocked_status_codes: Vec<u16>,
    pub persist_state_key: String,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        SessionPoolOptions {
            max_pool_size: 1000,
            session_options: SessionOptions::default(),
            blocked_status_codes: Session::default_blocked_status_codes(),
            persist_state_key: "SDK_SESSION_POOL_STATE".to_string(),
        }
    }
}

/// The durable form written under `SDK_SESSION_POOL_STATE`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionPoolState {
    pub sessions: Vec<Session>,
}

pub struct SessionPool {
    options: SessionPoolOptions,
    sessions: HashMap<String, Session>,
    events: EventManager,
}

impl SessionPool {
    pub fn new(options: SessionPoolOptions, events: EventManager) -> Self {
        SessionPool {
            options,
            sessions: HashMap::new(),
            events,
        }
    }

    /// Rebuilds from a persisted [`SessionPoolState`], preserving
    /// `createdAt`, `expiresAt`, usage, and cookies.
    pub fn from_state(state: SessionPoolState, options: SessionPoolOptions, events: EventManager) -> Self {
        let mut sessions = HashMap::new();
        for session in state.sessions {
            sessions.insert(session.id.clone(), session);
        }
        SessionPool {
            options,
            sessions,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evicts a session when its own `SESSION_RETIRED` event fires.
    /// Called by the runtime's event-subscription loop rather than an
    /// inherited emitter (§9).
    pub fn handle_event(&mut self, event: &Event) {
        if let Event::SessionRetired { session_id } = event {
            if self.sessions.remove(session_id).is_some() {
                debug!(session_id = %session_id, "session evicted from pool");
            }
        }
    }

    fn construct_session(&mut self) -> Session {
        let session = Session::new(self.options.session_options);
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    fn retire_and_emit(&mut self, mut session: Session) {
        session.retire();
        self.events.emit(Event::SessionRetired {
            session_id: session.id.clone(),
        });
        self.sessions.remove(&session.id);
    }

    /// `getSession()`: if `|pool| < maxPoolSize`, construct a new session
    /// with probability `1 - |pool|/maxPoolSize`; else pick a usable one
    /// uniformly at random. If the pick isn't usable, retire and retry up
    /// to 10 times; if still none, construct and return.
    pub fn get_session(&mut self) -> Result<Session, SessionPoolError> {
        let mut rng = rand::thread_rng();

        if self.sessions.len() < self.options.max_pool_size {
            let construct_probability = 1.0 - (self.sessions.len() as f64 / self.options.max_pool_size as f64);
            if rng.gen::<f64>() < construct_probability {
                return Ok(self.construct_session());
            }
        }

        for _ in 0..MAX_ACQUIRE_RETRIES {
            if self.sessions.is_empty() {
                return Ok(self.construct_session());
            }
            let ids: Vec<String> = self.sessions.keys().cloned().collect();
            let pick = &ids[rng.gen_range(0..ids.len())];
            let usable = self.sessions.get(pick).map(|s| s.is_usable()).unwrap_or(false);
            if usable {
                return Ok(self.sessions.get(pick).unwrap().clone());
            }
            if let Some(session) = self.sessions.get(pick).cloned() {
                self.retire_and_emit(session);
            }
        }

        if self.sessions.len() < self.options.max_pool_size {
            Ok(self.construct_session())
        } else {
            warn!("session pool exhausted acquire retries with no usable session");
            Err(SessionPoolError::NoUsableSession)
        }
    }

    /// Writes back a session mutated by the caller (e.g. after
    /// `mark_good`/`mark_bad`). If the session has transitioned to
    /// `Retired`, it is evicted instead.
    pub fn return_session(&mut self, session: Session) {
        if matches!(session.state, crate::session::SessionState::Retired) {
            self.retire_and_emit(session);
        } else {
            self.sessions.insert(session.id.clone(), session);
        }
    }

    pub fn retire_on_blocked_status_code(&mut self, session_id: &str, status_code: u16, extra: &[u16]) -> bool {
        let Some(mut session) = self.sessions.remove(session_id) else {
            return false;
        };
        let retired = session.retire_on_blocked_status_codes(status_code, &self.options.blocked_status_codes, extra);
        if retired {
            self.events.emit(Event::SessionRetired {
                session_id: session.id.clone(),
            });
        } else {
            self.sessions.insert(session.id.clone(), session);
        }
        retired
    }

    pub fn get_state(&self) -> SessionPoolState {
        SessionPoolState {
            sessions: self.sessions.values().cloned().collect(),
        }
    }

    /// `teardown()`: persists state (left to the caller via
    /// [`SessionPool::get_state`]) and releases in-memory sessions.
    pub fn teardown(&mut self) {
        self.sessions.clear();
    }

    pub fn persistence_key(&self) -> &str {
        &self.options.persist_state_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_pool_size: usize) -> SessionPool {
        SessionPool::new(
            SessionPoolOptions {
                max_pool_size,
                ..Default::default()
            },
            EventManager::new(),
        )
    }

    #[test]
    fn get_session_constructs_when_pool_below_capacity_often() {
        let mut p = pool(1000);
        // far below capacity: construct probability ~1.0
        let s = p.get_session().unwrap();
        assert!(p.sessions.contains_key(&s.id));
    }

    #[test]
    fn returned_session_is_retrievable_by_id() {
        let mut p = pool(10);
        let s = p.get_session().unwrap();
        p.return_session(s.clone());
        assert!(p.sessions.contains_key(&s.id));
    }

    #[test]
    fn retired_session_returned_is_evicted_not_reinserted() {
        let mut p = pool(10);
        let mut s = p.get_session().unwrap();
        s.retire();
        p.return_session(s.clone());
        assert!(!p.sessions.contains_key(&s.id));
    }

    #[test]
    fn retire_on_blocked_status_code_evicts_from_pool() {
        let mut p = pool(10);
        let s = p.get_session().unwrap();
        assert!(p.retire_on_blocked_status_code(&s.id, 429, &[]));
        assert!(!p.sessions.contains_key(&s.id));
    }

    #[test]
    fn non_blocked_status_code_keeps_session_in_pool() {
        let mut p = pool(10);
        let s = p.get_session().unwrap();
        assert!(!p.retire_on_blocked_status_code(&s.id, 200, &[]));
        assert!(p.sessions.contains_key(&s.id));
    }

    #[test]
    fn handle_event_evicts_on_session_retired() {
        let mut p = pool(10);
        let s = p.get_session().unwrap();
        p.handle_event(&Event::SessionRetired { session_id: s.id.clone() });
        assert!(!p.sessions.contains_key(&s.id));
    }

    #[test]
    fn from_state_preserves_session_fields() {
        let mut original = pool(10);
        let s = original.get_session().unwrap();
        let state = original.get_state();
        let rehydrated = SessionPool::from_state(
            state,
            SessionPoolOptions {
                max_pool_size: 10,
                ..Default::default()
            },
            EventManager::new(),
        );
        let rehydrated_session = rehydrated.sessions.get(&s.id).unwrap();
        assert_eq!(rehydrated_session.created_at, s.created_at);
        assert_eq!(rehydrated_session.expires_at, s.expires_at);
    }

    #[test]
    fn teardown_clears_sessions() {
        let mut p = pool(10);
        p.get_session().unwrap();
        p.teardown();
        assert!(p.is_empty());
    }

    /// S4-relevant: pool never exceeds max_pool_size entries under repeated
    /// acquisition, even when many picks are unusable and retired.
    #[test]
    fn pool_size_bounded_by_max_pool_size() {
        let mut p = pool(3);
        for _ in 0..20 {
            let s = p.get_session();
            if let Ok(s) = s {
                p.return_session(s);
            }
            assert!(p.len() <= 3);
        }
    }
}
