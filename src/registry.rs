use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::PeerEngine;
use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of session identifiers.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> SessionId;
}

/// Random v4 UUIDs; collisions are not a practical concern.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> SessionId {
        SessionId(Uuid::new_v4().to_string())
    }
}

struct Entry {
    engine: Arc<dyn PeerEngine>,
    created_at: Instant,
}

/// Live sessions and the engine each one owns.
///
/// Removing an entry and closing its engine always happen together, so an
/// engine is closed exactly once no matter how many teardown paths race.
/// The lock is never held while an engine is being closed.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId, engine: Arc<dyn PeerEngine>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        match sessions.entry(id) {
            MapEntry::Occupied(occupied) => Err(RegistryError::Duplicate(occupied.key().to_string())),
            MapEntry::Vacant(vacant) => {
                debug!(session_id = %vacant.key(), "Registered session");
                vacant.insert(Entry {
                    engine,
                    created_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Register and return a guard that unregisters on drop.
    pub fn register_guarded(
        self: &Arc<Self>,
        id: SessionId,
        engine: Arc<dyn PeerEngine>,
    ) -> Result<Registration, RegistryError> {
        self.register(id.clone(), engine)?;
        Ok(Registration {
            registry: Arc::clone(self),
            id,
        })
    }

    /// Remove `id` and close its engine. Returns false if `id` was not
    /// registered.
    pub fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(entry) => {
                entry.engine.close();
                debug!(session_id = %id, age = ?entry.created_at.elapsed(), "Unregistered session");
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: &SessionId) -> Option<Arc<dyn PeerEngine>> {
        self.sessions
            .read()
            .get(id)
            .map(|entry| Arc::clone(&entry.engine))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Age of a live session.
    pub fn age(&self, id: &SessionId) -> Option<Duration> {
        self.sessions.read().get(id).map(|entry| entry.created_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Close every registered engine. Used on process shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(SessionId, Entry)> = self.sessions.write().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(session_id = %id, "Force-closing session");
            entry.engine.close();
        }
        if count > 0 {
            info!(count, "Closed all registered sessions");
        }
        count
    }
}

/// Keeps a session registered for as long as it lives.
pub struct Registration {
    registry: Arc<Registry>,
    id: SessionId,
}

impl Registration {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
