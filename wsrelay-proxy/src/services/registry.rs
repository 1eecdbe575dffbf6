//! The process-wide backend registry.
//!
//! Maps backend ids to their live [`Multiplexer`]. Every operation a handler
//! wants to perform on a backend goes through here: the registry fetches the
//! multiplexer under the read lock and delegates, and a miss is the
//! authoritative "no such backend" answer that handlers turn into a 4xx.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use axum::extract::ws::WebSocket;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;
use wsrelay_types::Frame;

use crate::metrics::METRICS_ID_PROXY_BACKENDS_REGISTERED;
use crate::services::multiplexer::{BackendGone, Multiplexer};

type BackendMap = RwLock<HashMap<String, Arc<Multiplexer>>>;

/// Errors for operations addressed at a backend.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No multiplexer is registered under the requested id.
    #[error("no backend for key [{0}]")]
    NoSuchBackend(String),
    /// The multiplexer exists but its writer already stopped.
    #[error(transparent)]
    BackendGone(#[from] BackendGone),
}

/// Process-wide mapping from backend id to live multiplexer.
///
/// Constructed once at startup and passed explicitly to every handler.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Arc<BackendMap>,
}

impl BackendRegistry {
    /// Registers a backend socket under `backend_id` and starts its
    /// multiplexer loops.
    ///
    /// A prior registration under the same id is replaced: the new entry is
    /// swapped in first, then the old multiplexer is torn down, so there is
    /// no window in which the id resolves to the dying connection.
    pub fn add(&self, backend_id: &str, socket: WebSocket) {
        let (mx, outbound_rx) =
            Multiplexer::new(backend_id.to_owned(), self.deregister_capability(backend_id));
        let previous = {
            let mut backends = self.backends.write();
            let previous = backends.insert(backend_id.to_owned(), Arc::clone(&mx));
            ::metrics::gauge!(METRICS_ID_PROXY_BACKENDS_REGISTERED).set(backends.len() as f64);
            previous
        };
        if let Some(previous) = previous {
            tracing::info!(backend_id, "replacing live backend registration");
            previous.teardown();
        }
        mx.start(socket, outbound_rx);
    }

    /// Unconditionally deletes the registration for `backend_id`.
    pub fn remove(&self, backend_id: &str) {
        let mut backends = self.backends.write();
        backends.remove(backend_id);
        ::metrics::gauge!(METRICS_ID_PROXY_BACKENDS_REGISTERED).set(backends.len() as f64);
    }

    /// Looks up the live multiplexer for `backend_id`.
    pub fn lookup(&self, backend_id: &str) -> Result<Arc<Multiplexer>, RegistryError> {
        self.backends
            .read()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuchBackend(backend_id.to_owned()))
    }

    /// Whether a backend is currently registered under `backend_id`.
    pub fn has_backend(&self, backend_id: &str) -> bool {
        self.backends.read().contains_key(backend_id)
    }

    /// Opens a new session on the given backend.
    pub async fn initialize_client(
        &self,
        backend_id: &str,
    ) -> Result<(Uuid, mpsc::Receiver<Frame>), RegistryError> {
        let mx = self.lookup(backend_id)?;
        Ok(mx.initialize_client().await)
    }

    /// Announces a session to the given backend.
    pub async fn connect(&self, backend_id: &str, key: Uuid, url: &str) -> Result<(), RegistryError> {
        let mx = self.lookup(backend_id)?;
        Ok(mx.connect(key, url).await?)
    }

    /// Forwards one payload chunk to the given backend.
    pub async fn send(&self, backend_id: &str, key: Uuid, body: String) -> Result<(), RegistryError> {
        let mx = self.lookup(backend_id)?;
        Ok(mx.send(key, body).await?)
    }

    /// Closes a session on the given backend, notifying the backend.
    pub async fn close(&self, backend_id: &str, key: Uuid) -> Result<(), RegistryError> {
        let mx = self.lookup(backend_id)?;
        mx.close(key, true).await;
        Ok(())
    }

    /// The self-removal capability handed to a multiplexer at construction.
    pub(crate) fn deregister_capability(&self, backend_id: &str) -> Deregister {
        Deregister {
            backends: Arc::downgrade(&self.backends),
            backend_id: backend_id.to_owned(),
        }
    }
}

/// Removal capability held by a multiplexer.
///
/// Holds the registry map weakly, which breaks the registry ↔ multiplexer
/// cycle, and removes by pointer identity so a multiplexer that was replaced
/// cannot delete its successor.
pub(crate) struct Deregister {
    backends: Weak<BackendMap>,
    backend_id: String,
}

impl Deregister {
    pub(crate) fn remove(&self, mx: &Arc<Multiplexer>) {
        let Some(backends) = self.backends.upgrade() else {
            return;
        };
        let mut backends = backends.write();
        if backends
            .get(&self.backend_id)
            .is_some_and(|current| Arc::ptr_eq(current, mx))
        {
            backends.remove(&self.backend_id);
            ::metrics::gauge!(METRICS_ID_PROXY_BACKENDS_REGISTERED)
                .set(backends.len() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_is_no_such_backend() {
        let registry = BackendRegistry::default();
        assert!(!registry.has_backend("1"));
        assert!(matches!(
            registry.lookup("1"),
            Err(RegistryError::NoSuchBackend(_))
        ));
        assert!(matches!(
            registry.initialize_client("1").await,
            Err(RegistryError::NoSuchBackend(_))
        ));
        assert!(matches!(
            registry
                .send("1", Uuid::new_v4(), "body".to_owned())
                .await,
            Err(RegistryError::NoSuchBackend(_))
        ));
        assert!(matches!(
            registry.close("1", Uuid::new_v4()).await,
            Err(RegistryError::NoSuchBackend(_))
        ));
    }

    #[tokio::test]
    async fn stale_deregistration_keeps_the_replacement() {
        let registry = BackendRegistry::default();
        let (old, _old_rx) =
            Multiplexer::new("1".to_owned(), registry.deregister_capability("1"));
        let (new, _new_rx) =
            Multiplexer::new("1".to_owned(), registry.deregister_capability("1"));

        registry.backends.write().insert("1".to_owned(), Arc::clone(&old));
        registry.backends.write().insert("1".to_owned(), Arc::clone(&new));

        // the replaced multiplexer tries to remove itself on teardown
        registry.deregister_capability("1").remove(&old);
        assert!(registry.has_backend("1"));

        registry.deregister_capability("1").remove(&new);
        assert!(!registry.has_backend("1"));
    }

    #[tokio::test]
    async fn remove_is_unconditional_and_idempotent() {
        let registry = BackendRegistry::default();
        let (mx, _rx) = Multiplexer::new("1".to_owned(), registry.deregister_capability("1"));
        registry.backends.write().insert("1".to_owned(), mx);

        registry.remove("1");
        assert!(!registry.has_backend("1"));
        registry.remove("1");
    }
}
