//! Controlled client sessions.
//!
//! A client is an open page or session the worker may control. The
//! registry only models membership and control; page lifecycles are the
//! host's business.

use tokio::sync::RwLock;
use tracing::debug;

/// One open session.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: String,
    /// Version label of the worker controlling this client, if any.
    pub controller: Option<String>,
}

/// Registry of the sessions a worker may claim.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<Vec<Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Registering an existing id updates its URL and
    /// leaves its controller untouched.
    pub async fn register(&self, id: impl Into<String>, url: impl Into<String>) {
        let id = id.into();
        let url = url.into();
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
            client.url = url;
            return;
        }
        debug!(client = %id, url = %url, "client registered");
        clients.push(Client {
            id,
            url,
            controller: None,
        });
    }

    /// Remove a session. Returns `false` when the id is unknown.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != before
    }

    /// Mark every registered session as controlled by the given worker
    /// version. Returns how many sessions were claimed.
    pub async fn claim(&self, controller: &str) -> usize {
        let mut clients = self.clients.write().await;
        for client in clients.iter_mut() {
            client.controller = Some(controller.to_string());
        }
        debug!(controller = %controller, count = clients.len(), "clients claimed");
        clients.len()
    }

    /// Sessions currently under some worker's control.
    pub async fn controlled_count(&self) -> usize {
        self.clients
            .read()
            .await
            .iter()
            .filter(|c| c.controller.is_some())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Snapshot of every registered session.
    pub async fn all(&self) -> Vec<Client> {
        self.clients.read().await.clone()
    }
}
