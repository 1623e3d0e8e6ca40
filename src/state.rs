use crate::config::SessionConfig;
use crate::document::DocumentStore;
use crate::errors::{AppError, SessionError};
use crate::models::UserIdentity;
use crate::session::Session;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::info;

/// Signed-in sessions keyed by uid, all backed by one document store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub config: SessionConfig,
    pub sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Loads a fresh session for the identity, disposing any previous one.
    pub async fn sign_in(
        &self,
        identity: UserIdentity,
        referral_code: Option<&str>,
    ) -> Result<Session, SessionError> {
        let uid = identity.uid.clone();
        let session = Session::load(
            Arc::clone(&self.store),
            identity,
            self.config.clone(),
            referral_code,
        )
        .await?;

        let previous = self.sessions.lock().await.insert(uid, session.clone());
        if let Some(previous) = previous {
            previous.dispose().await;
        }
        Ok(session)
    }

    pub async fn sign_out(&self, uid: &str) -> bool {
        let removed = self.sessions.lock().await.remove(uid);
        match removed {
            Some(session) => {
                session.dispose().await;
                info!(uid, "signed out");
                true
            }
            None => false,
        }
    }

    pub async fn session(&self, uid: &str) -> Result<Session, AppError> {
        self.sessions
            .lock()
            .await
            .get(uid)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("no session for user {uid}")))
    }
}
