use crate::document::{DocumentSnapshot, DocumentStore, Fields, Query, SetOptions, Subscription};
use crate::errors::StoreError;
use crate::memory::{MemoryDocumentStore, WriteOp};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::error;

pub async fn load_documents(path: &Path) -> BTreeMap<String, Fields> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to parse data file: {err}");
                BTreeMap::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => {
            error!("failed to read data file: {err}");
            BTreeMap::new()
        }
    }
}

pub fn encode_documents(docs: &BTreeMap<String, Fields>) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(docs).map_err(|err| StoreError::Io(err.to_string()))
}

/// Document store whose whole tree lives in memory and is rewritten to a
/// JSON file on every write. A write only becomes visible once the file
/// holds it.
#[derive(Clone)]
pub struct FileDocumentStore {
    path: PathBuf,
    memory: MemoryDocumentStore,
}

impl FileDocumentStore {
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let docs = load_documents(&path).await;
        Ok(Self {
            path,
            memory: MemoryDocumentStore::with_documents(docs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(&self, path: &str, op: WriteOp) -> Result<(), StoreError> {
        let file = self.path.clone();
        self.memory
            .write_through(path, op, move |docs| {
                let payload = encode_documents(docs);
                async move {
                    fs::write(&file, payload?).await?;
                    Ok::<(), StoreError>(())
                }
            })
            .await
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn new_document_id(&self) -> String {
        self.memory.new_document_id()
    }

    async fn get_document(&self, path: &str) -> Result<DocumentSnapshot, StoreError> {
        self.memory.get_document(path).await
    }

    async fn set_document(
        &self,
        path: &str,
        data: Fields,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        let op = WriteOp::Set {
            data,
            merge: options.merge,
        };
        self.commit(path, op).await
    }

    async fn update_document(&self, path: &str, partial: Fields) -> Result<(), StoreError> {
        self.commit(path, WriteOp::Update(partial)).await
    }

    async fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        self.commit(path, WriteOp::Delete).await
    }

    async fn query_collection(
        &self,
        path: &str,
        query: &Query,
    ) -> Result<Vec<DocumentSnapshot>, StoreError> {
        self.memory.query_collection(path, query).await
    }

    async fn subscribe_document(
        &self,
        path: &str,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError> {
        self.memory.subscribe_document(path).await
    }

    async fn subscribe_collection(
        &self,
        path: &str,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError> {
        self.memory.subscribe_collection(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::models::{HabitRequest, UserIdentity};
    use crate::session::Session;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("orbit_{name}_{}_{nanos}.json", std::process::id()))
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let path = temp_path("reopen");
        let store = FileDocumentStore::open(path.clone()).await.unwrap();
        let body = json!({ "limit": 250.0 }).as_object().cloned().unwrap();
        store
            .set_document("users/u/meta/budget", body, SetOptions::default())
            .await
            .unwrap();

        let reopened = FileDocumentStore::open(path.clone()).await.unwrap();
        let snap = reopened.get_document("users/u/meta/budget").await.unwrap();
        assert_eq!(snap.data.unwrap().get("limit"), Some(&json!(250.0)));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn failed_flush_leaves_nothing_behind() {
        let path = temp_path("unwritable");
        let store = FileDocumentStore::open(path.clone()).await.unwrap();
        let mut budget = store.subscribe_document("users/u/meta/budget").await.unwrap();
        assert!(!budget.next().await.unwrap().unwrap().exists());

        std::fs::create_dir(&path).unwrap();
        let body = json!({ "limit": 250.0 }).as_object().cloned().unwrap();
        let result = store
            .set_document("users/u/meta/budget", body, SetOptions::default())
            .await;
        assert!(matches!(result, Err(StoreError::Io(_))));

        let snap = store.get_document("users/u/meta/budget").await.unwrap();
        assert!(!snap.exists());
        let quiet = tokio::time::timeout(Duration::from_millis(50), budget.next()).await;
        assert!(quiet.is_err(), "subscriber saw a write that never reached disk");
        let _ = std::fs::remove_dir(path);
    }

    #[tokio::test]
    async fn failed_flush_restores_previous_document() {
        let path = temp_path("restore");
        let store = FileDocumentStore::open(path.clone()).await.unwrap();
        let first = json!({ "limit": 100.0 }).as_object().cloned().unwrap();
        store
            .set_document("users/u/meta/budget", first, SetOptions::default())
            .await
            .unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(store.delete_document("users/u/meta/budget").await.is_err());

        let snap = store.get_document("users/u/meta/budget").await.unwrap();
        assert_eq!(snap.data.unwrap().get("limit"), Some(&json!(100.0)));
        let _ = std::fs::remove_dir(path);
    }

    #[tokio::test]
    async fn session_add_fails_cleanly_when_file_is_unwritable() {
        let path = temp_path("session");
        let store = FileDocumentStore::open(path.clone()).await.unwrap();
        let identity = UserIdentity {
            uid: "u".into(),
            email: None,
            display_name: None,
            photo_url: None,
        };
        let session = Session::load(
            Arc::new(store.clone()),
            identity,
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let request = HabitRequest {
            name: "Read".into(),
            emoji: None,
            time: None,
            has_reminder: false,
        };
        assert!(session.add_habit(request).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.habits().await.is_empty());
        let stored = store
            .query_collection("users/u/habits", &Query::new())
            .await
            .unwrap();
        assert!(stored.is_empty());
        session.dispose().await;
        let _ = std::fs::remove_dir(path);
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"not json").unwrap();
        assert!(load_documents(&path).await.is_empty());
        let _ = std::fs::remove_file(path);
    }
}
