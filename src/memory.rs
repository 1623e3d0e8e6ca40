//! In-process document store with push subscriptions.
//!
//! Besides backing the file store and the tests, it can inject failures:
//! writes under a path prefix can be made to fail, live subscriptions can be
//! broken, and writes can be held back to observe optimistic state.

use crate::document::{
    paths, Direction, DocumentSnapshot, DocumentStore, Fields, Query, SetOptions, Subscription,
};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::{cmp::Ordering, collections::BTreeMap, future::Future, sync::Arc};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

type DocSender = mpsc::UnboundedSender<Result<DocumentSnapshot, StoreError>>;
type CollectionSender = mpsc::UnboundedSender<Result<Vec<DocumentSnapshot>, StoreError>>;

enum Watcher {
    Document { path: String, tx: DocSender },
    Collection { path: String, tx: CollectionSender },
}

impl Watcher {
    fn path(&self) -> &str {
        match self {
            Watcher::Document { path, .. } | Watcher::Collection { path, .. } => path,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Watcher::Document { tx, .. } => tx.is_closed(),
            Watcher::Collection { tx, .. } => tx.is_closed(),
        }
    }
}

/// One write against a single document path.
pub(crate) enum WriteOp {
    Set { data: Fields, merge: bool },
    Update(Fields),
    Delete,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Fields>,
    watchers: Vec<Watcher>,
    write_faults: Vec<(String, StoreError)>,
}

impl Inner {
    fn snapshot(&self, path: &str) -> DocumentSnapshot {
        DocumentSnapshot::new(path, self.docs.get(path).cloned())
    }

    fn collection(&self, path: &str) -> Vec<DocumentSnapshot> {
        let prefix = format!("{path}/");
        self.docs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, fields)| DocumentSnapshot::new(key.as_str(), Some(fields.clone())))
            .collect()
    }

    fn check_write(&self, path: &str) -> Result<(), StoreError> {
        match self
            .write_faults
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
        {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Applies `op` in place and returns the document it replaced, or `None`
    /// when nothing changed.
    fn apply(&mut self, path: &str, op: WriteOp) -> Result<Option<Option<Fields>>, StoreError> {
        self.check_write(path)?;
        let previous = self.docs.get(path).cloned();
        match op {
            WriteOp::Set { data, merge } => {
                let entry = self.docs.entry(path.to_string()).or_default();
                if merge {
                    entry.extend(data);
                } else {
                    *entry = data;
                }
            }
            WriteOp::Update(partial) => {
                let Some(existing) = self.docs.get_mut(path) else {
                    return Err(StoreError::NotFound(path.to_string()));
                };
                existing.extend(partial);
            }
            WriteOp::Delete => {
                if self.docs.remove(path).is_none() {
                    return Ok(None);
                }
            }
        }
        Ok(Some(previous))
    }

    fn restore(&mut self, path: &str, previous: Option<Fields>) {
        match previous {
            Some(doc) => {
                self.docs.insert(path.to_string(), doc);
            }
            None => {
                self.docs.remove(path);
            }
        }
    }

    fn notify(&mut self, changed: &str) {
        self.watchers.retain(|watcher| !watcher.is_closed());
        let parent = paths::parent(changed);
        for watcher in &self.watchers {
            match watcher {
                Watcher::Document { path, tx } if path == changed => {
                    let _ = tx.send(Ok(self.snapshot(path)));
                }
                Watcher::Collection { path, tx } if Some(path.as_str()) == parent => {
                    let _ = tx.send(Ok(self.collection(path)));
                }
                _ => {}
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<Inner>>,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_documents(BTreeMap::new())
    }

    pub fn with_documents(docs: BTreeMap<String, Fields>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                docs,
                ..Inner::default()
            })),
            paused: Arc::new(paused),
        }
    }

    /// Makes every write under `prefix` fail with `err` until cleared.
    pub async fn fail_writes(&self, prefix: impl Into<String>, err: StoreError) {
        self.inner.lock().await.write_faults.push((prefix.into(), err));
    }

    pub async fn clear_faults(&self) {
        self.inner.lock().await.write_faults.clear();
    }

    /// Delivers `err` to every subscription on `path` and detaches them.
    pub async fn break_subscriptions(&self, path: &str, err: StoreError) {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|watcher| {
            if watcher.path() != path {
                return true;
            }
            match watcher {
                Watcher::Document { tx, .. } => {
                    let _ = tx.send(Err(err.clone()));
                }
                Watcher::Collection { tx, .. } => {
                    let _ = tx.send(Err(err.clone()));
                }
            }
            false
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|watcher| !watcher.is_closed());
        inner.watchers.len()
    }

    /// Holds every subsequent write until [`MemoryDocumentStore::resume_writes`].
    pub fn pause_writes(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.paused.send_replace(false);
    }

    async fn wait_until_writable(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Applies `op`, then runs `persist` over the resulting tree before any
    /// subscriber hears about it. A failed persist puts the previous
    /// document back and nobody is notified.
    pub(crate) async fn write_through<F, Fut>(
        &self,
        path: &str,
        op: WriteOp,
        persist: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&BTreeMap<String, Fields>) -> Fut + Send,
        Fut: Future<Output = Result<(), StoreError>> + Send,
    {
        self.wait_until_writable().await;
        let mut inner = self.inner.lock().await;
        let Some(previous) = inner.apply(path, op)? else {
            return Ok(());
        };
        if let Err(err) = persist(&inner.docs).await {
            inner.restore(path, previous);
            return Err(err);
        }
        debug!(path, "document written");
        inner.notify(path);
        Ok(())
    }

    async fn write(&self, path: &str, op: WriteOp) -> Result<(), StoreError> {
        self.write_through(path, op, |_| std::future::ready(Ok(()))).await
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn field<'a>(snapshot: &'a DocumentSnapshot, name: &str) -> Option<&'a Value> {
    snapshot.data.as_ref().and_then(|data| data.get(name))
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn new_document_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    async fn get_document(&self, path: &str) -> Result<DocumentSnapshot, StoreError> {
        Ok(self.inner.lock().await.snapshot(path))
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
        self.write(path, op).await
    }

    async fn update_document(&self, path: &str, partial: Fields) -> Result<(), StoreError> {
        self.write(path, WriteOp::Update(partial)).await
    }

    async fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        self.write(path, WriteOp::Delete).await
    }

    async fn query_collection(
        &self,
        path: &str,
        query: &Query,
    ) -> Result<Vec<DocumentSnapshot>, StoreError> {
        let mut docs: Vec<DocumentSnapshot> = self
            .inner
            .lock()
            .await
            .collection(path)
            .into_iter()
            .filter(|snap| {
                query
                    .filters
                    .iter()
                    .all(|(name, expected)| field(snap, name) == Some(expected))
            })
            .collect();

        if let Some((name, direction)) = &query.order_by {
            docs.sort_by(|a, b| {
                let ordering = compare_values(field(a, name), field(b, name));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn subscribe_document(
        &self,
        path: &str,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        let _ = tx.send(Ok(inner.snapshot(path)));
        inner.watchers.push(Watcher::Document {
            path: path.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn subscribe_collection(
        &self,
        path: &str,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        let _ = tx.send(Ok(inner.collection(path)));
        inner.watchers.push(Watcher::Collection {
            path: path.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn set_merge_keeps_existing_fields() {
        let store = MemoryDocumentStore::new();
        store
            .set_document("users/u1", fields(json!({ "email": "a@b.c" })), SetOptions::default())
            .await
            .unwrap();
        store
            .set_document("users/u1", fields(json!({ "lastActive": "now" })), SetOptions::merge())
            .await
            .unwrap();

        let snap = store.get_document("users/u1").await.unwrap();
        let data = snap.data.unwrap();
        assert_eq!(data.get("email"), Some(&json!("a@b.c")));
        assert_eq!(data.get("lastActive"), Some(&json!("now")));
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store
            .update_document("users/ghost", fields(json!({ "x": 1 })))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("users/ghost".into()));
    }

    #[tokio::test]
    async fn collection_excludes_nested_documents() {
        let store = MemoryDocumentStore::new();
        for path in ["users/u1", "users/u1/habits/h1", "users/u2"] {
            store
                .set_document(path, fields(json!({ "n": 1 })), SetOptions::default())
                .await
                .unwrap();
        }
        let users = store.query_collection("users", &Query::new()).await.unwrap();
        let ids: Vec<_> = users.iter().map(|snap| snap.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn query_orders_filters_and_limits() {
        let store = MemoryDocumentStore::new();
        for (id, date, kind) in [
            ("a", "2024-01-01", "expense"),
            ("b", "2024-03-01", "income"),
            ("c", "2024-02-01", "expense"),
            ("d", "2024-04-01", "expense"),
        ] {
            store
                .set_document(
                    &format!("users/u/transactions/{id}"),
                    fields(json!({ "date": date, "type": kind })),
                    SetOptions::default(),
                )
                .await
                .unwrap();
        }

        let query = Query::new()
            .where_eq("type", "expense")
            .order_by("date", Direction::Descending)
            .limit(2);
        let docs = store
            .query_collection("users/u/transactions", &query)
            .await
            .unwrap();
        let ids: Vec<_> = docs.iter().map(|snap| snap.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c"]);
    }

    #[tokio::test]
    async fn collection_subscription_sees_initial_and_changes() {
        let store = MemoryDocumentStore::new();
        let mut sub = store.subscribe_collection("users/u/habits").await.unwrap();
        assert!(sub.next().await.unwrap().unwrap().is_empty());

        store
            .set_document(
                "users/u/habits/h1",
                fields(json!({ "name": "x" })),
                SetOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().len(), 1);

        store.delete_document("users/u/habits/h1").await.unwrap();
        assert!(sub.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_detaches_watcher() {
        let store = MemoryDocumentStore::new();
        let sub = store.subscribe_document("users/u/meta/budget").await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn write_faults_apply_by_prefix() {
        let store = MemoryDocumentStore::new();
        store
            .fail_writes("users/u/habits", StoreError::Unavailable("offline".into()))
            .await;
        let err = store.delete_document("users/u/habits/h1").await.unwrap_err();
        assert_eq!(err, StoreError::Unavailable("offline".into()));

        store.clear_faults().await;
        assert!(store.delete_document("users/u/habits/h1").await.is_ok());
    }

    #[tokio::test]
    async fn broken_subscription_yields_error_then_ends() {
        let store = MemoryDocumentStore::new();
        let mut sub = store.subscribe_document("users/u/meta/occasions").await.unwrap();
        assert!(sub.next().await.unwrap().is_ok());

        store
            .break_subscriptions(
                "users/u/meta/occasions",
                StoreError::PermissionDenied("revoked".into()),
            )
            .await;
        assert!(sub.next().await.unwrap().is_err());
        assert!(sub.next().await.is_none());
    }
}
