//! The document-store contract the session is written against.
//!
//! Paths are slash-separated, alternating collection and document segments
//! (`users/{uid}/habits/{id}`). A collection path has an odd number of
//! segments, a document path an even number.

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub path: String,
    pub data: Option<Fields>,
}

impl DocumentSnapshot {
    pub fn new(path: impl Into<String>, data: Option<Fields>) -> Self {
        let path = path.into();
        let id = path.rsplit('/').next().unwrap_or_default().to_string();
        Self { id, path, data }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Decodes the document body as-is. A missing document decodes from `{}`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let body = self.data.clone().unwrap_or_default();
        serde_json::from_value(Value::Object(body))
            .map_err(|err| StoreError::invalid(&self.path, err))
    }

    /// Decodes the document body with its id injected as the `id` field.
    pub fn decode_with_id<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let Some(mut body) = self.data.clone() else {
            return Err(StoreError::NotFound(self.path.clone()));
        };
        body.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(body))
            .map_err(|err| StoreError::invalid(&self.path, err))
    }
}

/// Serializes a value into a document body, dropping its `id` field.
pub fn to_fields<T: Serialize>(path: &str, value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value).map_err(|err| StoreError::invalid(path, err))? {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        other => Err(StoreError::invalid(
            path,
            format!("expected an object, got {other}"),
        )),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A push-based stream of snapshots. Dropping it or calling
/// [`Subscription::unsubscribe`] detaches it from the store.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Result<T, StoreError>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<T, StoreError>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<T, StoreError>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Allocates an id for a document about to be created.
    fn new_document_id(&self) -> String;

    async fn get_document(&self, path: &str) -> Result<DocumentSnapshot, StoreError>;

    async fn set_document(
        &self,
        path: &str,
        data: Fields,
        options: SetOptions,
    ) -> Result<(), StoreError>;

    /// Replaces the given top-level fields. Fails with `NotFound` when the
    /// document does not exist.
    async fn update_document(&self, path: &str, partial: Fields) -> Result<(), StoreError>;

    async fn delete_document(&self, path: &str) -> Result<(), StoreError>;

    async fn query_collection(
        &self,
        path: &str,
        query: &Query,
    ) -> Result<Vec<DocumentSnapshot>, StoreError>;

    /// The current snapshot is delivered first, then one per change.
    async fn subscribe_document(
        &self,
        path: &str,
    ) -> Result<Subscription<DocumentSnapshot>, StoreError>;

    async fn subscribe_collection(
        &self,
        path: &str,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError>;
}

pub mod paths {
    pub const USERS: &str = "users";
    pub const REFERRAL_CODES: &str = "referralCodes";
    pub const SETTINGS_GLOBAL: &str = "settings/global";

    pub fn user(uid: &str) -> String {
        format!("{USERS}/{uid}")
    }

    pub fn habits(uid: &str) -> String {
        format!("{USERS}/{uid}/habits")
    }

    pub fn habit(uid: &str, id: &str) -> String {
        format!("{USERS}/{uid}/habits/{id}")
    }

    pub fn transactions(uid: &str) -> String {
        format!("{USERS}/{uid}/transactions")
    }

    pub fn transaction(uid: &str, id: &str) -> String {
        format!("{USERS}/{uid}/transactions/{id}")
    }

    pub fn occasions(uid: &str) -> String {
        format!("{USERS}/{uid}/meta/occasions")
    }

    pub fn budget(uid: &str) -> String {
        format!("{USERS}/{uid}/meta/budget")
    }

    pub fn referral_code(code: &str) -> String {
        format!("{REFERRAL_CODES}/{code}")
    }

    /// Parent collection of a document path.
    pub fn parent(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(parent, _)| parent)
    }
}
