//! User directory upkeep: profile sync on sign-in, referral redemption,
//! activity pings and the periodic heartbeat.

use crate::document::{paths, DocumentStore, Fields, SetOptions};
use crate::errors::StoreError;
use crate::models::UserIdentity;
use chrono::Utc;
use serde_json::Value;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Shortest accepted heartbeat period.
pub const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Merges the identity into `users/{uid}`. A referral code is only honoured
/// when the profile did not exist yet. Failures are logged and dropped.
pub async fn update_user_registry(
    store: &dyn DocumentStore,
    identity: &UserIdentity,
    referral_code: Option<&str>,
) {
    match sync_profile(store, identity, referral_code).await {
        Ok(()) => info!(uid = %identity.uid, "registry sync success"),
        Err(err) => error!(uid = %identity.uid, "registry sync failed: {err}"),
    }
}

async fn sync_profile(
    store: &dyn DocumentStore,
    identity: &UserIdentity,
    referral_code: Option<&str>,
) -> Result<(), StoreError> {
    let path = paths::user(&identity.uid);
    let existing = store.get_document(&path).await?;

    let mut profile = Fields::new();
    profile.insert("email".into(), optional_string(identity.email.as_deref()));
    profile.insert(
        "displayName".into(),
        Value::String(
            identity
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
        ),
    );
    profile.insert("photoURL".into(), optional_string(identity.photo_url.as_deref()));
    profile.insert("lastActive".into(), Value::String(now_iso()));

    if !existing.exists() {
        let code = referral_code.map(normalize_code).filter(|code| !code.is_empty());
        if let Some(code) = code {
            if redeem_referral(store, &code).await? {
                profile.insert("referredBy".into(), Value::String(code));
            }
        }
    }

    store.set_document(&path, profile, SetOptions::merge()).await
}

fn optional_string(value: Option<&str>) -> Value {
    value
        .map(|value| Value::String(value.to_string()))
        .unwrap_or(Value::Null)
}

/// Bumps the code's counter when it exists. Returns whether it exists.
async fn redeem_referral(store: &dyn DocumentStore, code: &str) -> Result<bool, StoreError> {
    let path = paths::referral_code(code);
    let snapshot = store.get_document(&path).await?;
    let Some(data) = snapshot.data else {
        debug!(code, "unknown referral code");
        return Ok(false);
    };

    let count = data.get("count").and_then(Value::as_u64).unwrap_or(0);
    let mut bump = Fields::new();
    bump.insert("count".into(), Value::from(count + 1));
    if let Err(err) = store.update_document(&path, bump).await {
        warn!(code, "referral counter update failed: {err}");
    }
    Ok(true)
}

/// Best-effort `lastActive` refresh after a user action.
pub async fn touch_activity(store: &dyn DocumentStore, uid: &str) {
    let mut fields = Fields::new();
    fields.insert("lastActive".into(), Value::String(now_iso()));
    if let Err(err) = store.update_document(&paths::user(uid), fields).await {
        warn!(uid, "activity ping failed: {err}");
    }
}

/// Re-syncs the profile every `period` (at least [`MIN_HEARTBEAT_PERIOD`])
/// until the handle is aborted or `owner` is dropped.
pub fn spawn_heartbeat<O: Send + Sync + 'static>(
    owner: Weak<O>,
    store: Arc<dyn DocumentStore>,
    identity: UserIdentity,
    period: Duration,
) -> JoinHandle<()> {
    let period = period.max(MIN_HEARTBEAT_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if owner.strong_count() == 0 {
                debug!(uid = %identity.uid, "heartbeat owner gone");
                break;
            }
            debug!(uid = %identity.uid, "heartbeat");
            update_user_registry(store.as_ref(), &identity, None).await;
        }
    })
}
