//! Administrator reads and writes across user subtrees.
//!
//! Every privileged call made from a non-admin session returns an empty
//! result or `false` instead of an error; callers cannot tell "unauthorized"
//! from "nothing there".

use crate::document::{
    paths, to_fields, DocumentSnapshot, DocumentStore, Fields, Query, SetOptions, Subscription,
};
use crate::errors::SessionError;
use crate::models::{
    Announcement, BudgetDocument, Habit, ReferralCode, ReferralOutcome, Transaction, UserProfile,
};
use crate::registry::normalize_code;
use crate::session::{decode_each, Session};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

const MIN_CODE_LEN: usize = 3;

impl Session {
    pub async fn list_users(&self) -> Vec<UserProfile> {
        if !self.is_admin() {
            return Vec::new();
        }
        match self.store().query_collection(paths::USERS, &Query::new()).await {
            Ok(docs) => profiles(&docs),
            Err(err) => {
                error!("admin: listing users failed: {err}");
                Vec::new()
            }
        }
    }

    /// Live user directory; decode each snapshot with [`profiles`]. A
    /// non-admin gets a stream that is already closed.
    pub async fn subscribe_users(
        &self,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, SessionError> {
        if !self.is_admin() {
            let (_, closed) = mpsc::unbounded_channel();
            return Ok(Subscription::new(closed));
        }
        Ok(self.store().subscribe_collection(paths::USERS).await?)
    }

    pub async fn user_habits(&self, target: &str) -> Vec<Habit> {
        self.read_collection(&paths::habits(target)).await
    }

    pub async fn user_transactions(&self, target: &str) -> Vec<Transaction> {
        self.read_collection(&paths::transactions(target)).await
    }

    pub async fn user_budget_limit(&self, target: &str) -> f64 {
        if !self.is_admin() {
            return 0.0;
        }
        match self.store().get_document(&paths::budget(target)).await {
            Ok(snapshot) => snapshot
                .decode::<BudgetDocument>()
                .map(|doc| doc.limit)
                .unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }

    async fn read_collection<T: serde::de::DeserializeOwned>(&self, path: &str) -> Vec<T> {
        if !self.is_admin() {
            return Vec::new();
        }
        match self.store().query_collection(path, &Query::new()).await {
            Ok(docs) => decode_each(&docs),
            Err(err) => {
                error!(path, "admin: read failed: {err}");
                Vec::new()
            }
        }
    }

    /// Creates or refreshes a directory entry by hand. Returns `false` for
    /// non-admins.
    pub async fn admin_create_user(
        &self,
        uid: &str,
        email: &str,
        display_name: &str,
    ) -> Result<bool, SessionError> {
        if !self.is_admin() {
            return Ok(false);
        }
        if uid.trim().is_empty() {
            return Err(SessionError::validation("uid must not be empty"));
        }
        let mut profile = Fields::new();
        profile.insert("email".into(), Value::String(email.to_string()));
        profile.insert("displayName".into(), Value::String(display_name.to_string()));
        profile.insert(
            "photoURL".into(),
            Value::String(format!(
                "https://ui-avatars.com/api/?name={}&background=6366f1&color=fff",
                display_name.trim().replace(' ', "+")
            )),
        );
        profile.insert("lastActive".into(), Value::String(Utc::now().to_rfc3339()));
        self.store()
            .set_document(&paths::user(uid), profile, SetOptions::merge())
            .await?;
        info!(uid, "admin: user created");
        Ok(true)
    }

    pub async fn create_referral_code(&self, code: &str, owner_email: &str) -> ReferralOutcome {
        if !self.is_admin() {
            return ReferralOutcome::failed("Unauthorized");
        }
        let code = normalize_code(code);
        if code.len() < MIN_CODE_LEN {
            return ReferralOutcome::failed("Code too short");
        }
        match self.insert_referral_code(&code, owner_email).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%code, "create referral failed: {err}");
                ReferralOutcome::failed(err.to_string())
            }
        }
    }

    async fn insert_referral_code(
        &self,
        code: &str,
        owner_email: &str,
    ) -> Result<ReferralOutcome, SessionError> {
        let path = paths::referral_code(code);
        if self.store().get_document(&path).await?.exists() {
            return Ok(ReferralOutcome::failed("Code already exists"));
        }

        let owners = self
            .store()
            .query_collection(
                paths::USERS,
                &Query::new().where_eq("email", owner_email.trim()).limit(1),
            )
            .await?;
        let Some(owner) = owners.first().and_then(profile_from) else {
            return Ok(ReferralOutcome::failed("User email not found in registry"));
        };
        let owner_name = owner
            .display_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "User".to_string());

        let record = ReferralCode {
            code: code.to_string(),
            owner_uid: owner.uid,
            owner_name: owner_name.clone(),
            created_at: Utc::now().to_rfc3339(),
            count: 0,
        };
        let mut body = to_fields(&path, &record)?;
        body.remove("code");
        self.store()
            .set_document(&path, body, SetOptions::default())
            .await?;

        Ok(ReferralOutcome {
            success: true,
            message: format!("Code {code} created for {owner_name}"),
        })
    }

    pub async fn referral_stats(&self) -> Vec<ReferralCode> {
        if !self.is_admin() {
            return Vec::new();
        }
        match self
            .store()
            .query_collection(paths::REFERRAL_CODES, &Query::new())
            .await
        {
            Ok(docs) => docs
                .iter()
                .filter_map(|snap| {
                    let mut record: ReferralCode = snap.decode().ok()?;
                    record.code = snap.id.clone();
                    Some(record)
                })
                .collect(),
            Err(err) => {
                error!("get referral stats failed: {err}");
                Vec::new()
            }
        }
    }

    pub async fn announcement(&self) -> Option<Announcement> {
        read_announcement(self.store()).await
    }

    pub async fn set_announcement(
        &self,
        text: &str,
        kind: &str,
        active: bool,
    ) -> Result<bool, SessionError> {
        if !self.is_admin() {
            return Ok(false);
        }
        let announcement = Announcement {
            text: text.to_string(),
            kind: kind.to_string(),
            active,
            updated_at: Utc::now().to_rfc3339(),
            by: self.uid().to_string(),
        };
        let mut body = Fields::new();
        body.insert(
            "announcement".into(),
            Value::Object(to_fields(paths::SETTINGS_GLOBAL, &announcement)?),
        );
        self.store()
            .set_document(paths::SETTINGS_GLOBAL, body, SetOptions::merge())
            .await?;
        Ok(true)
    }
}

/// Global banner, readable without privileges.
pub async fn read_announcement(store: &dyn DocumentStore) -> Option<Announcement> {
    let snapshot = match store.get_document(paths::SETTINGS_GLOBAL).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!("fetch announcement failed: {err}");
            return None;
        }
    };
    let value = snapshot.data?.remove("announcement")?;
    serde_json::from_value(value).ok()
}

pub fn profiles(docs: &[DocumentSnapshot]) -> Vec<UserProfile> {
    docs.iter().filter_map(profile_from).collect()
}

fn profile_from(snapshot: &DocumentSnapshot) -> Option<UserProfile> {
    let mut profile: UserProfile = snapshot.decode().ok()?;
    profile.uid = snapshot.id.clone();
    Some(profile)
}
