//! Per-user local state cache.
//!
//! A [`Session`] mirrors one signed-in user's habits, occasions, transactions
//! and budget limit. Mutations are applied to the mirror first, then written
//! to the document store; a failed write restores the touched slice and is
//! reported both to the caller and on the change channel.

use crate::config::SessionConfig;
use crate::document::{
    paths, to_fields, Direction, DocumentSnapshot, DocumentStore, Fields, Query, SetOptions,
    Subscription,
};
use crate::errors::{SessionError, StoreError};
use crate::models::{
    BudgetDocument, BudgetSummary, DailyCompletion, Habit, HabitRequest, HabitStats, History,
    Occasions, Transaction, TransactionRequest, UserIdentity, DEFAULT_CATEGORY, DEFAULT_EMOJI,
};
use crate::registry;
use crate::stats;
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slice {
    Habits,
    Occasions,
    Budget,
    Transactions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Updated(Slice),
    /// The subscription feeding `slice` ended with an error. It is not
    /// reopened until [`Session::subscribe`] is called again.
    SyncFailed { slice: Slice, error: StoreError },
    /// A write was rejected and the local change to `slice` was reverted.
    MutationFailed {
        slice: Slice,
        operation: &'static str,
        error: StoreError,
    },
}

#[derive(Debug, Default)]
struct Mirror {
    habits: Vec<Habit>,
    occasions: Occasions,
    transactions: Vec<Transaction>,
    budget_limit: f64,
}

#[derive(Default)]
struct Tasks {
    subscriptions: Vec<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    transactions_fetch: Option<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    identity: UserIdentity,
    config: SessionConfig,
    is_admin: bool,
    mirror: Mutex<Mirror>,
    /// Held shared by transaction writes and exclusively by a refresh, so a
    /// refresh never overlaps a write it could not have observed.
    transaction_writes: RwLock<()>,
    tasks: Mutex<Tasks>,
    events: broadcast::Sender<ChangeEvent>,
    disposed: AtomicBool,
}

impl Inner {
    fn emit(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct HabitDraft {
    name: String,
    emoji: String,
    time: Option<String>,
    has_reminder: bool,
}

impl Session {
    /// Opens a session for a freshly signed-in user: syncs the user registry
    /// (redeeming `referral_code` for new users), subscribes to habits,
    /// occasions and budget, fetches recent transactions in the background
    /// and starts the activity heartbeat.
    pub async fn load(
        store: Arc<dyn DocumentStore>,
        identity: UserIdentity,
        config: SessionConfig,
        referral_code: Option<&str>,
    ) -> Result<Self, SessionError> {
        if identity.uid.trim().is_empty() {
            return Err(SessionError::validation("uid must not be empty"));
        }

        let is_admin = config.is_admin_email(identity.email.as_deref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Self {
            inner: Arc::new(Inner {
                store,
                identity,
                config,
                is_admin,
                mirror: Mutex::new(Mirror::default()),
                transaction_writes: RwLock::new(()),
                tasks: Mutex::new(Tasks::default()),
                events,
                disposed: AtomicBool::new(false),
            }),
        };
        info!(uid = %session.uid(), is_admin, "loading session");

        registry::update_user_registry(session.store(), &session.inner.identity, referral_code)
            .await;
        session.subscribe().await?;
        session.spawn_transactions_fetch().await;

        let heartbeat = registry::spawn_heartbeat(
            Arc::downgrade(&session.inner),
            Arc::clone(&session.inner.store),
            session.inner.identity.clone(),
            session.inner.config.heartbeat_interval,
        );
        if let Some(previous) = session.inner.tasks.lock().await.heartbeat.replace(heartbeat) {
            previous.abort();
        }

        Ok(session)
    }

    pub fn uid(&self) -> &str {
        &self.inner.identity.uid
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.inner.identity
    }

    pub fn is_admin(&self) -> bool {
        self.inner.is_admin
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn store(&self) -> &dyn DocumentStore {
        self.inner.store.as_ref()
    }

    /// Receiver for every change applied to the mirror from now on.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// (Re)opens the habit, occasion and budget subscriptions, tearing down
    /// any that are already running.
    pub async fn subscribe(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.unsubscribe().await;

        let uid = self.uid();
        let store = self.store();
        let habits = store.subscribe_collection(&paths::habits(uid)).await?;
        let occasions = store.subscribe_document(&paths::occasions(uid)).await?;
        let budget = store.subscribe_document(&paths::budget(uid)).await?;

        let handles = vec![
            self.spawn_drain(Slice::Habits, habits, apply_habits),
            self.spawn_drain(Slice::Occasions, occasions, apply_occasions),
            self.spawn_drain(Slice::Budget, budget, apply_budget),
        ];
        let mut tasks = self.inner.tasks.lock().await;
        for stale in std::mem::replace(&mut tasks.subscriptions, handles) {
            stale.abort();
        }
        Ok(())
    }

    pub async fn unsubscribe(&self) {
        let handles = std::mem::take(&mut self.inner.tasks.lock().await.subscriptions);
        for handle in handles {
            handle.abort();
        }
    }

    /// Stops subscriptions, the heartbeat and any pending fetch. Later
    /// mutations fail with [`SessionError::Disposed`].
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock().await;
        for handle in tasks.subscriptions.drain(..) {
            handle.abort();
        }
        if let Some(handle) = tasks.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.transactions_fetch.take() {
            handle.abort();
        }
        info!(uid = %self.uid(), "session disposed");
    }

    fn spawn_drain<T: Send + 'static>(
        &self,
        slice: Slice,
        mut subscription: Subscription<T>,
        apply: fn(&mut Mirror, T),
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(next) = subscription.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match next {
                    Ok(snapshot) => {
                        apply(&mut *inner.mirror.lock().await, snapshot);
                        inner.emit(ChangeEvent::Updated(slice));
                    }
                    Err(err) => {
                        error!(uid = %inner.identity.uid, ?slice, "subscription failed: {err}");
                        inner.emit(ChangeEvent::SyncFailed { slice, error: err });
                        break;
                    }
                }
            }
        })
    }

    async fn spawn_transactions_fetch(&self) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = session.refresh_transactions().await {
                error!(uid = %session.uid(), "error fetching transactions: {err}");
            }
        });
        if let Some(previous) = self.inner.tasks.lock().await.transactions_fetch.replace(handle) {
            previous.abort();
        }
    }

    /// Replaces the transaction slice with the most recent ones by date.
    pub async fn refresh_transactions(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        let _refreshing = self.inner.transaction_writes.write().await;
        let query = Query::new()
            .order_by("date", Direction::Descending)
            .limit(self.inner.config.transaction_limit);
        let docs = self
            .store()
            .query_collection(&paths::transactions(self.uid()), &query)
            .await?;
        let transactions: Vec<Transaction> = decode_each(&docs);
        self.inner.mirror.lock().await.transactions = transactions;
        self.inner.emit(ChangeEvent::Updated(Slice::Transactions));
        info!(uid = %self.uid(), "transactions fetched");
        Ok(())
    }

    pub async fn habits(&self) -> Vec<Habit> {
        self.inner.mirror.lock().await.habits.clone()
    }

    pub async fn habit(&self, id: &str) -> Option<Habit> {
        self.inner
            .mirror
            .lock()
            .await
            .habits
            .iter()
            .find(|habit| habit.id == id)
            .cloned()
    }

    pub async fn occasions(&self) -> Occasions {
        self.inner.mirror.lock().await.occasions.clone()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.inner.mirror.lock().await.transactions.clone()
    }

    /// Monthly expense ceiling; 0 when unset.
    pub async fn budget_limit(&self) -> f64 {
        self.inner.mirror.lock().await.budget_limit
    }

    pub async fn streak(&self, id: &str) -> Option<u32> {
        self.habit(id).await.map(|habit| stats::calculate_streak(&habit))
    }

    pub async fn stats(&self) -> HabitStats {
        stats::build_stats(&self.inner.mirror.lock().await.habits)
    }

    pub async fn completion_series(&self, days: u32) -> Vec<DailyCompletion> {
        let mirror = self.inner.mirror.lock().await;
        stats::completion_series_at(&mirror.habits, stats::today(), days)
    }

    pub async fn budget_summary(&self, category: Option<&str>) -> BudgetSummary {
        let mirror = self.inner.mirror.lock().await;
        stats::budget_summary_at(
            &mirror.transactions,
            mirror.budget_limit,
            stats::today(),
            category,
        )
    }

    pub async fn add_habit(&self, request: HabitRequest) -> Result<Habit, SessionError> {
        self.ensure_active()?;
        let draft = validate_habit(request)?;
        let habit = Habit {
            id: self.inner.store.new_document_id(),
            name: draft.name,
            emoji: draft.emoji,
            time: draft.time,
            has_reminder: draft.has_reminder,
            history: History::default(),
            created_at: Utc::now(),
        };
        let path = paths::habit(self.uid(), &habit.id);
        let body = to_fields(&path, &habit)?;

        self.inner.mirror.lock().await.habits.push(habit.clone());
        self.inner.emit(ChangeEvent::Updated(Slice::Habits));

        match self
            .store()
            .set_document(&path, body, SetOptions::default())
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(habit)
            }
            Err(err) => {
                self.inner
                    .mirror
                    .lock()
                    .await
                    .habits
                    .retain(|existing| existing.id != habit.id);
                Err(self.reverted(Slice::Habits, "add_habit", err))
            }
        }
    }

    pub async fn update_habit(
        &self,
        id: &str,
        request: HabitRequest,
    ) -> Result<Habit, SessionError> {
        self.ensure_active()?;
        let draft = validate_habit(request)?;

        let (previous, updated) = {
            let mut mirror = self.inner.mirror.lock().await;
            let habit = mirror
                .habits
                .iter_mut()
                .find(|habit| habit.id == id)
                .ok_or_else(|| SessionError::HabitNotFound(id.to_string()))?;
            let previous = habit.clone();
            habit.name = draft.name;
            habit.emoji = draft.emoji;
            habit.time = draft.time;
            habit.has_reminder = draft.has_reminder;
            (previous, habit.clone())
        };
        self.inner.emit(ChangeEvent::Updated(Slice::Habits));

        let mut partial = Fields::new();
        partial.insert("name".into(), Value::String(updated.name.clone()));
        partial.insert("emoji".into(), Value::String(updated.emoji.clone()));
        partial.insert(
            "time".into(),
            updated.time.clone().map(Value::String).unwrap_or(Value::Null),
        );
        partial.insert("hasReminder".into(), Value::Bool(updated.has_reminder));

        match self
            .store()
            .update_document(&paths::habit(self.uid(), id), partial)
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(updated)
            }
            Err(err) => {
                let mut mirror = self.inner.mirror.lock().await;
                if let Some(habit) = mirror.habits.iter_mut().find(|habit| habit.id == id) {
                    habit.name = previous.name;
                    habit.emoji = previous.emoji;
                    habit.time = previous.time;
                    habit.has_reminder = previous.has_reminder;
                }
                drop(mirror);
                Err(self.reverted(Slice::Habits, "update_habit", err))
            }
        }
    }

    pub async fn delete_habit(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let (index, removed) = {
            let mut mirror = self.inner.mirror.lock().await;
            let index = mirror
                .habits
                .iter()
                .position(|habit| habit.id == id)
                .ok_or_else(|| SessionError::HabitNotFound(id.to_string()))?;
            (index, mirror.habits.remove(index))
        };
        self.inner.emit(ChangeEvent::Updated(Slice::Habits));

        match self
            .store()
            .delete_document(&paths::habit(self.uid(), id))
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(())
            }
            Err(err) => {
                let mut mirror = self.inner.mirror.lock().await;
                if !mirror.habits.iter().any(|habit| habit.id == id) {
                    let index = index.min(mirror.habits.len());
                    mirror.habits.insert(index, removed);
                }
                drop(mirror);
                Err(self.reverted(Slice::Habits, "delete_habit", err))
            }
        }
    }

    /// Flips completion of `date` for a habit. Returns whether the date is
    /// now marked complete.
    pub async fn toggle_check(&self, id: &str, date: NaiveDate) -> Result<bool, SessionError> {
        self.ensure_active()?;
        if date > stats::today() {
            return Err(SessionError::validation("cannot check a future date"));
        }

        let path = paths::habit(self.uid(), id);
        let (done, history) = {
            let mut mirror = self.inner.mirror.lock().await;
            let habit = mirror
                .habits
                .iter_mut()
                .find(|habit| habit.id == id)
                .ok_or_else(|| SessionError::HabitNotFound(id.to_string()))?;
            let done = habit.history.toggle(date);
            let history = serde_json::to_value(&habit.history)
                .map_err(|err| StoreError::invalid(&path, err))?;
            (done, history)
        };
        self.inner.emit(ChangeEvent::Updated(Slice::Habits));

        let mut partial = Fields::new();
        partial.insert("history".into(), history);
        match self.store().update_document(&path, partial).await {
            Ok(()) => {
                self.touch_activity().await;
                Ok(done)
            }
            Err(err) => {
                let mut mirror = self.inner.mirror.lock().await;
                if let Some(habit) = mirror.habits.iter_mut().find(|habit| habit.id == id) {
                    if habit.history.contains(date) == done {
                        habit.history.toggle(date);
                    }
                }
                drop(mirror);
                Err(self.reverted(Slice::Habits, "toggle_check", err))
            }
        }
    }

    /// Sets the label for `date`; blank text removes it.
    pub async fn save_occasion(&self, date: NaiveDate, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let text = text.trim();
        let path = paths::occasions(self.uid());

        let (previous, body) = {
            let mut mirror = self.inner.mirror.lock().await;
            let previous = if text.is_empty() {
                mirror.occasions.remove(&date)
            } else {
                mirror.occasions.insert(date, text.to_string())
            };
            (previous, to_fields(&path, &mirror.occasions))
        };
        self.inner.emit(ChangeEvent::Updated(Slice::Occasions));

        let result = match body {
            Ok(body) => {
                self.store()
                    .set_document(&path, body, SetOptions::default())
                    .await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.touch_activity().await;
                Ok(())
            }
            Err(err) => {
                let mut mirror = self.inner.mirror.lock().await;
                match previous {
                    Some(label) => mirror.occasions.insert(date, label),
                    None => mirror.occasions.remove(&date),
                };
                drop(mirror);
                Err(self.reverted(Slice::Occasions, "save_occasion", err))
            }
        }
    }

    pub async fn add_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<Transaction, SessionError> {
        self.ensure_active()?;
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(SessionError::validation("amount must be a positive number"));
        }
        let description = request.description.trim();
        if description.is_empty() {
            return Err(SessionError::validation("description must not be empty"));
        }
        let date = match request.date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => crate::models::parse_date(raw)
                .ok_or_else(|| SessionError::validation(format!("invalid date '{raw}'")))?,
            _ => stats::today(),
        };
        let category = request
            .category
            .as_deref()
            .map(str::trim)
            .filter(|category| !category.is_empty())
            .unwrap_or(DEFAULT_CATEGORY)
            .to_string();

        let transaction = Transaction {
            id: self.inner.store.new_document_id(),
            amount: request.amount,
            description: description.to_string(),
            kind: request.kind,
            category,
            date,
            created_at: Utc::now(),
        };
        let path = paths::transaction(self.uid(), &transaction.id);
        let body = to_fields(&path, &transaction)?;

        let _writing = self.inner.transaction_writes.read().await;
        {
            let mut mirror = self.inner.mirror.lock().await;
            mirror.transactions.push(transaction.clone());
            mirror.transactions.sort_by(|a, b| b.date.cmp(&a.date));
        }
        self.inner.emit(ChangeEvent::Updated(Slice::Transactions));

        match self
            .store()
            .set_document(&path, body, SetOptions::default())
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(transaction)
            }
            Err(err) => {
                self.inner
                    .mirror
                    .lock()
                    .await
                    .transactions
                    .retain(|existing| existing.id != transaction.id);
                Err(self.reverted(Slice::Transactions, "add_transaction", err))
            }
        }
    }

    pub async fn delete_transaction(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let _writing = self.inner.transaction_writes.read().await;
        let (index, removed) = {
            let mut mirror = self.inner.mirror.lock().await;
            let index = mirror
                .transactions
                .iter()
                .position(|tx| tx.id == id)
                .ok_or_else(|| SessionError::TransactionNotFound(id.to_string()))?;
            (index, mirror.transactions.remove(index))
        };
        self.inner.emit(ChangeEvent::Updated(Slice::Transactions));

        match self
            .store()
            .delete_document(&paths::transaction(self.uid(), id))
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(())
            }
            Err(err) => {
                let mut mirror = self.inner.mirror.lock().await;
                if !mirror.transactions.iter().any(|tx| tx.id == id) {
                    let index = index.min(mirror.transactions.len());
                    mirror.transactions.insert(index, removed);
                }
                drop(mirror);
                Err(self.reverted(Slice::Transactions, "delete_transaction", err))
            }
        }
    }

    /// Stores the monthly expense ceiling; 0 clears it.
    pub async fn save_budget_limit(&self, limit: f64) -> Result<(), SessionError> {
        self.ensure_active()?;
        if !limit.is_finite() || limit < 0.0 {
            return Err(SessionError::validation("budget limit must be zero or positive"));
        }
        let path = paths::budget(self.uid());
        let body = to_fields(&path, &BudgetDocument { limit })?;

        let previous = std::mem::replace(&mut self.inner.mirror.lock().await.budget_limit, limit);
        self.inner.emit(ChangeEvent::Updated(Slice::Budget));

        match self
            .store()
            .set_document(&path, body, SetOptions::default())
            .await
        {
            Ok(()) => {
                self.touch_activity().await;
                Ok(())
            }
            Err(err) => {
                self.inner.mirror.lock().await.budget_limit = previous;
                Err(self.reverted(Slice::Budget, "save_budget_limit", err))
            }
        }
    }

    async fn touch_activity(&self) {
        registry::touch_activity(self.store(), self.uid()).await;
    }

    fn reverted(&self, slice: Slice, operation: &'static str, err: StoreError) -> SessionError {
        error!(uid = %self.uid(), operation, "write failed, local change reverted: {err}");
        self.inner.emit(ChangeEvent::MutationFailed {
            slice,
            operation,
            error: err.clone(),
        });
        self.inner.emit(ChangeEvent::Updated(slice));
        SessionError::Store(err)
    }
}

fn validate_habit(request: HabitRequest) -> Result<HabitDraft, SessionError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(SessionError::validation("habit name must not be empty"));
    }
    let emoji = request
        .emoji
        .as_deref()
        .map(str::trim)
        .filter(|emoji| !emoji.is_empty())
        .unwrap_or(DEFAULT_EMOJI)
        .to_string();
    let time = request
        .time
        .as_deref()
        .map(str::trim)
        .filter(|time| !time.is_empty())
        .map(|time| {
            NaiveTime::parse_from_str(time, "%H:%M")
                .map(|_| time.to_string())
                .map_err(|_| SessionError::validation(format!("invalid reminder time '{time}'")))
        })
        .transpose()?;
    if request.has_reminder && time.is_none() {
        return Err(SessionError::validation("a reminder needs a time"));
    }

    Ok(HabitDraft {
        name: name.to_string(),
        emoji,
        time,
        has_reminder: request.has_reminder,
    })
}

pub(crate) fn decode_each<T: serde::de::DeserializeOwned>(docs: &[DocumentSnapshot]) -> Vec<T> {
    docs.iter()
        .filter_map(|snap| match snap.decode_with_id() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("skipping document: {err}");
                None
            }
        })
        .collect()
}

fn apply_habits(mirror: &mut Mirror, docs: Vec<DocumentSnapshot>) {
    mirror.habits = decode_each(&docs);
}

fn apply_occasions(mirror: &mut Mirror, snapshot: DocumentSnapshot) {
    mirror.occasions = snapshot.decode().unwrap_or_else(|err| {
        warn!("ignoring occasions document: {err}");
        Occasions::new()
    });
}

fn apply_budget(mirror: &mut Mirror, snapshot: DocumentSnapshot) {
    mirror.budget_limit = snapshot
        .decode::<BudgetDocument>()
        .map(|doc| doc.limit)
        .unwrap_or_else(|err| {
            warn!("ignoring budget document: {err}");
            0.0
        });
}
