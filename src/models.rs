use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_EMOJI: &str = "⚡";
pub const DEFAULT_CATEGORY: &str = "other";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// Days a habit was completed. Stored as `{"YYYY-MM-DD": true}`; only
/// presence matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History(BTreeSet<NaiveDate>);

impl History {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.0.contains(&date)
    }

    /// Flips presence of `date`, returning whether it is now present.
    pub fn toggle(&mut self, date: NaiveDate) -> bool {
        if self.0.remove(&date) {
            false
        } else {
            self.0.insert(date);
            true
        }
    }

    pub fn insert(&mut self, date: NaiveDate) {
        self.0.insert(date);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NaiveDate> {
        self.0.iter()
    }
}

impl FromIterator<NaiveDate> for History {
    fn from_iter<I: IntoIterator<Item = NaiveDate>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for History {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for date in &self.0 {
            map.serialize_entry(&date_key(*date), &true)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for History {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, bool>::deserialize(deserializer)?;
        let mut dates = BTreeSet::new();
        for (key, done) in raw {
            let date = parse_date(&key)
                .ok_or_else(|| de::Error::custom(format!("invalid history date '{key}'")))?;
            if done {
                dates.insert(date);
            }
        }
        Ok(Self(dates))
    }
}

fn default_emoji() -> String {
    DEFAULT_EMOJI.to_string()
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub has_reminder: bool,
    #[serde(default)]
    pub history: History,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    pub amount: f64,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default = "default_category")]
    pub category: String,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

pub type Occasions = BTreeMap<NaiveDate, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetDocument {
    #[serde(default)]
    pub limit: f64,
}

/// Identity handed over by the auth provider on sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub last_active: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referred_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCode {
    #[serde(default)]
    pub code: String,
    pub owner_uid: String,
    pub owner_name: String,
    pub created_at: String,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralOutcome {
    pub success: bool,
    pub message: String,
}

impl ReferralOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub active: bool,
    pub updated_at: String,
    pub by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitStats {
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
    pub best_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCompletion {
    pub date: String,
    pub eligible: usize,
    pub completed: usize,
    pub percentage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Over,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    pub balance: f64,
    pub income: f64,
    pub expense: f64,
    pub month_expenses: f64,
    pub limit: Option<f64>,
    pub progress: Option<f64>,
    pub remaining: Option<f64>,
    pub status: Option<BudgetStatus>,
    pub by_category: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HabitView {
    #[serde(flatten)]
    pub habit: Habit,
    pub streak: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub uid: String,
    pub is_admin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub date: String,
    pub done: bool,
    pub streak: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BudgetResponse {
    pub limit: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminWriteResponse {
    pub applied: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BudgetQuery {
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserRequest {
    pub uid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    #[serde(flatten)]
    pub identity: UserIdentity,
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitRequest {
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub has_reminder: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct OccasionRequest {
    pub date: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRequest {
    pub amount: f64,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BudgetRequest {
    pub limit: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRequest {
    pub code: String,
    pub owner_email: String,
}

#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub text: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentSnapshot, to_fields};
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_habit(history: History) -> Habit {
        Habit {
            id: "h1".into(),
            name: "Drink Water".into(),
            emoji: "💧".into(),
            time: Some("07:30".into()),
            has_reminder: true,
            history,
            created_at: "2024-01-01T08:15:00.123Z".parse().unwrap(),
        }
    }

    #[test]
    fn habit_document_round_trip_keeps_empty_history() {
        let habit = sample_habit(History::default());
        let fields = to_fields("users/u/habits/h1", &habit).unwrap();
        assert_eq!(fields.get("history"), Some(&json!({})));
        assert_eq!(fields.get("hasReminder"), Some(&json!(true)));
        assert!(!fields.contains_key("id"));

        let snap = DocumentSnapshot::new("users/u/habits/h1", Some(fields));
        let back: Habit = snap.decode_with_id().unwrap();
        assert_eq!(back, habit);
    }

    #[test]
    fn habit_document_round_trip_keeps_history_dates() {
        let habit = sample_habit([day(2024, 1, 1), day(2023, 12, 31)].into_iter().collect());
        let fields = to_fields("users/u/habits/h1", &habit).unwrap();
        assert_eq!(
            fields.get("history"),
            Some(&json!({ "2023-12-31": true, "2024-01-01": true }))
        );
        let back: Habit = DocumentSnapshot::new("users/u/habits/h1", Some(fields))
            .decode_with_id()
            .unwrap();
        assert_eq!(back, habit);
    }

    #[test]
    fn history_drops_false_entries_and_rejects_bad_keys() {
        let history: History =
            serde_json::from_value(json!({ "2024-01-02": true, "2024-01-03": false })).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history.contains(day(2024, 1, 2)));

        let bad = serde_json::from_value::<History>(json!({ "yesterday": true }));
        assert!(bad.is_err());
    }

    #[test]
    fn habit_defaults_emoji_when_absent() {
        let habit: Habit = serde_json::from_value(json!({
            "id": "a",
            "name": "Stretch",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(habit.emoji, DEFAULT_EMOJI);
        assert!(habit.history.is_empty());
        assert_eq!(habit.time, None);
    }

    #[test]
    fn toggle_flips_presence() {
        let mut history = History::default();
        assert!(history.toggle(day(2024, 5, 1)));
        assert!(!history.toggle(day(2024, 5, 1)));
        assert!(history.is_empty());
    }

    #[test]
    fn transaction_uses_type_field() {
        let tx: Transaction = serde_json::from_value(json!({
            "id": "t1",
            "amount": 12.5,
            "description": "Lunch",
            "type": "expense",
            "date": "2024-02-03",
            "createdAt": "2024-02-03T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(tx.kind, TransactionKind::Expense);
        assert_eq!(tx.category, DEFAULT_CATEGORY);
        assert_eq!(date_key(tx.date), "2024-02-03");
    }
}
