use crate::admin::read_announcement;
use crate::errors::AppError;
use crate::models::{
    date_key, parse_date, AdminUserRequest, AdminWriteResponse, Announcement,
    AnnouncementRequest, BudgetQuery, BudgetRequest, BudgetResponse, BudgetSummary,
    DailyCompletion, Habit, HabitRequest, HabitStats, HabitView, HistoryQuery, OccasionRequest,
    Occasions, ReferralCode, ReferralOutcome, ReferralRequest, SessionResponse, SignInRequest,
    ToggleRequest, ToggleResponse, Transaction, TransactionRequest, UserProfile,
};
use crate::state::AppState;
use crate::stats::calculate_streak;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;

const DEFAULT_HISTORY_DAYS: u32 = 7;
const MAX_HISTORY_DAYS: u32 = 366;

fn parse_request_date(raw: &str) -> Result<NaiveDate, AppError> {
    parse_date(raw).ok_or_else(|| AppError::bad_request(format!("invalid date '{raw}'")))
}

pub async fn sign_in(
    State(state): State<AppState>,
    Json(payload): Json<SignInRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .sign_in(payload.identity, payload.referral_code.as_deref())
        .await?;
    Ok(Json(SessionResponse {
        uid: session.uid().to_string(),
        is_admin: session.is_admin(),
    }))
}

pub async fn sign_out(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sign_out(&uid).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("no session for user {uid}")))
    }
}

pub async fn list_habits(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<HabitView>>, AppError> {
    let session = state.session(&uid).await?;
    let views = session
        .habits()
        .await
        .into_iter()
        .map(|habit| HabitView {
            streak: calculate_streak(&habit),
            habit,
        })
        .collect();
    Ok(Json(views))
}

pub async fn create_habit(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<HabitRequest>,
) -> Result<(StatusCode, Json<Habit>), AppError> {
    let session = state.session(&uid).await?;
    let habit = session.add_habit(payload).await?;
    Ok((StatusCode::CREATED, Json(habit)))
}

pub async fn update_habit(
    State(state): State<AppState>,
    Path((uid, id)): Path<(String, String)>,
    Json(payload): Json<HabitRequest>,
) -> Result<Json<Habit>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.update_habit(&id, payload).await?))
}

pub async fn delete_habit(
    State(state): State<AppState>,
    Path((uid, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&uid).await?;
    session.delete_habit(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_habit(
    State(state): State<AppState>,
    Path((uid, id)): Path<(String, String)>,
    Json(payload): Json<ToggleRequest>,
) -> Result<Json<ToggleResponse>, AppError> {
    let session = state.session(&uid).await?;
    let date = parse_request_date(&payload.date)?;
    let done = session.toggle_check(&id, date).await?;
    let streak = session.streak(&id).await.unwrap_or(0);
    Ok(Json(ToggleResponse {
        date: date_key(date),
        done,
        streak,
    }))
}

pub async fn get_stats(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<HabitStats>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.stats().await))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DailyCompletion>>, AppError> {
    let session = state.session(&uid).await?;
    let days = query
        .days
        .unwrap_or(DEFAULT_HISTORY_DAYS)
        .clamp(1, MAX_HISTORY_DAYS);
    Ok(Json(session.completion_series(days).await))
}

pub async fn get_occasions(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Occasions>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.occasions().await))
}

pub async fn save_occasion(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<OccasionRequest>,
) -> Result<Json<Occasions>, AppError> {
    let session = state.session(&uid).await?;
    let date = parse_request_date(&payload.date)?;
    session.save_occasion(date, &payload.text).await?;
    Ok(Json(session.occasions().await))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.transactions().await))
}

pub async fn create_transaction(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<TransactionRequest>,
) -> Result<(StatusCode, Json<Transaction>), AppError> {
    let session = state.session(&uid).await?;
    let transaction = session.add_transaction(payload).await?;
    Ok((StatusCode::CREATED, Json(transaction)))
}

pub async fn delete_transaction(
    State(state): State<AppState>,
    Path((uid, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&uid).await?;
    session.delete_transaction(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_budget(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<BudgetResponse>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(BudgetResponse {
        limit: session.budget_limit().await,
    }))
}

pub async fn save_budget(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<BudgetRequest>,
) -> Result<Json<BudgetResponse>, AppError> {
    let session = state.session(&uid).await?;
    session.save_budget_limit(payload.limit).await?;
    Ok(Json(BudgetResponse {
        limit: session.budget_limit().await,
    }))
}

pub async fn budget_summary(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(query): Query<BudgetQuery>,
) -> Result<Json<BudgetSummary>, AppError> {
    let session = state.session(&uid).await?;
    let category = query.category.as_deref().filter(|c| !c.is_empty() && *c != "all");
    Ok(Json(session.budget_summary(category).await))
}

pub async fn admin_users(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.list_users().await))
}

pub async fn admin_create_user(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<AdminUserRequest>,
) -> Result<Json<AdminWriteResponse>, AppError> {
    let session = state.session(&uid).await?;
    let applied = session
        .admin_create_user(&payload.uid, &payload.email, &payload.display_name)
        .await?;
    Ok(Json(AdminWriteResponse { applied }))
}

pub async fn admin_user_habits(
    State(state): State<AppState>,
    Path((uid, target)): Path<(String, String)>,
) -> Result<Json<Vec<Habit>>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.user_habits(&target).await))
}

pub async fn admin_user_transactions(
    State(state): State<AppState>,
    Path((uid, target)): Path<(String, String)>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.user_transactions(&target).await))
}

pub async fn admin_user_budget(
    State(state): State<AppState>,
    Path((uid, target)): Path<(String, String)>,
) -> Result<Json<BudgetResponse>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(BudgetResponse {
        limit: session.user_budget_limit(&target).await,
    }))
}

pub async fn admin_referrals(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<ReferralCode>>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(session.referral_stats().await))
}

pub async fn admin_create_referral(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<ReferralRequest>,
) -> Result<Json<ReferralOutcome>, AppError> {
    let session = state.session(&uid).await?;
    Ok(Json(
        session
            .create_referral_code(&payload.code, &payload.owner_email)
            .await,
    ))
}

pub async fn get_announcement(State(state): State<AppState>) -> Json<Option<Announcement>> {
    Json(read_announcement(state.store.as_ref()).await)
}

pub async fn admin_set_announcement(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Json(payload): Json<AnnouncementRequest>,
) -> Result<Json<AdminWriteResponse>, AppError> {
    let session = state.session(&uid).await?;
    let kind = payload.kind.as_deref().unwrap_or("info");
    let applied = session
        .set_announcement(&payload.text, kind, payload.active)
        .await?;
    Ok(Json(AdminWriteResponse { applied }))
}
