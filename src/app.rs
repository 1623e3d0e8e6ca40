use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{delete, get, post, put},
    Router,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(handlers::sign_in))
        .route("/api/sessions/:uid", delete(handlers::sign_out))
        .route(
            "/api/users/:uid/habits",
            get(handlers::list_habits).post(handlers::create_habit),
        )
        .route(
            "/api/users/:uid/habits/:id",
            put(handlers::update_habit).delete(handlers::delete_habit),
        )
        .route("/api/users/:uid/habits/:id/toggle", post(handlers::toggle_habit))
        .route("/api/users/:uid/stats", get(handlers::get_stats))
        .route("/api/users/:uid/history", get(handlers::get_history))
        .route(
            "/api/users/:uid/occasions",
            get(handlers::get_occasions).put(handlers::save_occasion),
        )
        .route(
            "/api/users/:uid/transactions",
            get(handlers::list_transactions).post(handlers::create_transaction),
        )
        .route(
            "/api/users/:uid/transactions/:id",
            delete(handlers::delete_transaction),
        )
        .route(
            "/api/users/:uid/budget",
            get(handlers::get_budget).put(handlers::save_budget),
        )
        .route("/api/users/:uid/budget/summary", get(handlers::budget_summary))
        .route(
            "/api/users/:uid/admin/users",
            get(handlers::admin_users).post(handlers::admin_create_user),
        )
        .route(
            "/api/users/:uid/admin/users/:target/habits",
            get(handlers::admin_user_habits),
        )
        .route(
            "/api/users/:uid/admin/users/:target/transactions",
            get(handlers::admin_user_transactions),
        )
        .route(
            "/api/users/:uid/admin/users/:target/budget",
            get(handlers::admin_user_budget),
        )
        .route(
            "/api/users/:uid/admin/referrals",
            get(handlers::admin_referrals).post(handlers::admin_create_referral),
        )
        .route(
            "/api/users/:uid/admin/announcement",
            put(handlers::admin_set_announcement),
        )
        .route("/api/announcement", get(handlers::get_announcement))
        .with_state(state)
}
