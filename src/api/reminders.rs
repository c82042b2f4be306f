use crate::api::context::{ApiResult, Body, Params, RequestContext};
use crate::api::{ApiState, LimitQuery, PageQuery};
use crate::reminder::{
    CreateReminderRequest, ListRemindersRequest, Reminder, ReminderStatus, SnoozeRequest,
    UpdateReminderRequest,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const DEFAULT_LIST_LIMIT: i64 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    page: Option<i64>,
    page_size: Option<i64>,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/reminders", post(create_reminder).get(search_reminders))
        .route("/reminders/upcoming", get(upcoming_reminders))
        .route("/reminders/overdue", get(overdue_reminders))
        .route("/reminders/range", get(reminders_in_range))
        .route("/reminders/status/{status}", get(reminders_by_status))
        .route(
            "/reminders/{id}",
            get(get_reminder).put(update_reminder).delete(delete_reminder),
        )
        .route("/reminders/{id}/complete", post(complete_reminder))
        .route("/reminders/{id}/snooze", post(snooze_reminder))
}

async fn create_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Body(request): Body<CreateReminderRequest>,
) -> ApiResult<(StatusCode, Json<Reminder>)> {
    let reminder = state
        .reminders
        .create_reminder(&ctx.realm_id, &ctx.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

async fn search_reminders(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(request): Params<ListRemindersRequest>,
) -> ApiResult<Json<Vec<Reminder>>> {
    Ok(Json(
        state
            .reminders
            .search_reminders(&ctx.realm_id, request)
            .await?,
    ))
}

async fn upcoming_reminders(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(query): Params<LimitQuery>,
) -> ApiResult<Json<Vec<Reminder>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(
        state
            .reminders
            .upcoming_reminders(&ctx.realm_id, limit)
            .await?,
    ))
}

async fn overdue_reminders(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(query): Params<LimitQuery>,
) -> ApiResult<Json<Vec<Reminder>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(
        state
            .reminders
            .overdue_reminders(&ctx.realm_id, limit)
            .await?,
    ))
}

async fn reminders_in_range(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(query): Params<RangeQuery>,
) -> ApiResult<Json<Vec<Reminder>>> {
    Ok(Json(
        state
            .reminders
            .reminders_in_range(&ctx.realm_id, query.start, query.end, query.page, query.page_size)
            .await?,
    ))
}

async fn reminders_by_status(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(status): Path<String>,
    Params(page): Params<PageQuery>,
) -> ApiResult<Json<Vec<Reminder>>> {
    let status = ReminderStatus::from_db(&status.to_lowercase())?;
    Ok(Json(
        state
            .reminders
            .reminders_by_status(&ctx.realm_id, status, page.page, page.page_size)
            .await?,
    ))
}

async fn get_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Reminder>> {
    Ok(Json(state.reminders.get_reminder(&ctx.realm_id, &id).await?))
}

async fn update_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Body(request): Body<UpdateReminderRequest>,
) -> ApiResult<Json<Reminder>> {
    Ok(Json(
        state
            .reminders
            .update_reminder(&ctx.realm_id, &id, &ctx.user_id, request)
            .await?,
    ))
}

async fn delete_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.reminders.delete_reminder(&ctx.realm_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Reminder>> {
    Ok(Json(
        state
            .dispatcher
            .complete(&ctx.realm_id, &id, &ctx.user_id)
            .await?,
    ))
}

async fn snooze_reminder(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Body(request): Body<SnoozeRequest>,
) -> ApiResult<Json<Reminder>> {
    Ok(Json(
        state
            .dispatcher
            .snooze(&ctx.realm_id, &id, &ctx.user_id, request.remind_time)
            .await?,
    ))
}
