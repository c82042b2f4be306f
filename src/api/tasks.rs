use crate::api::context::{ApiResult, Body, Params, RequestContext};
use crate::api::{ApiState, LimitQuery, PageQuery};
use crate::reminder::Reminder;
use crate::task_manager::{
    CreateTaskRequest, ListTasksRequest, Task, TaskStatus, UpdateTaskRequest,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

const DEFAULT_UPCOMING_LIMIT: i64 = 10;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/tasks", post(create_task).get(search_tasks))
        .route("/tasks/upcoming", get(upcoming_tasks))
        .route("/tasks/overdue", get(overdue_tasks))
        .route("/tasks/status/{status}", get(tasks_by_status))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/tasks/{id}/fail", post(fail_task))
        .route("/tasks/{id}/reminders", get(task_reminders))
}

async fn create_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Body(request): Body<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state
        .tasks
        .create_task(&ctx.realm_id, &ctx.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn search_tasks(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(request): Params<ListTasksRequest>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.tasks.search_tasks(&ctx.realm_id, request).await?))
}

async fn upcoming_tasks(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(query): Params<LimitQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let limit = query.limit.unwrap_or(DEFAULT_UPCOMING_LIMIT);
    Ok(Json(state.tasks.upcoming_tasks(&ctx.realm_id, limit).await?))
}

async fn overdue_tasks(
    State(state): State<ApiState>,
    ctx: RequestContext,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.tasks.overdue_tasks(&ctx.realm_id).await?))
}

async fn tasks_by_status(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(status): Path<String>,
    Params(page): Params<PageQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = TaskStatus::from_db(&status.to_lowercase())?;
    Ok(Json(
        state
            .tasks
            .tasks_by_status(&ctx.realm_id, status, page.page, page.page_size)
            .await?,
    ))
}

async fn get_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.get_task(&ctx.realm_id, &id).await?))
}

async fn update_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Body(request): Body<UpdateTaskRequest>,
) -> ApiResult<Json<Task>> {
    Ok(Json(
        state
            .tasks
            .update_task(&ctx.realm_id, &id, &ctx.user_id, request)
            .await?,
    ))
}

async fn delete_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.tasks.delete_task(&ctx.realm_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(
        state.tasks.start_task(&ctx.realm_id, &id, &ctx.user_id).await?,
    ))
}

async fn complete_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(
        state
            .tasks
            .complete_task(&ctx.realm_id, &id, &ctx.user_id)
            .await?,
    ))
}

async fn fail_task(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(
        state.tasks.fail_task(&ctx.realm_id, &id, &ctx.user_id).await?,
    ))
}

async fn task_reminders(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Reminder>>> {
    Ok(Json(state.tasks.task_reminders(&ctx.realm_id, &id).await?))
}
