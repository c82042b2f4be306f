use crate::api::context::{ApiResult, Body, OptionalBody, Params, RequestContext};
use crate::api::ApiState;
use crate::vault::{
    AddVersionRequest, CreateSecretRequest, DecryptRequest, ListSecretsRequest, Secret,
    SecretVersion, UpdateSecretRequest,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/secrets", post(create_secret).get(search_secrets))
        .route(
            "/secrets/{id}",
            get(get_secret).put(update_secret).delete(delete_secret),
        )
        .route("/secrets/{id}/decrypt", post(decrypt_current))
        .route(
            "/secrets/{id}/versions",
            get(list_versions).post(add_version),
        )
        .route(
            "/secrets/{id}/versions/{version}",
            axum::routing::delete(delete_version),
        )
        .route(
            "/secrets/{id}/versions/{version}/activate",
            post(activate_version),
        )
        .route(
            "/secrets/{id}/versions/{version}/decrypt",
            post(decrypt_version),
        )
}

async fn create_secret(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Body(request): Body<CreateSecretRequest>,
) -> ApiResult<(StatusCode, Json<Secret>)> {
    ctx.require_secret_access()?;
    let secret = state
        .vault
        .create_secret(&ctx.realm_id, &ctx.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(secret)))
}

async fn search_secrets(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Params(request): Params<ListSecretsRequest>,
) -> ApiResult<Json<Vec<Secret>>> {
    ctx.require_secret_access()?;
    Ok(Json(state.vault.search_secrets(&ctx.realm_id, request).await?))
}

async fn get_secret(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Secret>> {
    ctx.require_secret_access()?;
    Ok(Json(state.vault.get_secret(&ctx.realm_id, &id).await?))
}

async fn update_secret(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Body(request): Body<UpdateSecretRequest>,
) -> ApiResult<Json<Secret>> {
    ctx.require_secret_access()?;
    Ok(Json(
        state
            .vault
            .update_secret(&ctx.realm_id, &id, &ctx.user_id, request)
            .await?,
    ))
}

async fn delete_secret(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    ctx.require_secret_access()?;
    state.vault.delete_secret(&ctx.realm_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decrypt_current(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    OptionalBody(request): OptionalBody<DecryptRequest>,
) -> ApiResult<Json<Value>> {
    ctx.require_secret_access()?;
    decrypt(&state, &ctx, &id, None, request).await
}

async fn decrypt_version(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((id, version)): Path<(String, i64)>,
    OptionalBody(request): OptionalBody<DecryptRequest>,
) -> ApiResult<Json<Value>> {
    ctx.require_secret_access()?;
    decrypt(&state, &ctx, &id, Some(version), request).await
}

async fn decrypt(
    state: &ApiState,
    ctx: &RequestContext,
    id: &str,
    version: Option<i64>,
    request: DecryptRequest,
) -> ApiResult<Json<Value>> {
    let value = state
        .vault
        .decrypt(&ctx.realm_id, id, version, request.custom_kek.as_deref())
        .await?;
    log::info!(
        "Secret '{}' decrypted by '{}' in realm '{}'",
        id,
        ctx.user_id,
        ctx.realm_id
    );
    Ok(Json(json!({ "value": value.as_str() })))
}

async fn list_versions(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SecretVersion>>> {
    ctx.require_secret_access()?;
    Ok(Json(state.vault.list_versions(&ctx.realm_id, &id).await?))
}

async fn add_version(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Body(request): Body<AddVersionRequest>,
) -> ApiResult<(StatusCode, Json<SecretVersion>)> {
    ctx.require_secret_access()?;
    let version = state
        .vault
        .add_pending_version(
            &ctx.realm_id,
            &id,
            &ctx.user_id,
            &request.value,
            request.custom_kek.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn activate_version(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((id, version)): Path<(String, i64)>,
) -> ApiResult<Json<Secret>> {
    ctx.require_secret_access()?;
    Ok(Json(
        state
            .vault
            .activate_version(&ctx.realm_id, &id, version, &ctx.user_id)
            .await?,
    ))
}

async fn delete_version(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((id, version)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    ctx.require_secret_access()?;
    state
        .vault
        .delete_version(&ctx.realm_id, &id, version)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
