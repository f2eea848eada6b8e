//! Match creation, tag decoding and match key verification

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use skymark_common::api::{
    DecodeQuery, DecodeResponse, NewMatchRequest, NewMatchResponse, VerifyQuery, VerifyResponse,
    DECODE_PATH, NEW_MATCH_PATH, VERIFY_MATCH_KEY_PATH,
};
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

const MISSING_NEW_MATCH_FIELDS: &str = "Missing match_key or tag_ids";
const MISSING_DECODE_PARAMS: &str = "Missing tag_id or match_key";
const MISSING_MATCH_KEY: &str = "Missing match_key";

/// Treat absent and empty values the same way; keys are matched verbatim
fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// POST /new_match
///
/// The body is parsed by hand so that malformed or incomplete JSON gets the
/// same 400 answer as missing fields.
pub async fn new_match(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<NewMatchResponse>)> {
    let request: NewMatchRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest(MISSING_NEW_MATCH_FIELDS.to_string()))?;

    let match_key = required(request.match_key)
        .ok_or_else(|| ApiError::BadRequest(MISSING_NEW_MATCH_FIELDS.to_string()))?;
    let tag_ids: Vec<String> = request
        .tag_ids
        .unwrap_or_default()
        .into_iter()
        .filter_map(|id| required(Some(id)))
        .collect();
    if tag_ids.is_empty() {
        return Err(ApiError::BadRequest(MISSING_NEW_MATCH_FIELDS.to_string()));
    }

    // ThreadRng is not Send; keep it out of any await
    let table = {
        let mut rng = rand::thread_rng();
        state.policy.generate(&tag_ids, &mut rng)
    };

    let table = state.store.create(&match_key, table).await?;
    info!("New match {} with {} tags", match_key, table.len());

    Ok((
        StatusCode::OK,
        Json(NewMatchResponse {
            match_key,
            mapping: table.to_mapping(),
            tag_count: table.len(),
        }),
    ))
}

/// GET /decode?tag_id=..&match_key=..
pub async fn decode(
    State(state): State<AppState>,
    Query(query): Query<DecodeQuery>,
) -> ApiResult<Json<DecodeResponse>> {
    let (tag_id, match_key) = match (required(query.tag_id), required(query.match_key)) {
        (Some(tag_id), Some(match_key)) => (tag_id, match_key),
        _ => return Err(ApiError::BadRequest(MISSING_DECODE_PARAMS.to_string())),
    };

    let points = state.store.decode(&match_key, &tag_id).await?;
    debug!(match_key = %match_key, tag_id = %tag_id, points, "Decoded tag");

    Ok(Json(DecodeResponse { tag_id, points }))
}

/// GET /verify_match_key?match_key=..
///
/// 200 `{valid: true}` for a registered key, 404 `{valid: false}` otherwise.
pub async fn verify_match_key(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<(StatusCode, Json<VerifyResponse>)> {
    let match_key = required(query.match_key)
        .ok_or_else(|| ApiError::BadRequest(MISSING_MATCH_KEY.to_string()))?;

    if state.store.contains(&match_key).await {
        Ok((StatusCode::OK, Json(VerifyResponse { valid: true })))
    } else {
        debug!(match_key = %match_key, "Verification of unknown match key");
        Ok((StatusCode::NOT_FOUND, Json(VerifyResponse { valid: false })))
    }
}

/// Build match routes
pub fn match_routes() -> Router<AppState> {
    Router::new()
        .route(NEW_MATCH_PATH, post(new_match))
        .route(DECODE_PATH, get(decode))
        .route(VERIFY_MATCH_KEY_PATH, get(verify_match_key))
}
