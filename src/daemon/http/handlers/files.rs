//! File and directory handlers.
//!
//! Every path not claimed by a named route lands here and is dispatched
//! on the request method.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use percent_encoding::percent_decode_str;

use super::super::audit::{AuditEvent, audit_path_error, log_audit_event};
use super::super::types::{
    LockAcquiredResponse, LockMessageResponse, LockStatusResponse, MkdirResponse, PathQuery,
    WriteResponse,
};
use super::super::{AppError, AppState, SharedState, authenticate};
use crate::daemon::engine::{LockAction, LockOutcome, ReadOutcome};
use crate::daemon::services::conditional::{ConditionalHeaders, Preconditions};
use crate::daemon::services::directories::{DirectoryAttributes, ListOptions};
use crate::daemon::services::files::FileRecord;
use crate::daemon::services::path::validate_path;
use crate::daemon::services::sessions::Session;
use crate::utils::format_http_date;

const FILE_CACHE_CONTROL: &str = "private, max-age=0, must-revalidate";
const LISTING_CACHE_CONTROL: &str = "no-cache";

/// HEAD|GET|POST|PUT|DELETE /{path} - File and directory operations.
pub(crate) async fn path_request(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let path = decode_path(&uri)?;
    let session = authenticate(&state, &headers).await?;

    let result = match method {
        Method::HEAD => head(&state, &session, &path).await,
        Method::GET => get(&state, &session, &path, &headers, &query).await,
        Method::POST => mkdir(&state, &session, &path, &body).await,
        Method::PUT => put(&state, &session, &path, &headers, body).await,
        Method::DELETE => remove(&state, &session, &path, &headers).await,
        _ => return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    };
    if let Err(AppError(err)) = &result {
        audit_path_error(err, &path, &session.owner);
    }
    result
}

/// Percent-decode and validate the request path.
fn decode_path(uri: &Uri) -> Result<String, AppError> {
    let path = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| AppError::bad_request("Path is not valid UTF-8"))?
        .into_owned();
    if let Err(err) = validate_path(&path) {
        log_audit_event(AuditEvent::PathRejected {
            path: path.clone(),
            reason: err.to_string(),
        });
        return Err(err.into());
    }
    Ok(path)
}

fn preconditions(headers: &HeaderMap) -> Result<Preconditions, AppError> {
    let value = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    let conditional = ConditionalHeaders {
        if_match: value(header::IF_MATCH),
        if_none_match: value(header::IF_NONE_MATCH),
        if_modified_since: value(header::IF_MODIFIED_SINCE),
        if_unmodified_since: value(header::IF_UNMODIFIED_SINCE),
    };
    Ok(Preconditions::parse(&conditional)?)
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Validator and caching headers shared by HEAD, GET, 304 and PUT.
fn file_headers(record: &FileRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, header_value(&record.etag()));
    headers.insert(
        header::LAST_MODIFIED,
        header_value(&format_http_date(record.timestamp)),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(FILE_CACHE_CONTROL),
    );
    headers
}

fn content_headers(record: &FileRecord) -> HeaderMap {
    let mut headers = file_headers(record);
    headers.insert(header::CONTENT_TYPE, header_value(&record.content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.content_length));
    headers
}

async fn head(state: &AppState, session: &Session, path: &str) -> Result<Response, AppError> {
    let record = state.engine.head(session, path).await?;
    Ok((content_headers(&record), Body::empty()).into_response())
}

async fn get(
    state: &AppState,
    session: &Session,
    path: &str,
    headers: &HeaderMap,
    query: &PathQuery,
) -> Result<Response, AppError> {
    if let Some(action) = &query.lock {
        return lock(state, session, path, action).await;
    }

    let preconditions = preconditions(headers)?;
    let options = list_options(state, query);
    match state.engine.read(session, path, &preconditions, &options).await? {
        ReadOutcome::Listing(listing) => Ok((
            [(header::CACHE_CONTROL, LISTING_CACHE_CONTROL)],
            Json(listing),
        )
            .into_response()),
        ReadOutcome::NotModified(record) => {
            Ok((StatusCode::NOT_MODIFIED, file_headers(&record)).into_response())
        },
        ReadOutcome::File { content, record } => {
            Ok((content_headers(&record), content).into_response())
        },
    }
}

fn list_options(state: &AppState, query: &PathQuery) -> ListOptions {
    let limit = query
        .limit
        .unwrap_or(state.listing.default_limit)
        .clamp(1, state.listing.max_limit.max(1));
    ListOptions {
        limit,
        cursor: query.cursor.clone().filter(|c| !c.is_empty()),
        reverse: query.reverse.unwrap_or(false),
        shallow: query.shallow.unwrap_or(true),
    }
}

async fn lock(state: &AppState, session: &Session, path: &str, action: &str) -> Result<Response, AppError> {
    let Some(action) = LockAction::parse(action) else {
        return Err(AppError::bad_request(
            "lock must be one of acquire, release, refresh, status",
        ));
    };
    let response = match state.engine.lock(session, path, action).await? {
        LockOutcome::Acquired(lock) => Json(LockAcquiredResponse {
            message: "Lock acquired",
            path: lock.path,
            session_id: lock.locked_by,
            expires_at: lock.expires_at,
        })
        .into_response(),
        LockOutcome::Released => Json(LockMessageResponse {
            message: "Lock released",
            path: path.to_string(),
        })
        .into_response(),
        LockOutcome::Refreshed => Json(LockMessageResponse {
            message: "Lock refreshed",
            path: path.to_string(),
        })
        .into_response(),
        LockOutcome::Status {
            state,
            owned_by_caller,
        } => Json(LockStatusResponse {
            locked: state.locked,
            lock: state.lock,
            owned_by_this_session: owned_by_caller,
        })
        .into_response(),
    };
    Ok(response)
}

async fn mkdir(state: &AppState, session: &Session, path: &str, body: &Bytes) -> Result<Response, AppError> {
    let attrs: DirectoryAttributes = if body.is_empty() {
        DirectoryAttributes::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| AppError::bad_request(format!("Invalid directory attributes: {e}")))?
    };
    let record = state.engine.mkdir(session, path, attrs).await?;
    Ok((
        StatusCode::CREATED,
        Json(MkdirResponse {
            path: record.path,
            owner: record.owner,
            created: record.created,
        }),
    )
        .into_response())
}

async fn put(
    state: &AppState,
    session: &Session,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let preconditions = preconditions(headers)?;
    let outcome = state.engine.write(session, path, body, &preconditions).await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response_headers = file_headers(&outcome.record);
    response_headers.remove(header::CACHE_CONTROL);
    response_headers.insert(header::LOCATION, header_value(path));
    Ok((
        status,
        response_headers,
        Json(WriteResponse::new(&outcome.record, outcome.created)),
    )
        .into_response())
}

async fn remove(state: &AppState, session: &Session, path: &str, headers: &HeaderMap) -> Result<Response, AppError> {
    let preconditions = preconditions(headers)?;
    state.engine.delete(session, path, &preconditions).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
