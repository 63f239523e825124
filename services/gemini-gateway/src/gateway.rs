//! Operation request handling
//!
//! Parses the operation and request body, dispatches one `generateContent`
//! call per attempt through the shared credential pool, and shapes the
//! result (or failure) into the HTTP response.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use dispatcher::{Completed, DispatchOptions, Dispatcher, RetryPolicy};
use futures_util::StreamExt;
use key_pool::OperationClass;
use provider::GeminiClassifier;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::Selection;
use crate::error::{Error, Result};
use crate::metrics;
use crate::upstream::GeminiCaller;

/// Counters surfaced on `/health`.
#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub retries_total: Arc<AtomicU64>,
    /// Requests currently being processed; observed while draining.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            retries_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds on a single batch request.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// Items dispatched at once.
    pub concurrency: usize,
    pub max_items: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_items: 100,
        }
    }
}

/// Decrements `in_flight` when the request finishes, however it finishes.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a request needs to dispatch work.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub caller: GeminiCaller,
    pub policy: RetryPolicy,
    pub selection: Selection,
    /// Root token; each dispatch observes a child of it.
    pub shutdown: CancellationToken,
    /// Set when a shutdown signal arrives, ahead of the drain.
    pub draining: Arc<AtomicBool>,
    pub batch: BatchLimits,
    pub stats: GatewayStats,
}

impl GatewayState {
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed) || self.shutdown.is_cancelled()
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    requests: Vec<Value>,
}

/// JSON error response: {"error":{"type":"...","message":"...","attempts":N,"request_id":"req_..."}}
pub fn error_response(err: &Error, request_id: &str) -> Response {
    let body = json!({
        "error": {
            "type": err.error_type(),
            "message": err.to_string(),
            "attempts": err.attempts(),
            "request_id": request_id,
        }
    });
    (
        err.status(),
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn parse_operation(name: &str) -> Result<OperationClass> {
    name.parse::<OperationClass>()
        .map_err(|_| Error::UnknownOperation(name.to_string()))
}

fn parse_object(body: &[u8]) -> Result<Value> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| Error::InvalidBody(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::InvalidBody("expected a JSON object".into()));
    }
    Ok(value)
}

/// Dispatch one `generateContent` call for `operation`.
pub async fn run_operation(
    state: &GatewayState,
    operation: OperationClass,
    body: &Value,
) -> Result<Completed<Value>> {
    let retries = state.stats.retries_total.clone();
    let options = DispatchOptions::new(
        state.selection.for_operation(operation),
        state.policy.clone(),
    )
    .with_operation(operation)
    .with_cancel(state.shutdown.child_token())
    .with_on_retry(move |event| {
        retries.fetch_add(1, Ordering::Relaxed);
        debug!(
            attempt = event.attempt,
            credential_index = event.credential_index,
            classification = event.classification.label(),
            "retry scheduled"
        );
    });

    let caller = &state.caller;
    state
        .dispatcher
        .dispatch(&options, &GeminiClassifier, |credential| async move {
            caller.call(operation, &credential, body).await
        })
        .await
        .map_err(Error::from)
}

fn finish(state: &GatewayState, operation: &str, status: StatusCode) {
    if !status.is_success() {
        state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    let label = operation
        .parse::<OperationClass>()
        .map(|op| op.as_str())
        .unwrap_or("unknown");
    metrics::record_request(status.as_u16(), label);
}

/// `POST /v1/operations/{operation}`
#[instrument(skip_all, fields(request_id = %request_id, operation = %operation))]
pub async fn handle_operation(
    state: &GatewayState,
    operation: &str,
    body: &[u8],
    request_id: String,
) -> Response {
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.stats.in_flight);

    let result: Result<Completed<Value>> = async {
        let op = parse_operation(operation)?;
        let body = parse_object(body)?;
        run_operation(state, op, &body).await
    }
    .await;

    match result {
        Ok(completed) => {
            info!(
                attempts = completed.attempts,
                credential_index = completed.credential_index,
                "operation completed"
            );
            finish(state, operation, StatusCode::OK);
            let mut response = (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                completed.value.to_string(),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert("x-dispatch-attempts", HeaderValue::from(completed.attempts));
            headers.insert(
                "x-credential-index",
                HeaderValue::from(completed.credential_index),
            );
            response
        }
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                error!(status = status.as_u16(), error = %err, "operation failed");
            } else {
                info!(status = status.as_u16(), error = %err, "operation rejected");
            }
            finish(state, operation, status);
            error_response(&err, &request_id)
        }
    }
}

/// `POST /v1/operations/{operation}/batch`
///
/// Items are dispatched at most `batch.concurrency` at a time and reported
/// individually, in request order; one failing item never fails the batch.
#[instrument(skip_all, fields(request_id = %request_id, operation = %operation))]
pub async fn handle_batch(
    state: &GatewayState,
    operation: &str,
    body: &[u8],
    request_id: String,
) -> Response {
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.stats.in_flight);

    let parsed = parse_operation(operation).and_then(|op| {
        let batch: BatchRequest =
            serde_json::from_slice(body).map_err(|e| Error::InvalidBody(e.to_string()))?;
        if batch.requests.len() > state.batch.max_items {
            return Err(Error::InvalidBody(format!(
                "batch has {} requests, limit is {}",
                batch.requests.len(),
                state.batch.max_items
            )));
        }
        Ok((op, batch))
    });
    let (op, batch) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            finish(state, operation, err.status());
            return error_response(&err, &request_id);
        }
    };

    let items: Vec<_> = batch
        .requests
        .iter()
        .map(|item| async move {
            if !item.is_object() {
                return Err(Error::InvalidBody("expected a JSON object".into()));
            }
            run_operation(state, op, item).await
        })
        .collect();
    let outcomes: Vec<Result<Completed<Value>>> = futures_util::stream::iter(items)
        .buffered(state.batch.concurrency.max(1))
        .collect()
        .await;

    let mut succeeded = 0usize;
    let results: Vec<Value> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(completed) => {
                succeeded += 1;
                json!({
                    "ok": true,
                    "attempts": completed.attempts,
                    "credential_index": completed.credential_index,
                    "response": completed.value,
                })
            }
            Err(err) => json!({
                "ok": false,
                "status": err.status().as_u16(),
                "error": {
                    "type": err.error_type(),
                    "message": err.to_string(),
                    "attempts": err.attempts(),
                },
            }),
        })
        .collect();

    info!(
        items = results.len(),
        succeeded,
        failed = results.len() - succeeded,
        "batch completed"
    );
    finish(state, operation, StatusCode::OK);
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        json!({ "request_id": request_id, "results": results }).to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::{Failure, FailureKind};

    #[test]
    fn operation_names_parse() {
        assert_eq!(
            parse_operation("solve_question").unwrap(),
            OperationClass::SolveQuestion
        );
        assert!(matches!(
            parse_operation("summarize_pdf"),
            Err(Error::UnknownOperation(ref s)) if s == "summarize_pdf"
        ));
    }

    #[test]
    fn body_must_be_json_object() {
        assert!(parse_object(br#"{"contents":[]}"#).is_ok());
        assert!(matches!(parse_object(b"[1,2]"), Err(Error::InvalidBody(_))));
        assert!(matches!(parse_object(b"{oops"), Err(Error::InvalidBody(_))));
    }

    #[test]
    fn default_batch_limits_are_bounded() {
        let limits = BatchLimits::default();
        assert_eq!(limits.concurrency, 8);
        assert_eq!(limits.max_items, 100);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let _a = InFlight::enter(&counter);
            let _b = InFlight::enter(&counter);
            assert_eq!(counter.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn error_response_format() {
        let err = Error::Dispatch(Failure {
            kind: FailureKind::AllCredentialsExhausted { tried: 2 },
            attempts: 2,
            last_error: None,
        });
        let resp = error_response(&err, "req_abc123");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "all_credentials_exhausted");
        assert_eq!(json["error"]["attempts"], 2);
        assert_eq!(json["error"]["request_id"], "req_abc123");
        assert_eq!(
            json["error"]["message"],
            "all 2 credential(s) rate limited after 2 attempt(s)"
        );
    }
}
