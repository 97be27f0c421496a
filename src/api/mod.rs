//! JSON/HTTP facade.
//!
//! Thin translation layer over the engine and SOAP clients: bearer-token
//! auth, body validation, a trace id per request, and one request-log entry
//! per exchange. AFIP-side problems travel inside the `{status, ...}`
//! envelope under HTTP 200; 4xx is reserved for caller errors.

pub mod handlers;
pub mod models;
pub mod routes;

use std::{convert::Infallible, sync::Arc, time::Instant};

use futures::Future;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use warp::{
	http::{HeaderMap, HeaderValue, StatusCode},
	hyper::{body::Bytes, Body},
	reply::Response,
	Filter,
};

use crate::{
	caea::CaeaEngine,
	observability::{new_trace_id, Observability, TRACE_ID},
	sntp::SntpClient,
	soap::{wsfe::WsfeClient, wspci::WspciClient},
	wsaa::TicketKeeper,
};

use models::{FieldError, Validate};

#[derive(Clone)]
pub struct ApiContext {
	pub obs: Observability,
	pub engine: Arc<CaeaEngine>,
	pub wsfe: Arc<WsfeClient>,
	pub wspci: Arc<WspciClient>,
	pub wsfe_tickets: Arc<TicketKeeper>,
	pub wspci_tickets: Arc<TicketKeeper>,
	pub sntp: Arc<SntpClient>,
	pub jwt_secret: Arc<String>,
}

/// Caller-side failures. AFIP-side failures never take this path; they ride
/// the envelope with HTTP 200.
#[derive(Debug)]
pub enum ApiError {
	Unauthorized,
	NotFound(String),
	Conflict(String),
	Validation(Vec<FieldError>),
	Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
	fn from(error: anyhow::Error) -> Self {
		ApiError::Internal(error)
	}
}

impl ApiError {
	fn status(&self) -> StatusCode {
		match self {
			ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
			ApiError::NotFound(_) => StatusCode::NOT_FOUND,
			ApiError::Conflict(_) => StatusCode::CONFLICT,
			ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn body(&self) -> Value {
		match self {
			ApiError::Unauthorized => json!({"detail": "Invalid JWT"}),
			ApiError::NotFound(detail) | ApiError::Conflict(detail) => {
				json!({"detail": detail})
			},
			ApiError::Validation(errors) => json!({"detail": errors}),
			ApiError::Internal(error) => {
				tracing::error!("Unhandled internal error: {error:#}");
				json!({"detail": "Internal server error"})
			},
		}
	}
}

pub(crate) struct RequestMeta {
	method: &'static str,
	path: &'static str,
	started: Instant,
}

impl RequestMeta {
	pub fn new(method: &'static str, path: &'static str) -> Self {
		Self { method, path, started: Instant::now() }
	}
}

fn authorize(ctx: &ApiContext, header: Option<&str>) -> Result<(), ApiError> {
	let token = header
		.and_then(|value| value.strip_prefix("Bearer "))
		.ok_or(ApiError::Unauthorized)?;
	if token != ctx.jwt_secret.as_str() {
		return Err(ApiError::Unauthorized);
	}
	Ok(())
}

fn parse_body<T: DeserializeOwned + Validate>(body: &Bytes) -> Result<T, ApiError> {
	let payload: T = serde_json::from_slice(body).map_err(|error| {
		ApiError::Validation(vec![FieldError::new("body", error.to_string())])
	})?;
	let errors = payload.validate();
	if !errors.is_empty() {
		return Err(ApiError::Validation(errors));
	}
	Ok(payload)
}

fn parse_query<T: DeserializeOwned>(raw: &str) -> Result<T, ApiError> {
	serde_urlencoded::from_str(raw).map_err(|error| {
		ApiError::Validation(vec![FieldError::new("query", error.to_string())])
	})
}

fn finish(
	ctx: &ApiContext,
	meta: &RequestMeta,
	trace_id: &str,
	request_payload: Option<&Value>,
	outcome: Result<Value, ApiError>,
) -> Response {
	let (status, payload) = match &outcome {
		Ok(value) => (StatusCode::OK, value.clone()),
		Err(error) => (error.status(), error.body()),
	};
	let duration_ms = meta.started.elapsed().as_secs_f64() * 1000.0;

	ctx.obs.record_http_exchange(
		meta.method,
		meta.path,
		status.as_u16(),
		duration_ms,
		trace_id,
		request_payload,
		Some(&payload),
	);

	let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
	let mut response = Response::new(Body::from(body));
	*response.status_mut() = status;
	response
		.headers_mut()
		.insert("content-type", HeaderValue::from_static("application/json"));
	if let Ok(value) = HeaderValue::from_str(trace_id) {
		response.headers_mut().insert("x-trace-id", value);
	}
	response
}

/// Authenticated JSON POST: parse, validate, run, record.
pub(crate) async fn handle_json<T, F, Fut>(
	ctx: ApiContext,
	meta: RequestMeta,
	auth_header: Option<String>,
	body: Bytes,
	handler: F,
) -> Response
where
	T: DeserializeOwned + Validate,
	F: FnOnce(ApiContext, T) -> Fut,
	Fut: Future<Output = Result<Value, ApiError>>,
{
	let trace_id = new_trace_id();
	let request_payload: Option<Value> = serde_json::from_slice(&body).ok();

	let outcome = TRACE_ID
		.scope(Some(trace_id.clone()), async {
			authorize(&ctx, auth_header.as_deref())?;
			let payload: T = parse_body(&body)?;
			handler(ctx.clone(), payload).await
		})
		.await;

	finish(&ctx, &meta, &trace_id, request_payload.as_ref(), outcome)
}

/// Authenticated request with query-string input (GETs and bodyless POSTs).
pub(crate) async fn handle_query<T, F, Fut>(
	ctx: ApiContext,
	meta: RequestMeta,
	auth_header: Option<String>,
	raw_query: String,
	handler: F,
) -> Response
where
	T: DeserializeOwned,
	F: FnOnce(ApiContext, T) -> Fut,
	Fut: Future<Output = Result<Value, ApiError>>,
{
	let trace_id = new_trace_id();
	let outcome = TRACE_ID
		.scope(Some(trace_id.clone()), async {
			authorize(&ctx, auth_header.as_deref())?;
			let query: T = parse_query(&raw_query)?;
			handler(ctx.clone(), query).await
		})
		.await;

	finish(&ctx, &meta, &trace_id, None, outcome)
}

/// Unauthenticated variant, used only by the health endpoints.
pub(crate) async fn handle_open<F, Fut>(ctx: ApiContext, meta: RequestMeta, handler: F) -> Response
where
	F: FnOnce(ApiContext) -> Fut,
	Fut: Future<Output = Result<Value, ApiError>>,
{
	let trace_id = new_trace_id();
	let outcome = TRACE_ID.scope(Some(trace_id.clone()), handler(ctx.clone())).await;
	finish(&ctx, &meta, &trace_id, None, outcome)
}

pub(crate) fn with_ctx(
	ctx: ApiContext,
) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
	warp::any().map(move || ctx.clone())
}

pub(crate) fn auth_header(
) -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
	warp::header::headers_cloned().map(|headers: HeaderMap| {
		headers
			.get("authorization")
			.and_then(|value| value.to_str().ok())
			.map(str::to_string)
	})
}

pub(crate) fn raw_query() -> impl Filter<Extract = (String,), Error = warp::Rejection> + Clone {
	warp::query::raw()
		.or_else(|_| async { Ok::<(String,), warp::Rejection>((String::new(),)) })
}

/// Serves the facade until `shutdown` resolves.
pub async fn serve(
	ctx: ApiContext,
	addr: std::net::SocketAddr,
	shutdown: impl Future<Output = ()> + Send + 'static,
) {
	let (bound, server) =
		warp::serve(routes::router(ctx)).bind_with_graceful_shutdown(addr, shutdown);
	tracing::info!("AFRelay API listening on {bound}");
	server.await;
}
