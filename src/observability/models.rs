use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One HTTP exchange through the facade.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
	pub timestamp: DateTime<Utc>,
	pub trace_id: String,
	pub method: String,
	pub path: String,
	pub status_code: u16,
	pub ok: bool,
	pub duration_ms: f64,
	pub service: String,
	pub error_type: Option<String>,
	pub cuit: Option<i64>,
}

/// One notable domain action (SOAP call, outbox transition, token renewal).
#[derive(Debug, Clone, Serialize)]
pub struct DomainEventEntry {
	pub timestamp: DateTime<Utc>,
	pub trace_id: Option<String>,
	pub service: String,
	pub event_type: String,
	pub status: String,
	pub entity_key: Option<String>,
	pub error_type: Option<String>,
	pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
	pub valid: bool,
	pub expires_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub checked_at: DateTime<Utc>,
}
