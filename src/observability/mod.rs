//! In-memory observability: request logs, domain events, token state.
//!
//! One [`Observability`] value is built at startup and threaded through every
//! component; recording is best-effort and never fails the caller.

pub mod models;
pub mod store;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use serde_json::Value;

use crate::settings::Settings;
use models::{DomainEventEntry, RequestLogEntry, TokenStatus};
use store::ObservabilityStore;

tokio::task_local! {
	/// Trace id of the HTTP request currently being served, if any.
	pub static TRACE_ID: Option<String>;
}

pub fn new_trace_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

pub fn current_trace_id() -> Option<String> {
	TRACE_ID.try_with(|id| id.clone()).ok().flatten()
}

pub fn infer_service(path: &str) -> &'static str {
	if path.starts_with("/wsfe") {
		"wsfe"
	} else if path.starts_with("/wsaa") {
		"wsaa"
	} else if path.starts_with("/wspci") {
		"wspci"
	} else if path.starts_with("/ui") {
		"ui"
	} else if path.starts_with("/health") {
		"health"
	} else {
		"other"
	}
}

fn extract_cuit(payload: Option<&Value>) -> Option<i64> {
	let payload = payload?;
	if let Some(cuit) = payload.get("Cuit").and_then(Value::as_i64) {
		return Some(cuit);
	}
	payload.get("Auth").and_then(|auth| auth.get("Cuit")).and_then(Value::as_i64)
}

#[derive(Clone)]
pub struct Observability {
	store: Arc<ObservabilityStore>,
	/// `(service, login ticket response file)` pairs inspected for token
	/// state.
	token_files: Arc<Vec<(String, PathBuf)>>,
}

impl Observability {
	pub fn new(settings: &Settings) -> Self {
		let xml_dir = &settings.wsaa.xml_dir;
		Self {
			store: Arc::new(ObservabilityStore::new(
				settings.observability.max_logs,
				settings.observability.max_events,
			)),
			token_files: Arc::new(vec![
				("wsaa".to_string(), xml_dir.join("loginTicketResponse.xml")),
				("wspci".to_string(), xml_dir.join("wspci_loginTicketResponse.xml")),
			]),
		}
	}

	pub fn store(&self) -> &ObservabilityStore {
		&self.store
	}

	pub fn emit_domain_event(
		&self,
		event_type: &str,
		service: &str,
		status: &str,
		entity_key: Option<&str>,
		payload: Option<Value>,
		error_type: Option<&str>,
	) {
		self.store.add_domain_event(DomainEventEntry {
			timestamp: Utc::now(),
			trace_id: current_trace_id(),
			service: service.to_string(),
			event_type: event_type.to_string(),
			status: status.to_string(),
			entity_key: entity_key.map(str::to_string),
			error_type: error_type.map(str::to_string),
			payload,
		});
	}

	/// Appends one request-log entry and mirrors notable endpoints as domain
	/// events. A `status = "error"` envelope counts as a failed exchange even
	/// under HTTP 200.
	#[allow(clippy::too_many_arguments)]
	pub fn record_http_exchange(
		&self,
		method: &str,
		path: &str,
		status_code: u16,
		duration_ms: f64,
		trace_id: &str,
		request_payload: Option<&Value>,
		response_payload: Option<&Value>,
	) {
		let mut ok = status_code < 400;
		let mut error_type = None;
		if let Some(response) = response_payload {
			if response.get("status").and_then(Value::as_str) == Some("error") {
				ok = false;
				error_type = response
					.get("error")
					.and_then(|error| error.get("error_type"))
					.and_then(Value::as_str)
					.map(str::to_string);
			}
		}
		if !ok && error_type.is_none() {
			error_type = Some(format!("HTTP_{status_code}"));
		}

		let service = infer_service(path);
		self.store.add_request_log(RequestLogEntry {
			timestamp: Utc::now(),
			trace_id: trace_id.to_string(),
			method: method.to_string(),
			path: path.to_string(),
			status_code,
			ok,
			duration_ms,
			service: service.to_string(),
			error_type: error_type.clone(),
			cuit: extract_cuit(request_payload),
		});

		let status = if ok { "success" } else { "error" };
		if path.starts_with("/wsfe/caea") {
			self.emit_domain_event(
				"wsfe_caea_http_call",
				"wsfe",
				status,
				Some(path),
				None,
				error_type.as_deref(),
			);
		} else if path == "/wsfe/invoices" {
			self.emit_domain_event(
				"wsfe_fecae_http_call",
				"wsfe",
				status,
				Some("fecae"),
				None,
				error_type.as_deref(),
			);
		} else if path == "/wsaa/token" || path == "/wspci/token" {
			self.refresh_token_state_from_files();
			self.emit_domain_event(
				"token_renew_http_call",
				service,
				status,
				Some(path),
				None,
				error_type.as_deref(),
			);
		}
	}

	/// Re-reads the ticket files and refreshes the token-status map.
	pub fn refresh_token_state_from_files(&self) -> HashMap<String, TokenStatus> {
		let mut statuses = HashMap::new();
		for (service, path) in self.token_files.iter() {
			let status = parse_token_file(path);
			self.store.update_token_status(service, status.clone());
			statuses.insert(service.clone(), status);
		}
		statuses
	}
}

fn parse_token_file(path: &PathBuf) -> TokenStatus {
	let now = Utc::now();
	let missing = |error: &str| TokenStatus {
		valid: false,
		expires_at: None,
		last_error: Some(error.to_string()),
		checked_at: now,
	};

	let Ok(contents) = std::fs::read_to_string(path) else {
		return missing("token_file_not_found");
	};
	match crate::wsaa::ticket::read_expiration(&contents) {
		Ok(expires_at) => TokenStatus {
			valid: now < expires_at,
			expires_at: Some(expires_at),
			last_error: None,
			checked_at: now,
		},
		Err(error) => missing(&format!("{error:#}")),
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn new_test_observability() -> Observability {
		Observability {
			store: Arc::new(ObservabilityStore::new(1000, 1000)),
			token_files: Arc::new(Vec::new()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use store::EventQuery;

	#[test]
	fn envelope_error_marks_exchange_failed() {
		let obs = test_utils::new_test_observability();
		obs.record_http_exchange(
			"POST",
			"/wsfe/invoices",
			200,
			12.5,
			"trace-1",
			Some(&json!({"Auth": {"Cuit": 30740253022i64}})),
			Some(&json!({
				"status": "error",
				"error": {"error_type": "SOAPFault", "detail": "boom", "method": "FECAESolicitar"}
			})),
		);

		let page = obs
			.store()
			.list_logs(&store::LogQuery { page: 1, page_size: 10, ..Default::default() });
		let entry = &page.items[0];
		assert!(!entry.ok);
		assert_eq!(entry.error_type.as_deref(), Some("SOAPFault"));
		assert_eq!(entry.cuit, Some(30740253022));

		let events = obs.store().list_domain_events(&EventQuery {
			page: 1,
			page_size: 10,
			event_type: Some("wsfe_fecae_http_call".to_string()),
			..Default::default()
		});
		assert_eq!(events.total, 1);
		assert_eq!(events.items[0].status, "error");
	}

	#[test]
	fn plain_http_failure_gets_status_code_error_type() {
		let obs = test_utils::new_test_observability();
		obs.record_http_exchange("POST", "/wsfe/caea/queue/retry", 500, 3.0, "t", None, None);

		let page = obs
			.store()
			.list_logs(&store::LogQuery { page: 1, page_size: 10, ..Default::default() });
		assert_eq!(page.items[0].error_type.as_deref(), Some("HTTP_500"));
	}
}
