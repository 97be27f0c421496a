use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use super::models::{DomainEventEntry, RequestLogEntry, TokenStatus};

/// Endpoints broken out individually in the operations summary.
const TRACKED_OPERATIONS: &[(&str, &str)] = &[
	("fecae", "/wsfe/invoices"),
	("last_authorized", "/wsfe/invoices/last-authorized"),
	("invoice_query", "/wsfe/invoices/query"),
	("caea_solicitar", "/wsfe/caea/solicitar"),
	("caea_consultar", "/wsfe/caea/consultar"),
	("caea_informar", "/wsfe/caea/informar"),
	("caea_sin_movimiento_consultar", "/wsfe/caea/sin-movimiento/consultar"),
	("caea_sin_movimiento_informar", "/wsfe/caea/sin-movimiento/informar"),
	("persona", "/wspci/persona"),
];

const SERVICES: &[&str] = &["wsfe", "wsaa", "wspci", "ui", "health", "other"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorGroupBy {
	ErrorType,
	Endpoint,
}

impl ErrorGroupBy {
	fn as_str(&self) -> &'static str {
		match self {
			ErrorGroupBy::ErrorType => "error_type",
			ErrorGroupBy::Endpoint => "endpoint",
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
	pub page: usize,
	pub page_size: usize,
	pub endpoint: Option<String>,
	pub status: Option<String>,
	pub service: Option<String>,
	pub error_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
	pub page: usize,
	pub page_size: usize,
	pub service: Option<String>,
	pub event_type: Option<String>,
	pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
	pub page: usize,
	pub page_size: usize,
	pub total: usize,
	pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct ServiceSummary {
	pub requests: usize,
	pub errors: usize,
	pub error_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct Summary {
	pub window_minutes: i64,
	pub total_requests: usize,
	pub error_count: usize,
	pub error_rate: f64,
	pub p95_ms: f64,
	pub avg_ms: f64,
	pub services: HashMap<String, ServiceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorGroup {
	pub key: String,
	pub count: usize,
	pub last_seen: DateTime<Utc>,
	pub sample: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorsView {
	pub window_minutes: i64,
	pub group_by: &'static str,
	pub items: Vec<ErrorGroup>,
}

#[derive(Debug, Serialize)]
pub struct Alert {
	pub rule_id: String,
	pub severity: &'static str,
	pub title: String,
	pub detail: Value,
}

#[derive(Debug, Serialize)]
pub struct AlertsView {
	pub active: Vec<Alert>,
	pub count: usize,
}

struct Inner {
	request_logs: VecDeque<RequestLogEntry>,
	domain_events: VecDeque<DomainEventEntry>,
	token_status: HashMap<String, TokenStatus>,
}

/// Bounded in-memory record of recent HTTP exchanges and domain events, plus
/// the last observed token state. One mutex covers every mutation and read.
pub struct ObservabilityStore {
	max_logs: usize,
	max_events: usize,
	inner: Mutex<Inner>,
}

fn round3(value: f64) -> f64 {
	(value * 1000.0).round() / 1000.0
}

fn round4(value: f64) -> f64 {
	(value * 10000.0).round() / 10000.0
}

/// Nearest-rank percentile over unordered samples.
fn percentile(values: &[f64], p: f64) -> f64 {
	if values.is_empty() {
		return 0.0;
	}
	let mut ordered = values.to_vec();
	ordered.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));
	let rank = ((p * ordered.len() as f64).ceil() as usize).clamp(1, ordered.len());
	ordered[rank - 1]
}

impl ObservabilityStore {
	pub fn new(max_logs: usize, max_events: usize) -> Self {
		Self {
			max_logs,
			max_events,
			inner: Mutex::new(Inner {
				request_logs: VecDeque::with_capacity(max_logs),
				domain_events: VecDeque::with_capacity(max_events),
				token_status: HashMap::new(),
			}),
		}
	}

	pub fn add_request_log(&self, entry: RequestLogEntry) {
		let mut inner = self.inner.lock();
		if inner.request_logs.len() == self.max_logs {
			inner.request_logs.pop_front();
		}
		inner.request_logs.push_back(entry);
	}

	pub fn add_domain_event(&self, event: DomainEventEntry) {
		let mut inner = self.inner.lock();
		if inner.domain_events.len() == self.max_events {
			inner.domain_events.pop_front();
		}
		inner.domain_events.push_back(event);
	}

	pub fn update_token_status(&self, service: &str, status: TokenStatus) {
		self.inner.lock().token_status.insert(service.to_string(), status);
	}

	pub fn token_status(&self) -> HashMap<String, TokenStatus> {
		self.inner.lock().token_status.clone()
	}

	pub fn list_logs(&self, query: &LogQuery) -> Page<RequestLogEntry> {
		let items = {
			let inner = self.inner.lock();
			inner.request_logs.iter().cloned().collect::<Vec<_>>()
		};

		let filtered = items
			.into_iter()
			.filter(|entry| {
				query.endpoint.as_ref().map_or(true, |needle| entry.path.contains(needle)) &&
					query.service.as_ref().map_or(true, |service| &entry.service == service) &&
					query.error_type.as_ref().map_or(true, |error_type| {
						entry.error_type.as_deref() == Some(error_type.as_str())
					}) && match query.status.as_deref() {
					Some("ok") => entry.ok,
					Some("error") => !entry.ok,
					_ => true,
				}
			})
			.collect::<Vec<_>>();

		paginate(filtered, query.page, query.page_size)
	}

	pub fn list_domain_events(&self, query: &EventQuery) -> Page<DomainEventEntry> {
		let items = {
			let inner = self.inner.lock();
			inner.domain_events.iter().cloned().collect::<Vec<_>>()
		};

		let filtered = items
			.into_iter()
			.filter(|event| {
				query.service.as_ref().map_or(true, |service| &event.service == service) &&
					query
						.event_type
						.as_ref()
						.map_or(true, |event_type| &event.event_type == event_type) &&
					query.status.as_ref().map_or(true, |status| &event.status == status)
			})
			.collect::<Vec<_>>();

		paginate(filtered, query.page, query.page_size)
	}

	pub fn summary(&self, window_minutes: i64) -> Summary {
		let cutoff = Utc::now() - Duration::minutes(window_minutes);
		let items = {
			let inner = self.inner.lock();
			inner
				.request_logs
				.iter()
				.filter(|entry| entry.timestamp >= cutoff)
				.cloned()
				.collect::<Vec<_>>()
		};

		let total = items.len();
		let errors = items.iter().filter(|entry| !entry.ok).count();
		let durations = items.iter().map(|entry| entry.duration_ms).collect::<Vec<_>>();

		let services = SERVICES
			.iter()
			.map(|service| {
				let rows = items.iter().filter(|entry| entry.service == *service);
				let requests = rows.clone().count();
				let errors = rows.filter(|entry| !entry.ok).count();
				let error_rate =
					if requests == 0 { 0.0 } else { round4(errors as f64 / requests as f64) };
				(service.to_string(), ServiceSummary { requests, errors, error_rate })
			})
			.collect();

		Summary {
			window_minutes,
			total_requests: total,
			error_count: errors,
			error_rate: if total == 0 { 0.0 } else { round4(errors as f64 / total as f64) },
			p95_ms: round3(percentile(&durations, 0.95)),
			avg_ms: if total == 0 {
				0.0
			} else {
				round3(durations.iter().sum::<f64>() / total as f64)
			},
			services,
		}
	}

	pub fn errors(&self, window_minutes: i64, group_by: ErrorGroupBy) -> ErrorsView {
		let cutoff = Utc::now() - Duration::minutes(window_minutes);
		let items = {
			let inner = self.inner.lock();
			inner
				.request_logs
				.iter()
				.filter(|entry| entry.timestamp >= cutoff && !entry.ok)
				.cloned()
				.collect::<Vec<_>>()
		};

		let mut groups: HashMap<String, ErrorGroup> = HashMap::new();
		for entry in items {
			let (key, sample) = match group_by {
				ErrorGroupBy::ErrorType => (
					entry
						.error_type
						.clone()
						.unwrap_or_else(|| format!("HTTP_{}", entry.status_code)),
					Some(entry.path.clone()),
				),
				ErrorGroupBy::Endpoint => (entry.path.clone(), entry.error_type.clone()),
			};
			groups
				.entry(key.clone())
				.and_modify(|group| {
					group.count += 1;
					group.last_seen = group.last_seen.max(entry.timestamp);
				})
				.or_insert(ErrorGroup { key, count: 1, last_seen: entry.timestamp, sample });
		}

		let items = groups
			.into_values()
			.sorted_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)))
			.collect();
		ErrorsView { window_minutes, group_by: group_by.as_str(), items }
	}

	pub fn operations_summary(&self, window_minutes: i64) -> Value {
		let cutoff = Utc::now() - Duration::minutes(window_minutes);
		let (logs, events) = {
			let inner = self.inner.lock();
			(
				inner
					.request_logs
					.iter()
					.filter(|entry| entry.timestamp >= cutoff)
					.cloned()
					.collect::<Vec<_>>(),
				inner
					.domain_events
					.iter()
					.filter(|event| event.timestamp >= cutoff)
					.cloned()
					.collect::<Vec<_>>(),
			)
		};

		let mut operations = serde_json::Map::new();
		for (label, path) in TRACKED_OPERATIONS {
			let rows = logs.iter().filter(|entry| entry.path == *path);
			let success = rows.clone().filter(|entry| entry.ok).count();
			let error = rows.filter(|entry| !entry.ok).count();
			operations
				.insert(label.to_string(), json!({"success": success, "error": error}));
		}

		let mut by_type: HashMap<&str, usize> = HashMap::new();
		let mut error_signatures: HashMap<String, usize> = HashMap::new();
		for event in &events {
			*by_type.entry(event.event_type.as_str()).or_default() += 1;
			if event.status == "error" {
				if let Some(error_type) = &event.error_type {
					*error_signatures
						.entry(format!("{}:{error_type}", event.event_type))
						.or_default() += 1;
				}
			}
		}

		json!({
			"window_minutes": window_minutes,
			"operations": operations,
			"domain_events": {
				"by_type": by_type,
				"error_signatures": error_signatures,
			},
		})
	}

	pub fn alerts(&self) -> AlertsView {
		let now = Utc::now();
		let mut active = Vec::new();

		let summary_10m = self.summary(10);
		if summary_10m.total_requests >= 20 && summary_10m.error_rate >= 0.2 {
			active.push(Alert {
				rule_id: "high_error_rate_10m".to_string(),
				severity: "high",
				title: "High error rate in last 10 minutes".to_string(),
				detail: serde_json::to_value(&summary_10m).expect("summary serialises"),
			});
		}

		let errors_15m = self.errors(15, ErrorGroupBy::ErrorType);
		if let Some(top) = errors_15m.items.first() {
			if top.count >= 5 {
				active.push(Alert {
					rule_id: "repeated_error_signature".to_string(),
					severity: "medium",
					title: "Repeated error signature detected".to_string(),
					detail: serde_json::to_value(top).expect("error group serialises"),
				});
			}
		}

		for (service, status) in self.token_status() {
			let Some(expires_at) = status.expires_at else { continue };
			if expires_at - now <= Duration::minutes(30) {
				active.push(Alert {
					rule_id: format!("{service}_token_expiring"),
					severity: "high",
					title: format!("{} token expires soon", service.to_uppercase()),
					detail: serde_json::to_value(&status).expect("token status serialises"),
				});
			}
		}

		AlertsView { count: active.len(), active }
	}
}

fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Page<T> {
	let page = page.max(1);
	let page_size = page_size.max(1);
	// Newest first.
	let items = items.into_iter().rev().collect::<Vec<_>>();
	let total = items.len();
	let start = (page - 1) * page_size;
	let items = items.into_iter().skip(start).take(page_size).collect();
	Page { page, page_size, total, items }
}
