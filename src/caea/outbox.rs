//! Outbox worker: drains due jobs against AFIP with capped exponential
//! backoff, honouring AFIP's published solicitation window (error 15006) as a
//! deferred retry.

use chrono::{NaiveDate, TimeZone, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
	clock::utc_iso,
	constants::{OUTBOX_BACKOFF_CAP_SECS, OUTBOX_MAX_ATTEMPTS},
	state::models::{CycleStatus, JobStatus, JobType, OutboxJob},
};

use super::{calendar::ar_tz, CaeaEngine};

lazy_static! {
	/// AFIP 15006 messages carry the window as "Del DD/MM/YYYY hasta ...".
	/// The anchor is locale-sensitive; keep it here so a wording change
	/// breaks one regex and its tests.
	static ref WINDOW_DATE_RE: Regex =
		Regex::new(r"(?i)Del\s+(\d{2}/\d{2}/\d{4})").expect("window regex compiles");
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct OutboxCounters {
	pub processed: usize,
	pub done: usize,
	pub retried: usize,
	pub failed: usize,
}

/// Why a job did not complete. `Deferred` carries the retry instant parsed
/// out of AFIP's window message and is used verbatim instead of backoff.
#[derive(Debug, Error)]
enum JobError {
	#[error("{message}")]
	Deferred { message: String, next_retry_at: String },
	#[error("{0}")]
	Failed(String),
}

impl JobError {
	fn kind(&self) -> &'static str {
		match self {
			JobError::Deferred { .. } => "DeferredRetryError",
			JobError::Failed(_) => "RuntimeError",
		}
	}
}

/// Backoff for the n-th failure: `min(3600, 2^attempts * 5)` seconds plus
/// 0..=7 seconds of jitter.
fn backoff_seconds(attempts: i64) -> i64 {
	let exponent = attempts.clamp(0, 62) as u32;
	OUTBOX_BACKOFF_CAP_SECS.min(2i64.saturating_pow(exponent).saturating_mul(5))
}

fn next_retry_at(attempts: i64) -> String {
	let jitter = rand::thread_rng().gen_range(0..=7);
	utc_iso(Utc::now() + chrono::Duration::seconds(backoff_seconds(attempts) + jitter))
}

/// `Errors.Err` normalised to a list: AFIP returns an object for a single
/// error and a list for several.
fn extract_errors(response: &Value) -> Vec<Value> {
	match response.get("Errors").and_then(|errors| errors.get("Err")) {
		Some(Value::Array(items)) => items.clone(),
		Some(single @ Value::Object(_)) => vec![single.clone()],
		_ => Vec::new(),
	}
}

fn field_text(error: &Value, name: &str) -> String {
	match error.get(name) {
		Some(Value::String(text)) => text.clone(),
		Some(Value::Number(number)) => number.to_string(),
		_ => String::new(),
	}
}

fn error_summary(errors: &[Value]) -> String {
	if errors.is_empty() {
		return "CAEA not returned by AFIP".to_string();
	}
	errors
		.iter()
		.map(|error| format!("{}: {}", field_text(error, "Code"), field_text(error, "Msg")))
		.collect::<Vec<_>>()
		.join(", ")
}

/// When a 15006 error names the opening date of the solicitation window,
/// retry at 00:05 local time on that date.
fn deferred_retry_from_15006(errors: &[Value]) -> Option<String> {
	for error in errors {
		if field_text(error, "Code") != "15006" {
			continue;
		}
		let message = field_text(error, "Msg");
		let Some(captures) = WINDOW_DATE_RE.captures(&message) else { continue };
		let Ok(date) = NaiveDate::parse_from_str(&captures[1], "%d/%m/%Y") else { continue };
		let local = date.and_hms_opt(0, 5, 0).expect("00:05 exists");
		let Some(stamp) = ar_tz().from_local_datetime(&local).single() else { continue };
		return Some(utc_iso(stamp.with_timezone(&Utc)));
	}
	None
}

impl CaeaEngine {
	/// Fetches up to `limit` due jobs and executes them in enqueue order.
	/// The fetch-then-claim is not atomic, but claims are: a job lost to a
	/// concurrent worker is skipped.
	pub async fn process_pending_outbox_jobs(&self, limit: u32) -> anyhow::Result<OutboxCounters> {
		let swept = self.db().sweep_stale_processing()?;
		if swept > 0 {
			tracing::warn!(swept, "Reset stale processing outbox jobs to retrying");
		}

		let jobs = self.db().fetch_due_outbox_jobs(limit)?;
		let mut counters = OutboxCounters { processed: jobs.len(), ..Default::default() };

		for job in jobs {
			if !self.db().claim_outbox_job(job.id)? {
				tracing::debug!(job_id = job.id, "Outbox job already claimed, skipping");
				continue;
			}
			self.obs().emit_domain_event(
				"outbox_job",
				"wsfe",
				"started",
				Some(job.job_type.as_str()),
				Some(json!({"job_id": job.id})),
				None,
			);

			match self.execute_job(&job).await {
				Ok(response) => {
					self.db().mark_outbox_done(job.id, &response)?;
					counters.done += 1;
					self.obs().emit_domain_event(
						"outbox_job",
						"wsfe",
						"success",
						Some(job.job_type.as_str()),
						Some(json!({"job_id": job.id})),
						None,
					);
				},
				Err(error) => {
					let attempts = job.attempts + 1;
					let retry_at = match &error {
						JobError::Deferred { next_retry_at, .. } => next_retry_at.clone(),
						JobError::Failed(_) => next_retry_at(attempts),
					};
					let status = self.db().mark_outbox_retry(
						job.id,
						attempts,
						&retry_at,
						&error.to_string(),
					)?;
					tracing::warn!(
						job_id = job.id,
						attempts,
						"Outbox job failed: {error}"
					);
					self.apply_failure_side_effects(&job, &error)?;

					if status == JobStatus::Failed {
						counters.failed += 1;
					} else {
						counters.retried += 1;
					}
					self.obs().emit_domain_event(
						"outbox_job",
						"wsfe",
						"error",
						Some(job.job_type.as_str()),
						Some(json!({"job_id": job.id, "attempts": attempts})),
						Some(error.kind()),
					);
				},
			}
		}

		Ok(counters)
	}

	async fn execute_job(&self, job: &OutboxJob) -> Result<Value, JobError> {
		let payload = job
			.payload()
			.map_err(|error| JobError::Failed(format!("Unreadable job payload: {error}")))?;

		match job.job_type {
			JobType::SolicitCaea => self.execute_solicit(&payload).await,
			JobType::InformCaeaMovement => self.execute_inform(&payload).await,
		}
	}

	async fn execute_solicit(&self, payload: &Value) -> Result<Value, JobError> {
		let cycle_id = require_i64(payload, "cycle_id")?;
		let cycle = payload
			.get("cycle")
			.ok_or_else(|| JobError::Failed("Job payload lacks cycle".to_string()))?;
		let cuit = require_i64(cycle, "Cuit")?;
		let periodo = require_i64(cycle, "Periodo")?;
		let orden = require_i64(cycle, "Orden")?;

		let auth = self
			.wsfe_auth(cuit)
			.await
			.map_err(|error| JobError::Failed(format!("{error:#}")))?;
		let envelope = self.wsfe().caea_solicitar(&auth, periodo, orden).await;

		let Some(response) = envelope.response() else {
			let failure = envelope.error().expect("non-success envelope carries an error");
			return Err(JobError::Failed(format!(
				"{}: {}",
				failure.error_type, failure.detail
			)));
		};

		let has_caea = response
			.get("ResultGet")
			.and_then(|result| result.get("CAEA"))
			.is_some_and(|caea| match caea {
				Value::String(text) => !text.trim().is_empty(),
				Value::Number(_) => true,
				_ => false,
			});
		if !has_caea {
			let errors = extract_errors(response);
			let summary = error_summary(&errors);
			if let Some(next_retry_at) = deferred_retry_from_15006(&errors) {
				return Err(JobError::Deferred { message: summary, next_retry_at });
			}
			return Err(JobError::Failed(summary));
		}

		self.db()
			.update_cycle_from_afip(cycle_id, response)
			.map_err(|error| JobError::Failed(format!("{error:#}")))?;
		Ok(envelope.to_value())
	}

	async fn execute_inform(&self, payload: &Value) -> Result<Value, JobError> {
		let invoice_id = require_i64(payload, "invoice_id")?;
		let request = payload
			.get("request")
			.ok_or_else(|| JobError::Failed("Job payload lacks request".to_string()))?;
		let cuit = require_i64(request, "Cuit")?;
		let reg_inf_req = request
			.get("FeCAEARegInfReq")
			.cloned()
			.ok_or_else(|| JobError::Failed("Job payload lacks FeCAEARegInfReq".to_string()))?;

		let auth = self
			.wsfe_auth(cuit)
			.await
			.map_err(|error| JobError::Failed(format!("{error:#}")))?;
		let envelope = self.wsfe().caea_reg_informativo(&auth, reg_inf_req).await;

		if let Some(failure) = envelope.error() {
			return Err(JobError::Failed(format!(
				"{}: {}",
				failure.error_type, failure.detail
			)));
		}

		self.db()
			.mark_invoice_informed(invoice_id)
			.map_err(|error| JobError::Failed(format!("{error:#}")))?;
		Ok(envelope.to_value())
	}

	/// A failing solicit drags its cycle along (deferred keeps it
	/// `requested`, anything else marks it `error`); a failing inform marks
	/// its invoice.
	fn apply_failure_side_effects(&self, job: &OutboxJob, error: &JobError) -> anyhow::Result<()> {
		let Ok(payload) = job.payload() else { return Ok(()) };
		match job.job_type {
			JobType::SolicitCaea => {
				let Some(cycle_id) = payload.get("cycle_id").and_then(Value::as_i64) else {
					return Ok(());
				};
				match error {
					JobError::Deferred { .. } => self.db().set_cycle_status(
						cycle_id,
						CycleStatus::Requested,
						Some(&error.to_string()),
					)?,
					JobError::Failed(_) => {
						self.db().set_cycle_error(cycle_id, &error.to_string())?
					},
				}
			},
			JobType::InformCaeaMovement => {
				if let Some(invoice_id) = payload.get("invoice_id").and_then(Value::as_i64) {
					self.db().mark_invoice_error(invoice_id, &error.to_string())?;
				}
			},
		}
		Ok(())
	}
}

fn require_i64(value: &Value, field: &str) -> Result<i64, JobError> {
	value
		.get(field)
		.and_then(Value::as_i64)
		.ok_or_else(|| JobError::Failed(format!("Job payload lacks {field}")))
}
