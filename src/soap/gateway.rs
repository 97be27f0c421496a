use std::future::Future;

use serde_json::Value;

use crate::{
	constants::{SOAP_MAX_ATTEMPTS, SOAP_RETRY_WAIT},
	observability::Observability,
};

use super::envelope::{SoapCallError, SoapEnvelope};

/// Runs one AFIP operation and folds the outcome into the uniform envelope.
///
/// Transport-level failures (connect, timeout, HTTP status) are retried with a
/// fixed wait; SOAP faults and undecodable bodies are not, since repeating
/// them cannot help. Exactly one `soap_call` domain event is emitted per
/// resolved call.
pub async fn consult_afip<F, Fut>(
	obs: &Observability,
	service: &'static str,
	method: &'static str,
	make_request: F,
) -> SoapEnvelope
where
	F: Fn() -> Fut,
	Fut: Future<Output = Result<Value, SoapCallError>>,
{
	let mut attempt = 1;
	loop {
		match make_request().await {
			Ok(response) => {
				obs.emit_domain_event("soap_call", service, "success", Some(method), None, None);
				return SoapEnvelope::success(response);
			},
			Err(error) if error.is_transient() && attempt < SOAP_MAX_ATTEMPTS => {
				tracing::warn!(
					attempt,
					"Transient {} failure calling {service}/{method}: {error}. Retrying",
					error.error_type(),
				);
				tokio::time::sleep(SOAP_RETRY_WAIT).await;
				attempt += 1;
			},
			Err(error) => {
				tracing::error!(
					attempt,
					"{} calling {service}/{method}: {error}",
					error.error_type(),
				);
				obs.emit_domain_event(
					"soap_call",
					service,
					"error",
					Some(method),
					None,
					Some(error.error_type()),
				);
				return SoapEnvelope::failure(method, &error);
			},
		}
	}
}
