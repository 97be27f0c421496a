use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classified failure of a SOAP call. Only transport-level problems are worth
/// retrying; faults and malformed bodies indicate caller errors or a broken
/// AFIP response and are surfaced immediately.
#[derive(Debug, Error)]
pub enum SoapCallError {
	#[error("{0}")]
	Network(String),
	#[error("{0}")]
	Http(String),
	#[error("{0}")]
	Fault(String),
	#[error("{0}")]
	InvalidResponse(String),
	#[error("{0}")]
	Unknown(String),
}

impl SoapCallError {
	pub fn error_type(&self) -> &'static str {
		match self {
			SoapCallError::Network(_) => "Network error",
			SoapCallError::Http(_) => "HTTP Error",
			SoapCallError::Fault(_) => "SOAPFault",
			SoapCallError::InvalidResponse(_) => "Invalid AFIP response",
			SoapCallError::Unknown(_) => "unknown",
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self, SoapCallError::Network(_) | SoapCallError::Http(_))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoapFailure {
	pub error_type: String,
	pub detail: String,
	pub method: String,
}

/// The uniform result shape every AFIP interaction resolves to. Serialises as
/// `{"status": "success", "response": ...}` or
/// `{"status": "error", "error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SoapEnvelope {
	Success { response: Value },
	Error { error: SoapFailure },
}

impl SoapEnvelope {
	pub fn success(response: Value) -> Self {
		SoapEnvelope::Success { response }
	}

	pub fn failure(method: &str, error: &SoapCallError) -> Self {
		SoapEnvelope::Error {
			error: SoapFailure {
				error_type: error.error_type().to_string(),
				detail: error.to_string(),
				method: method.to_string(),
			},
		}
	}

	pub fn is_success(&self) -> bool {
		matches!(self, SoapEnvelope::Success { .. })
	}

	pub fn response(&self) -> Option<&Value> {
		match self {
			SoapEnvelope::Success { response } => Some(response),
			SoapEnvelope::Error { .. } => None,
		}
	}

	pub fn error(&self) -> Option<&SoapFailure> {
		match self {
			SoapEnvelope::Success { .. } => None,
			SoapEnvelope::Error { error } => Some(error),
		}
	}

	pub fn to_value(&self) -> Value {
		serde_json::to_value(self).expect("envelope serialises to JSON")
	}
}
