use rusqlite::{
	types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
	ToSql,
};
use serde::Serialize;

macro_rules! db_enum {
	($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
		pub enum $name {
			$(#[serde(rename = $text)] $variant),+
		}

		impl $name {
			pub fn as_str(&self) -> &'static str {
				match self {
					$($name::$variant => $text),+
				}
			}

			pub fn parse(text: &str) -> Option<Self> {
				match text {
					$($text => Some($name::$variant)),+,
					_ => None,
				}
			}
		}

		impl ToSql for $name {
			fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
				Ok(ToSqlOutput::from(self.as_str()))
			}
		}

		impl FromSql for $name {
			fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
				let text = value.as_str()?;
				Self::parse(text).ok_or_else(|| {
					FromSqlError::Other(
						format!("unknown {} value: {text}", stringify!($name)).into(),
					)
				})
			}
		}
	};
}

db_enum!(CycleStatus {
	Requested => "requested",
	Active => "active",
	Error => "error",
});

db_enum!(InvoiceStatus {
	IssuedLocal => "issued_local",
	Informed => "informed",
	Error => "error",
});

db_enum!(JobStatus {
	Pending => "pending",
	Processing => "processing",
	Retrying => "retrying",
	Done => "done",
	Failed => "failed",
});

db_enum!(JobType {
	SolicitCaea => "SOLICIT_CAEA",
	InformCaeaMovement => "INFORM_CAEA_MOVEMENT",
});

/// A half-month authorisation window for one taxpayer.
#[derive(Debug, Clone, Serialize)]
pub struct CaeaCycle {
	pub id: i64,
	pub cuit: i64,
	pub periodo: i64,
	pub orden: i64,
	pub caea_code: Option<String>,
	pub status: CycleStatus,
	pub created_at: String,
	pub updated_at: String,
	pub last_error: Option<String>,
}

impl CaeaCycle {
	/// A cycle can only back local issuance while it holds a code.
	pub fn is_usable(&self) -> bool {
		self.status == CycleStatus::Active &&
			self.caea_code.as_deref().is_some_and(|code| !code.trim().is_empty())
	}
}

/// A contingency invoice issued locally, pending upstream reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CaeaInvoice {
	pub id: i64,
	pub cycle_id: i64,
	pub cuit: i64,
	pub pto_vta: i64,
	pub cbte_tipo: i64,
	pub cbte_nro: i64,
	pub payload_json: String,
	pub status: InvoiceStatus,
	pub created_at: String,
	pub updated_at: String,
	pub last_error: Option<String>,
}

/// A durable side-effect against AFIP, keyed for exactly-once execution.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxJob {
	pub id: i64,
	pub job_type: JobType,
	pub idempotency_key: String,
	pub payload_json: String,
	pub status: JobStatus,
	pub attempts: i64,
	pub next_retry_at: String,
	pub created_at: String,
	pub updated_at: String,
	pub last_error: Option<String>,
	pub last_response_json: Option<String>,
}

impl OutboxJob {
	pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
		serde_json::from_str(&self.payload_json)
	}
}

/// Aggregated issuance per cycle and point of sale, for the monitoring views.
#[derive(Debug, Clone, Serialize)]
pub struct CaeaAssignment {
	pub cycle_id: i64,
	pub cuit: i64,
	pub periodo: i64,
	pub orden: i64,
	pub caea_code: Option<String>,
	pub pto_vta: i64,
	pub cbte_tipo: i64,
	pub invoices_count: i64,
	pub cbte_from: i64,
	pub cbte_to: i64,
	pub informed_count: i64,
	pub pending_inform_count: i64,
	pub error_count: i64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn enum_round_trips_through_text() {
		assert_eq!(JobType::parse("SOLICIT_CAEA"), Some(JobType::SolicitCaea));
		assert_eq!(JobType::SolicitCaea.as_str(), "SOLICIT_CAEA");
		assert_eq!(JobStatus::parse("retrying"), Some(JobStatus::Retrying));
		assert_eq!(CycleStatus::parse("bogus"), None);
	}

	#[test]
	fn usable_cycle_needs_a_real_code() {
		let mut cycle = CaeaCycle {
			id: 1,
			cuit: 30740253022,
			periodo: 202601,
			orden: 1,
			caea_code: Some("61234567890123".to_string()),
			status: CycleStatus::Active,
			created_at: String::new(),
			updated_at: String::new(),
			last_error: None,
		};
		assert!(cycle.is_usable());

		cycle.caea_code = Some("  ".to_string());
		assert!(!cycle.is_usable());

		cycle.caea_code = None;
		assert!(!cycle.is_usable());
	}
}
