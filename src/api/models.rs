//! Request bodies for the JSON facade.
//!
//! Field names mirror AFIP's payload aliases verbatim (`Cuit`, `PtoVta`,
//! `FeCAEReq`, ...), so a body deserialised here re-serialises into exactly
//! the structure the SOAP encoder expects. Validation failures surface as a
//! 422 listing every failing `{field, message}` pair.

#![allow(non_snake_case)]

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
	static ref DATE_YYYYMMDD_RE: Regex = Regex::new(r"^\d{8}$").expect("date regex compiles");
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
	pub field: String,
	pub message: String,
}

impl FieldError {
	pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
		Self { field: field.into(), message: message.into() }
	}
}

pub trait Validate {
	fn validate(&self) -> Vec<FieldError> {
		Vec::new()
	}
}

fn is_valid_yyyymmdd(value: &str) -> bool {
	DATE_YYYYMMDD_RE.is_match(value)
}

// ===== CAEA queue =====

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSolicitCaeaRequest {
	pub Cuit: i64,
	pub Periodo: i64,
	pub Orden: i64,
}

impl Validate for QueueSolicitCaeaRequest {
	fn validate(&self) -> Vec<FieldError> {
		let mut errors = Vec::new();
		if !(1..=2).contains(&self.Orden) {
			errors.push(FieldError::new("Orden", "Orden must be 1 or 2"));
		}
		errors
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueIssueLocalRequest {
	pub CycleId: i64,
	pub Cuit: i64,
	pub PtoVta: i64,
	pub CbteTipo: i64,
	pub FeCAEARegInfReq: Value,
}

impl Validate for QueueIssueLocalRequest {
	fn validate(&self) -> Vec<FieldError> {
		let detail_rows = self
			.FeCAEARegInfReq
			.get("FeDetReq")
			.and_then(|det| det.get("FECAEADetRequest"))
			.and_then(Value::as_array);
		match detail_rows {
			Some(rows) if !rows.is_empty() => Vec::new(),
			_ => vec![FieldError::new(
				"FeCAEARegInfReq.FeDetReq.FECAEADetRequest",
				"must carry at least one detail row",
			)],
		}
	}
}

// ===== WSFE pass-through =====

#[derive(Debug, Clone, Deserialize)]
pub struct WsfeAuthRequest {
	pub Cuit: i64,
}

impl Validate for WsfeAuthRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceBase {
	pub Cuit: i64,
	pub PtoVta: i64,
	pub CbteTipo: i64,
}

impl Validate for InvoiceBase {}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceQueryRequest {
	pub Cuit: i64,
	pub PtoVta: i64,
	pub CbteTipo: i64,
	pub CbteNro: i64,
}

impl Validate for InvoiceQueryRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct CaeaPeriodoOrdenRequest {
	pub Cuit: i64,
	pub Periodo: i64,
	pub Orden: i64,
}

impl Validate for CaeaPeriodoOrdenRequest {
	fn validate(&self) -> Vec<FieldError> {
		let mut errors = Vec::new();
		if !(1..=2).contains(&self.Orden) {
			errors.push(FieldError::new("Orden", "Orden must be 1 or 2"));
		}
		errors
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaeaRegInformativoRequest {
	pub Cuit: i64,
	pub FeCAEARegInfReq: Value,
}

impl Validate for CaeaRegInformativoRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct CaeaSinMovimientoConsultarRequest {
	pub Cuit: i64,
	pub PtoVta: i64,
	pub CAEA: Option<String>,
}

impl Validate for CaeaSinMovimientoConsultarRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct CaeaSinMovimientoInformarRequest {
	pub Cuit: i64,
	pub PtoVta: i64,
	pub CAEA: String,
}

impl Validate for CaeaSinMovimientoInformarRequest {}

#[derive(Debug, Clone, Deserialize)]
pub struct CondicionIvaReceptorRequest {
	pub Cuit: i64,
	pub CbteTipo: Option<i64>,
}

impl Validate for CondicionIvaReceptorRequest {}

// ===== WSPCI =====

#[derive(Debug, Clone, Deserialize)]
pub struct GetPersonaRequest {
	pub cuitRepresentada: i64,
	pub idPersona: i64,
}

impl Validate for GetPersonaRequest {}

// ===== FECAE solicitation =====

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FecaeAuth {
	pub Cuit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeCabReq {
	pub CantReg: i64,
	pub PtoVta: i64,
	pub CbteTipo: i64,
}

/// One FECAE detail row. The aliased optional groups (`Iva`/`AlicIva`,
/// `Tributos`/`Tributo`, ...) pass through as opaque values so their element
/// order reaches the SOAP encoder untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FecaeDetRequest {
	pub Concepto: i64,
	pub DocTipo: i64,
	pub DocNro: i64,
	pub CbteDesde: i64,
	pub CbteHasta: i64,
	pub CbteFch: String,
	pub ImpTotal: f64,
	pub ImpTotConc: f64,
	pub ImpNeto: f64,
	pub ImpOpEx: f64,
	pub ImpTrib: f64,
	pub ImpIVA: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub FchServDesde: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub FchServHasta: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub FchVtoPago: Option<String>,
	pub MonId: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub MonCotiz: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub CanMisMonExt: Option<String>,
	pub CondicionIVAReceptorId: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub CbtesAsoc: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub Tributos: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub Iva: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub Opcionales: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub Compradores: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub PeriodoAsoc: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub Actividades: Option<Value>,
}

impl FecaeDetRequest {
	fn validate_into(&self, field_prefix: &str, errors: &mut Vec<FieldError>) {
		let mut dates = vec![("CbteFch", Some(&self.CbteFch))];
		let optional = [
			("FchServDesde", self.FchServDesde.as_ref()),
			("FchServHasta", self.FchServHasta.as_ref()),
			("FchVtoPago", self.FchVtoPago.as_ref()),
		];
		for (label, value) in optional {
			if value.is_some() {
				dates.push((label, value));
			}
		}
		for (label, value) in dates {
			let value = value.expect("only present dates are checked");
			if !is_valid_yyyymmdd(value) {
				errors.push(FieldError::new(
					format!("{field_prefix}.{label}"),
					format!("{label} must use yyyymmdd format"),
				));
			}
		}

		if self.CbteDesde > self.CbteHasta {
			errors.push(FieldError::new(
				format!("{field_prefix}.CbteDesde"),
				"CbteDesde must be less than or equal to CbteHasta",
			));
		}

		if matches!(self.Concepto, 2 | 3) {
			let missing = [
				("FchServDesde", &self.FchServDesde),
				("FchServHasta", &self.FchServHasta),
				("FchVtoPago", &self.FchVtoPago),
			]
			.iter()
			.filter(|(_, value)| value.is_none())
			.map(|(label, _)| *label)
			.collect::<Vec<_>>();
			if !missing.is_empty() {
				errors.push(FieldError::new(
					format!("{field_prefix}.Concepto"),
					"Concepto 2 or 3 requires FchServDesde, FchServHasta and FchVtoPago",
				));
			}
		}

		let expected_total =
			self.ImpTotConc + self.ImpNeto + self.ImpOpEx + self.ImpTrib + self.ImpIVA;
		if (self.ImpTotal - expected_total).abs() > 0.01 {
			errors.push(FieldError::new(
				format!("{field_prefix}.ImpTotal"),
				"ImpTotal must equal ImpTotConc + ImpNeto + ImpOpEx + ImpTrib + ImpIVA",
			));
		}

		let cotiz = self.MonCotiz.unwrap_or(0.0);
		if self.MonId == "PES" {
			if (cotiz - 1.0).abs() > 0.0001 {
				errors.push(FieldError::new(
					format!("{field_prefix}.MonCotiz"),
					"MonCotiz must be 1 for MonId PES",
				));
			}
		} else if cotiz <= 0.0 {
			errors.push(FieldError::new(
				format!("{field_prefix}.MonCotiz"),
				"MonCotiz must be greater than 0 when MonId is not PES",
			));
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeDetReq {
	pub FECAEDetRequest: Vec<FecaeDetRequest>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeCAEReq {
	pub FeCabReq: FeCabReq,
	pub FeDetReq: FeDetReq,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FecaeSolicitarRequest {
	pub Auth: FecaeAuth,
	pub FeCAEReq: FeCAEReq,
}

impl Validate for FecaeSolicitarRequest {
	fn validate(&self) -> Vec<FieldError> {
		let mut errors = Vec::new();

		let detail_rows = self.FeCAEReq.FeDetReq.FECAEDetRequest.len() as i64;
		if self.FeCAEReq.FeCabReq.CantReg != detail_rows {
			errors.push(FieldError::new(
				"FeCAEReq.FeCabReq.CantReg",
				"FeCabReq.CantReg must match FECAEDetRequest size",
			));
		}

		for (index, detail) in self.FeCAEReq.FeDetReq.FECAEDetRequest.iter().enumerate() {
			let prefix = format!("FeCAEReq.FeDetReq.FECAEDetRequest[{index}]");
			detail.validate_into(&prefix, &mut errors);
		}

		errors
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn base_detail() -> Value {
		json!({
			"Concepto": 1,
			"DocTipo": 99,
			"DocNro": 0,
			"CbteDesde": 1,
			"CbteHasta": 1,
			"CbteFch": "20260125",
			"ImpTotal": 121.0,
			"ImpTotConc": 0.0,
			"ImpNeto": 100.0,
			"ImpOpEx": 0.0,
			"ImpTrib": 0.0,
			"ImpIVA": 21.0,
			"MonId": "PES",
			"MonCotiz": 1.0,
			"CondicionIVAReceptorId": 5,
			"Iva": {"AlicIva": [{"Id": 5, "BaseImp": 100.0, "Importe": 21.0}]},
		})
	}

	fn request_with_detail(detail: Value) -> FecaeSolicitarRequest {
		serde_json::from_value(json!({
			"Auth": {"Cuit": 30740253022i64},
			"FeCAEReq": {
				"FeCabReq": {"CantReg": 1, "PtoVta": 1, "CbteTipo": 11},
				"FeDetReq": {"FECAEDetRequest": [detail]},
			},
		}))
		.unwrap()
	}

	#[test]
	fn valid_request_passes() {
		assert!(request_with_detail(base_detail()).validate().is_empty());
	}

	#[test]
	fn dashed_date_is_rejected_with_format_hint() {
		let mut detail = base_detail();
		detail["CbteFch"] = json!("2026-01-25");
		let errors = request_with_detail(detail).validate();

		assert_eq!(errors.len(), 1);
		assert!(errors[0].message.contains("yyyymmdd"));
		assert!(errors[0].field.ends_with("CbteFch"));
	}

	#[test]
	fn totals_must_add_up() {
		let mut detail = base_detail();
		detail["ImpTotal"] = json!(500.0);
		let errors = request_with_detail(detail).validate();
		assert!(errors.iter().any(|error| error.field.ends_with("ImpTotal")));
	}

	#[test]
	fn concepto_services_require_date_triple() {
		let mut detail = base_detail();
		detail["Concepto"] = json!(2);
		let errors = request_with_detail(detail.clone()).validate();
		assert!(errors.iter().any(|error| error.field.ends_with("Concepto")));

		detail["FchServDesde"] = json!("20260101");
		detail["FchServHasta"] = json!("20260131");
		detail["FchVtoPago"] = json!("20260210");
		let errors = request_with_detail(detail).validate();
		assert!(errors.is_empty());
	}

	#[test]
	fn foreign_currency_needs_positive_rate() {
		let mut detail = base_detail();
		detail["MonId"] = json!("DOL");
		detail["MonCotiz"] = json!(0.0);
		let errors = request_with_detail(detail.clone()).validate();
		assert!(errors.iter().any(|error| error.message.contains("greater than 0")));

		detail["MonCotiz"] = json!(1043.25);
		assert!(request_with_detail(detail).validate().is_empty());
	}

	#[test]
	fn cant_reg_must_match_detail_count() {
		let request: FecaeSolicitarRequest = serde_json::from_value(json!({
			"Auth": {"Cuit": 30740253022i64},
			"FeCAEReq": {
				"FeCabReq": {"CantReg": 2, "PtoVta": 1, "CbteTipo": 11},
				"FeDetReq": {"FECAEDetRequest": [base_detail()]},
			},
		}))
		.unwrap();
		let errors = request.validate();
		assert!(errors.iter().any(|error| error.field.ends_with("CantReg")));
	}

	#[test]
	fn serialisation_round_trip_keeps_aliases_and_drops_nones() {
		let request = request_with_detail(base_detail());
		let value = serde_json::to_value(&request).unwrap();

		let detail = &value["FeCAEReq"]["FeDetReq"]["FECAEDetRequest"][0];
		assert!(detail.get("FchServDesde").is_none());
		assert_eq!(detail["Iva"]["AlicIva"][0]["Id"], json!(5));
	}

	#[test]
	fn issue_local_requires_detail_rows() {
		let request: QueueIssueLocalRequest = serde_json::from_value(json!({
			"CycleId": 1,
			"Cuit": 30740253022i64,
			"PtoVta": 1,
			"CbteTipo": 11,
			"FeCAEARegInfReq": {"FeDetReq": {"FECAEADetRequest": []}},
		}))
		.unwrap();
		assert_eq!(request.validate().len(), 1);
	}

	#[test]
	fn orden_outside_half_months_is_rejected() {
		let request: QueueSolicitCaeaRequest = serde_json::from_value(json!({
			"Cuit": 30740253022i64, "Periodo": 202602, "Orden": 3
		}))
		.unwrap();
		assert_eq!(request.validate().len(), 1);
	}
}
