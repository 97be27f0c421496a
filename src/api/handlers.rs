#![allow(non_snake_case)]

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
	caea::IssueLocalError,
	observability::store::{ErrorGroupBy, EventQuery, LogQuery},
	soap::{
		envelope::{SoapCallError, SoapEnvelope},
		wsfe::Auth,
	},
	state::models::JobStatus,
	wsaa::TicketKeeper,
};

use super::{
	models::{
		CaeaPeriodoOrdenRequest, CaeaRegInformativoRequest, CaeaSinMovimientoConsultarRequest,
		CaeaSinMovimientoInformarRequest, CondicionIvaReceptorRequest, FecaeSolicitarRequest,
		FieldError, GetPersonaRequest, InvoiceBase, InvoiceQueryRequest, QueueIssueLocalRequest,
		QueueSolicitCaeaRequest, WsfeAuthRequest,
	},
	ApiContext, ApiError,
};

/// POSTs without a body deserialise the (empty) query string into this.
#[derive(Debug, Default, Deserialize)]
pub struct Empty {}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
	serde_json::to_value(value)
		.map_err(|error| ApiError::Internal(anyhow::anyhow!("serialisation failed: {error}")))
}

/// Resolves WSFE/WSPCI credentials, or produces the error envelope the
/// caller gets with HTTP 200: a missing ticket is an AFIP-side condition,
/// not a caller error.
async fn credentials_or_envelope(
	tickets: &TicketKeeper,
	method: &str,
) -> Result<(String, String), Value> {
	tickets.ensure_ticket().await.map_err(|error| {
		SoapEnvelope::failure(method, &SoapCallError::Unknown(format!("{error:#}"))).to_value()
	})
}

async fn wsfe_auth_or_envelope(
	ctx: &ApiContext,
	cuit: i64,
	method: &str,
) -> Result<Auth, Value> {
	let (token, sign) = credentials_or_envelope(&ctx.wsfe_tickets, method).await?;
	Ok(Auth { token, sign, cuit })
}

// ===== Token management =====

pub async fn wsaa_token(ctx: ApiContext, _query: Empty) -> Result<Value, ApiError> {
	Ok(ctx.wsfe_tickets.renew().await.to_value())
}

pub async fn wspci_token(ctx: ApiContext, _query: Empty) -> Result<Value, ApiError> {
	Ok(ctx.wspci_tickets.renew().await.to_value())
}

// ===== WSFE invoices =====

pub async fn generate_invoice(
	ctx: ApiContext,
	payload: FecaeSolicitarRequest,
) -> Result<Value, ApiError> {
	tracing::info!("Received request to generate invoice at /wsfe/invoices");
	let auth = match wsfe_auth_or_envelope(&ctx, payload.Auth.Cuit, "FECAESolicitar").await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	let fe_cae_req = to_value(&payload.FeCAEReq)?;
	Ok(ctx.wsfe.fecae_solicitar(&auth, fe_cae_req).await.to_value())
}

pub async fn last_authorized(ctx: ApiContext, payload: InvoiceBase) -> Result<Value, ApiError> {
	let auth =
		match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECompUltimoAutorizado").await {
			Ok(auth) => auth,
			Err(envelope) => return Ok(envelope),
		};
	Ok(ctx
		.wsfe
		.fe_comp_ultimo_autorizado(&auth, payload.PtoVta, payload.CbteTipo)
		.await
		.to_value())
}

pub async fn consult_invoice(
	ctx: ApiContext,
	payload: InvoiceQueryRequest,
) -> Result<Value, ApiError> {
	let auth = match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECompConsultar").await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	let fe_comp_cons_req = json!({
		"CbteTipo": payload.CbteTipo,
		"CbteNro": payload.CbteNro,
		"PtoVta": payload.PtoVta,
	});
	Ok(ctx.wsfe.fe_comp_consultar(&auth, fe_comp_cons_req).await.to_value())
}

// ===== WSFE parameter tables =====

async fn param_request(
	ctx: &ApiContext,
	cuit: i64,
	method: &'static str,
	extra: Vec<(&'static str, Value)>,
) -> Result<Value, ApiError> {
	let auth = match wsfe_auth_or_envelope(ctx, cuit, method).await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	Ok(ctx.wsfe.fe_param_get(&auth, method, extra).await.to_value())
}

pub async fn param_max_reg_x_request(
	ctx: ApiContext,
	payload: WsfeAuthRequest,
) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FECompTotXRequest", Vec::new()).await
}

pub async fn param_types_cbte(ctx: ApiContext, payload: WsfeAuthRequest) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetTiposCbte", Vec::new()).await
}

pub async fn param_types_doc(ctx: ApiContext, payload: WsfeAuthRequest) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetTiposDoc", Vec::new()).await
}

pub async fn param_types_iva(ctx: ApiContext, payload: WsfeAuthRequest) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetTiposIva", Vec::new()).await
}

pub async fn param_types_tributos(
	ctx: ApiContext,
	payload: WsfeAuthRequest,
) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetTiposTributos", Vec::new()).await
}

pub async fn param_types_monedas(
	ctx: ApiContext,
	payload: WsfeAuthRequest,
) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetTiposMonedas", Vec::new()).await
}

pub async fn param_condicion_iva_receptor(
	ctx: ApiContext,
	payload: CondicionIvaReceptorRequest,
) -> Result<Value, ApiError> {
	let extra = match payload.CbteTipo {
		Some(cbte_tipo) => vec![("CbteTipo", json!(cbte_tipo))],
		None => Vec::new(),
	};
	param_request(&ctx, payload.Cuit, "FEParamGetCondicionIvaReceptor", extra).await
}

pub async fn param_puntos_venta(
	ctx: ApiContext,
	payload: WsfeAuthRequest,
) -> Result<Value, ApiError> {
	param_request(&ctx, payload.Cuit, "FEParamGetPtosVenta", Vec::new()).await
}

// ===== CAEA pass-through =====

pub async fn caea_solicitar(
	ctx: ApiContext,
	payload: CaeaPeriodoOrdenRequest,
) -> Result<Value, ApiError> {
	let auth = match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECAEASolicitar").await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	Ok(ctx.wsfe.caea_solicitar(&auth, payload.Periodo, payload.Orden).await.to_value())
}

pub async fn caea_consultar(
	ctx: ApiContext,
	payload: CaeaPeriodoOrdenRequest,
) -> Result<Value, ApiError> {
	let auth = match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECAEAConsultar").await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	Ok(ctx.wsfe.caea_consultar(&auth, payload.Periodo, payload.Orden).await.to_value())
}

pub async fn caea_informar(
	ctx: ApiContext,
	payload: CaeaRegInformativoRequest,
) -> Result<Value, ApiError> {
	let auth = match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECAEARegInformativo").await {
		Ok(auth) => auth,
		Err(envelope) => return Ok(envelope),
	};
	Ok(ctx.wsfe.caea_reg_informativo(&auth, payload.FeCAEARegInfReq).await.to_value())
}

pub async fn caea_sin_movimiento_consultar(
	ctx: ApiContext,
	payload: CaeaSinMovimientoConsultarRequest,
) -> Result<Value, ApiError> {
	let auth =
		match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECAEASinMovimientoConsultar").await {
			Ok(auth) => auth,
			Err(envelope) => return Ok(envelope),
		};
	Ok(ctx
		.wsfe
		.caea_sin_movimiento_consultar(&auth, payload.CAEA, payload.PtoVta)
		.await
		.to_value())
}

pub async fn caea_sin_movimiento_informar(
	ctx: ApiContext,
	payload: CaeaSinMovimientoInformarRequest,
) -> Result<Value, ApiError> {
	let auth =
		match wsfe_auth_or_envelope(&ctx, payload.Cuit, "FECAEASinMovimientoInformar").await {
			Ok(auth) => auth,
			Err(envelope) => return Ok(envelope),
		};
	Ok(ctx
		.wsfe
		.caea_sin_movimiento_informar(&auth, payload.PtoVta, payload.CAEA)
		.await
		.to_value())
}

// ===== CAEA resilience queue =====

pub async fn queue_solicitar(
	ctx: ApiContext,
	payload: QueueSolicitCaeaRequest,
) -> Result<Value, ApiError> {
	let (cycle, job) = ctx.engine.queue_solicit(payload.Cuit, payload.Periodo, payload.Orden)?;
	Ok(json!({"status": "queued", "cycle": cycle, "job": job}))
}

pub async fn queue_issue_local(
	ctx: ApiContext,
	payload: QueueIssueLocalRequest,
) -> Result<Value, ApiError> {
	match ctx.engine.issue_local(
		payload.CycleId,
		payload.Cuit,
		payload.PtoVta,
		payload.CbteTipo,
		payload.FeCAEARegInfReq,
	) {
		Ok(outcome) => Ok(json!({
			"status": "queued",
			"reserved_cbte_nro": outcome.reserved_cbte_nro,
			"caea": outcome.caea,
			"invoice": outcome.invoice,
			"job": outcome.job,
		})),
		Err(error @ IssueLocalError::CycleNotFound) => Err(ApiError::NotFound(error.to_string())),
		Err(error @ IssueLocalError::CycleNotActive) => Err(ApiError::Conflict(error.to_string())),
		Err(IssueLocalError::Internal(error)) => Err(ApiError::Internal(error)),
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryQuery {
	pub limit: Option<u32>,
}

pub async fn queue_retry(ctx: ApiContext, query: RetryQuery) -> Result<Value, ApiError> {
	let limit = query.limit.unwrap_or(20).clamp(1, 200);
	let result = ctx.engine.process_pending_outbox_jobs(limit).await?;
	Ok(json!({"status": "ok", "result": result}))
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboxQuery {
	pub status: Option<String>,
	pub limit: Option<u32>,
}

pub async fn queue_outbox(ctx: ApiContext, query: OutboxQuery) -> Result<Value, ApiError> {
	let status = match query.status.as_deref() {
		None => None,
		Some(text) => Some(JobStatus::parse(text).ok_or_else(|| {
			ApiError::Validation(vec![FieldError::new(
				"status",
				format!("unknown outbox status: {text}"),
			)])
		})?),
	};
	let limit = query.limit.unwrap_or(100).clamp(1, 500);
	let items = ctx.engine.db().list_outbox(status, limit)?;
	Ok(json!({"status": "ok", "items": items}))
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
	pub cuit: i64,
}

pub async fn queue_active(ctx: ApiContext, query: ActiveQuery) -> Result<Value, ApiError> {
	let cycles = ctx.engine.active_cycles(query.cuit)?;
	Ok(json!({"status": "ok", "cycles": cycles}))
}

// ===== WSPCI =====

pub async fn get_persona(ctx: ApiContext, payload: GetPersonaRequest) -> Result<Value, ApiError> {
	let (token, sign) = match credentials_or_envelope(&ctx.wspci_tickets, "getPersona").await {
		Ok(pair) => pair,
		Err(envelope) => return Ok(envelope),
	};
	Ok(ctx
		.wspci
		.get_persona(&token, &sign, payload.cuitRepresentada, payload.idPersona)
		.await
		.to_value())
}

// ===== Health =====

pub async fn liveness(_ctx: ApiContext) -> Result<Value, ApiError> {
	Ok(json!({"status": "alive"}))
}

pub async fn readiness(ctx: ApiContext, _query: Empty) -> Result<Value, ApiError> {
	let ntp = if ctx.sntp.is_reachable().await {
		json!("OK")
	} else {
		json!({
			"status": "error",
			"message": "NTP query failed",
			"server": ctx.sntp.server(),
		})
	};
	let wsfe_health = ctx.wsfe.fe_dummy().await.to_value();
	Ok(json!({"ntp": ntp, "wsfe_health": wsfe_health}))
}

// ===== Monitoring =====

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
	pub window_minutes: Option<i64>,
}

fn window_minutes(query: &WindowQuery) -> i64 {
	query.window_minutes.unwrap_or(60).clamp(1, 1440)
}

pub async fn ui_metrics_summary(ctx: ApiContext, query: WindowQuery) -> Result<Value, ApiError> {
	to_value(&ctx.obs.store().summary(window_minutes(&query)))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQueryParams {
	pub page: Option<usize>,
	pub page_size: Option<usize>,
	pub endpoint: Option<String>,
	pub status: Option<String>,
	pub service: Option<String>,
	pub error_type: Option<String>,
}

pub async fn ui_logs(ctx: ApiContext, query: LogsQueryParams) -> Result<Value, ApiError> {
	if let Some(status) = query.status.as_deref() {
		if !matches!(status, "ok" | "error") {
			return Err(ApiError::Validation(vec![FieldError::new(
				"status",
				"status must be 'ok' or 'error'",
			)]));
		}
	}
	let page = ctx.obs.store().list_logs(&LogQuery {
		page: query.page.unwrap_or(1),
		page_size: query.page_size.unwrap_or(50).clamp(1, 500),
		endpoint: query.endpoint,
		status: query.status,
		service: query.service,
		error_type: query.error_type,
	});
	to_value(&page)
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorsQueryParams {
	pub window_minutes: Option<i64>,
	pub group_by: Option<String>,
}

pub async fn ui_errors(ctx: ApiContext, query: ErrorsQueryParams) -> Result<Value, ApiError> {
	let group_by = match query.group_by.as_deref() {
		None | Some("error_type") => ErrorGroupBy::ErrorType,
		Some("endpoint") => ErrorGroupBy::Endpoint,
		Some(other) => {
			return Err(ApiError::Validation(vec![FieldError::new(
				"group_by",
				format!("unknown group_by: {other}"),
			)]))
		},
	};
	let window = query.window_minutes.unwrap_or(60).clamp(1, 1440);
	to_value(&ctx.obs.store().errors(window, group_by))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQueryParams {
	pub page: Option<usize>,
	pub page_size: Option<usize>,
	pub service: Option<String>,
	pub event_type: Option<String>,
	pub status: Option<String>,
}

pub async fn ui_events(ctx: ApiContext, query: EventsQueryParams) -> Result<Value, ApiError> {
	let page = ctx.obs.store().list_domain_events(&EventQuery {
		page: query.page.unwrap_or(1),
		page_size: query.page_size.unwrap_or(50).clamp(1, 500),
		service: query.service,
		event_type: query.event_type,
		status: query.status,
	});
	to_value(&page)
}

pub async fn ui_tokens_status(ctx: ApiContext, _query: Empty) -> Result<Value, ApiError> {
	to_value(&ctx.obs.refresh_token_state_from_files())
}

pub async fn ui_alerts(ctx: ApiContext, _query: Empty) -> Result<Value, ApiError> {
	ctx.obs.refresh_token_state_from_files();
	to_value(&ctx.obs.store().alerts())
}

pub async fn ui_operations_summary(
	ctx: ApiContext,
	query: WindowQuery,
) -> Result<Value, ApiError> {
	Ok(ctx.obs.store().operations_summary(window_minutes(&query)))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
	pub limit: Option<u32>,
}

pub async fn ui_caea_queue(ctx: ApiContext, query: LimitQuery) -> Result<Value, ApiError> {
	let limit = query.limit.unwrap_or(200).clamp(1, 1000);
	let items = ctx.engine.db().list_outbox(None, limit)?;

	let mut summary =
		json!({"pending": 0, "retrying": 0, "processing": 0, "done": 0, "failed": 0});
	for item in &items {
		let key = item.status.as_str();
		summary[key] = json!(summary[key].as_u64().unwrap_or(0) + 1);
	}
	Ok(json!({"summary": summary, "items": items}))
}

pub async fn ui_caea_queue_retry(ctx: ApiContext, query: LimitQuery) -> Result<Value, ApiError> {
	let limit = query.limit.unwrap_or(30).clamp(1, 200);
	let result = ctx.engine.process_pending_outbox_jobs(limit).await?;
	Ok(json!({"status": "ok", "result": result}))
}

pub async fn ui_caea_assignments(ctx: ApiContext, query: LimitQuery) -> Result<Value, ApiError> {
	let limit = query.limit.unwrap_or(200).clamp(1, 1000);
	let items = ctx.engine.db().list_caea_assignments(limit)?;
	Ok(json!({"count": items.len(), "items": items}))
}
