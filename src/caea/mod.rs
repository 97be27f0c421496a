//! CAEA resilience engine.
//!
//! AFIP's contingency protocol is two-phased and time-windowed: codes are
//! solicited ahead of each half-month, and locally issued invoices must be
//! reported afterwards, at most once each. The engine keeps both halves
//! durable: cycles and invoices live in the state store, and every upstream
//! side-effect goes through the idempotency-keyed outbox.

pub mod bootstrap;
pub mod calendar;
pub mod outbox;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
	clock::Clock,
	observability::Observability,
	settings::Settings,
	soap::wsfe::{Auth, WsfeClient},
	state::{
		models::{CaeaCycle, CaeaInvoice, JobType, OutboxJob},
		StateDb,
	},
	wsaa::TicketKeeper,
};

pub fn solicit_key(cuit: i64, periodo: i64, orden: i64) -> String {
	format!("solicit:{cuit}:{periodo}:{orden}")
}

pub fn inform_key(cuit: i64, pto_vta: i64, cbte_tipo: i64, cbte_nro: i64) -> String {
	format!("inform:{cuit}:{pto_vta}:{cbte_tipo}:{cbte_nro}")
}

#[derive(Debug, Error)]
pub enum IssueLocalError {
	#[error("CAEA cycle not found for given CycleId/Cuit")]
	CycleNotFound,
	#[error("No active CAEA code loaded for this cycle. Wait bootstrap/solicitar to complete.")]
	CycleNotActive,
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct IssueLocalOutcome {
	pub reserved_cbte_nro: i64,
	pub caea: String,
	pub invoice: CaeaInvoice,
	pub job: OutboxJob,
}

#[derive(Debug, Serialize)]
pub struct ActiveCycleSummary {
	pub periodo: i64,
	pub orden: i64,
	pub active: bool,
	pub caea_code: Option<String>,
	pub status: Option<&'static str>,
}

pub struct CaeaEngine {
	db: StateDb,
	wsfe: Arc<WsfeClient>,
	wsfe_tickets: Arc<TicketKeeper>,
	obs: Observability,
	clock: Arc<dyn Clock>,
	bootstrap_cuits: String,
}

impl CaeaEngine {
	pub fn new(
		settings: &Settings,
		db: StateDb,
		wsfe: Arc<WsfeClient>,
		wsfe_tickets: Arc<TicketKeeper>,
		obs: Observability,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			db,
			wsfe,
			wsfe_tickets,
			obs,
			clock,
			bootstrap_cuits: settings.caea.bootstrap_cuits.clone(),
		}
	}

	pub fn db(&self) -> &StateDb {
		&self.db
	}

	pub(crate) fn wsfe(&self) -> &WsfeClient {
		&self.wsfe
	}

	pub(crate) fn obs(&self) -> &Observability {
		&self.obs
	}

	pub(crate) fn clock(&self) -> &dyn Clock {
		self.clock.as_ref()
	}

	pub(crate) fn bootstrap_cuits(&self) -> &str {
		&self.bootstrap_cuits
	}

	pub(crate) async fn wsfe_auth(&self, cuit: i64) -> Result<Auth> {
		let (token, sign) =
			self.wsfe_tickets.ensure_ticket().await.context("No WSFE credentials available")?;
		Ok(Auth { token, sign, cuit })
	}

	/// Durable CAEA solicitation: ensures the cycle row and enqueues (or
	/// revives) the solicit job under its idempotency key.
	pub fn queue_solicit(
		&self,
		cuit: i64,
		periodo: i64,
		orden: i64,
	) -> Result<(CaeaCycle, OutboxJob)> {
		let cycle = self.db.create_cycle(cuit, periodo, orden)?;
		let job = self.db.add_outbox_job(
			JobType::SolicitCaea,
			&solicit_key(cuit, periodo, orden),
			&json!({
				"cycle_id": cycle.id,
				"cycle": {"Cuit": cuit, "Periodo": periodo, "Orden": orden},
			}),
		)?;
		tracing::info!(cycle_id = cycle.id, "Queued CAEA solicit request");
		Ok((cycle, job))
	}

	/// Reserves the next voucher number, records the local invoice and queues
	/// its inform job with the reserved number and the cycle's code patched
	/// into the first detail row. The queued payload carries the code as it
	/// was at reservation time; later cycle rotations do not touch it.
	pub fn issue_local(
		&self,
		cycle_id: i64,
		cuit: i64,
		pto_vta: i64,
		cbte_tipo: i64,
		mut fe_caea_reg_inf_req: Value,
	) -> Result<IssueLocalOutcome, IssueLocalError> {
		let cycle = self
			.db
			.get_cycle_by_id(cycle_id)
			.map_err(IssueLocalError::Internal)?
			.filter(|cycle| cycle.cuit == cuit)
			.ok_or(IssueLocalError::CycleNotFound)?;
		if !cycle.is_usable() {
			return Err(IssueLocalError::CycleNotActive);
		}
		let caea = cycle.caea_code.clone().expect("usable cycle has a code");

		let next_nro = self
			.db
			.reserve_next_invoice_number(cuit, pto_vta, cbte_tipo)
			.map_err(IssueLocalError::Internal)?;

		let detail = fe_caea_reg_inf_req
			.get_mut("FeDetReq")
			.and_then(|det| det.get_mut("FECAEADetRequest"))
			.and_then(|rows| rows.get_mut(0))
			.ok_or_else(|| {
				IssueLocalError::Internal(anyhow!(
					"FeCAEARegInfReq.FeDetReq.FECAEADetRequest must carry one detail row"
				))
			})?;
		detail["CbteDesde"] = json!(next_nro);
		detail["CbteHasta"] = json!(next_nro);
		detail["CAEA"] = json!(caea);

		let invoice = self
			.db
			.create_local_invoice(cycle_id, cuit, pto_vta, cbte_tipo, next_nro, &fe_caea_reg_inf_req)
			.map_err(IssueLocalError::Internal)?;

		let request = json!({"Cuit": cuit, "FeCAEARegInfReq": fe_caea_reg_inf_req});
		let job = self
			.db
			.add_outbox_job(
				JobType::InformCaeaMovement,
				&inform_key(cuit, pto_vta, cbte_tipo, next_nro),
				&json!({"invoice_id": invoice.id, "request": request}),
			)
			.map_err(IssueLocalError::Internal)?;

		Ok(IssueLocalOutcome { reserved_cbte_nro: next_nro, caea, invoice, job })
	}

	/// The two windows the engine tracks for a CUIT, with their stored state.
	pub fn active_cycles(&self, cuit: i64) -> Result<Vec<ActiveCycleSummary>> {
		let mut cycles = Vec::with_capacity(2);
		for (periodo, orden) in calendar::resolve_current_and_next_cycles(self.clock.now_utc()) {
			let active = self.db.get_active_cycle(cuit, periodo, orden)?;
			let cycle = self.db.get_cycle(cuit, periodo, orden)?;
			cycles.push(ActiveCycleSummary {
				periodo,
				orden,
				active: active.is_some(),
				caea_code: active.and_then(|cycle| cycle.caea_code),
				status: cycle.map(|cycle| cycle.status.as_str()),
			});
		}
		Ok(cycles)
	}
}

#[cfg(test)]
pub mod test_utils {
	use chrono::{TimeZone, Utc};

	use super::*;
	use crate::{
		clock::test_utils::FixedClock,
		observability::test_utils::new_test_observability,
		settings,
		soap::transport::test_utils::ScriptedTransport,
		soap::wsaa::WsaaClient,
		state::test_utils::new_test_db,
		wsaa::ticket::test_utils::{write_test_identity, FixedTimeSource, test_ticket_times, ticket_response_xml},
	};

	pub struct TestEngine {
		pub engine: CaeaEngine,
		pub transport: Arc<ScriptedTransport>,
		pub obs: Observability,
		_dir: tempfile::TempDir,
	}

	/// Engine wired to a scripted WSFE transport, with a fresh store and a
	/// stored, far-future ticket so auth never triggers a renewal.
	pub fn engine_with_responses(outcomes: Vec<Result<String, crate::soap::SoapCallError>>) -> TestEngine {
		engine_at(
			outcomes,
			Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(),
			"",
		)
	}

	pub fn engine_at(
		outcomes: Vec<Result<String, crate::soap::SoapCallError>>,
		now: chrono::DateTime<Utc>,
		bootstrap_cuits: &str,
	) -> TestEngine {
		let (dir, db) = new_test_db();
		let mut settings = settings::test_utils::new_test_settings(dir.path());
		settings.caea.bootstrap_cuits = bootstrap_cuits.to_string();
		let (cert_file, key_file) = write_test_identity(dir.path());
		settings.wsaa.cert_file = cert_file;
		settings.wsaa.key_file = key_file;

		let obs = new_test_observability();
		let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
		let transport = Arc::new(ScriptedTransport::new(outcomes));

		let wsaa = WsaaClient::new(
			transport.clone(),
			settings.afip.wsaa.url().to_string(),
			obs.clone(),
		);
		let tickets = Arc::new(TicketKeeper::wsfe(
			&settings,
			wsaa,
			Arc::new(FixedTimeSource(test_ticket_times())),
			clock.clone(),
		));
		// Far-future ticket so `ensure_ticket` reads from disk.
		std::fs::create_dir_all(tickets.response_file().parent().unwrap()).unwrap();
		std::fs::write(tickets.response_file(), ticket_response_xml("2999-01-01T00:00:00-03:00"))
			.unwrap();

		let wsfe = Arc::new(WsfeClient::new(
			transport.clone(),
			settings.afip.wsfe.url().to_string(),
			obs.clone(),
		));
		let engine =
			CaeaEngine::new(&settings, db, wsfe, tickets, obs.clone(), clock);
		TestEngine { engine, transport, obs, _dir: dir }
	}
}
