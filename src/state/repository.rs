use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

use crate::{
	clock::{now_iso, utc_iso},
	constants::{OUTBOX_MAX_ATTEMPTS, STALE_PROCESSING_TIMEOUT},
};

use super::{
	models::{CaeaAssignment, CaeaCycle, CaeaInvoice, CycleStatus, JobStatus, JobType, OutboxJob},
	StateDb,
};

fn cycle_from_row(row: &Row) -> rusqlite::Result<CaeaCycle> {
	Ok(CaeaCycle {
		id: row.get("id")?,
		cuit: row.get("cuit")?,
		periodo: row.get("periodo")?,
		orden: row.get("orden")?,
		caea_code: row.get("caea_code")?,
		status: row.get("status")?,
		created_at: row.get("created_at")?,
		updated_at: row.get("updated_at")?,
		last_error: row.get("last_error")?,
	})
}

fn invoice_from_row(row: &Row) -> rusqlite::Result<CaeaInvoice> {
	Ok(CaeaInvoice {
		id: row.get("id")?,
		cycle_id: row.get("cycle_id")?,
		cuit: row.get("cuit")?,
		pto_vta: row.get("pto_vta")?,
		cbte_tipo: row.get("cbte_tipo")?,
		cbte_nro: row.get("cbte_nro")?,
		payload_json: row.get("payload_json")?,
		status: row.get("status")?,
		created_at: row.get("created_at")?,
		updated_at: row.get("updated_at")?,
		last_error: row.get("last_error")?,
	})
}

fn job_from_row(row: &Row) -> rusqlite::Result<OutboxJob> {
	Ok(OutboxJob {
		id: row.get("id")?,
		job_type: row.get("job_type")?,
		idempotency_key: row.get("idempotency_key")?,
		payload_json: row.get("payload_json")?,
		status: row.get("status")?,
		attempts: row.get("attempts")?,
		next_retry_at: row.get("next_retry_at")?,
		created_at: row.get("created_at")?,
		updated_at: row.get("updated_at")?,
		last_error: row.get("last_error")?,
		last_response_json: row.get("last_response_json")?,
	})
}

/// A CAEA code may arrive as a string or, through the XML decoder, as a bare
/// number; both count as present as long as they are non-empty.
fn caea_code_from(afip_result: &Value) -> Option<String> {
	let code = afip_result.get("ResultGet")?.get("CAEA")?;
	match code {
		Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
		Value::Number(number) => Some(number.to_string()),
		_ => None,
	}
}

impl StateDb {
	// ===== caea_cycle =====

	/// Inserts the cycle as `requested` if absent and returns the stored row.
	pub fn create_cycle(&self, cuit: i64, periodo: i64, orden: i64) -> Result<CaeaCycle> {
		let mut connection = self.connect()?;
		let now = now_iso();
		let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
		tx.execute(
			"INSERT OR IGNORE INTO caea_cycle (cuit, periodo, orden, status, created_at, updated_at)
			 VALUES (?1, ?2, ?3, 'requested', ?4, ?4)",
			params![cuit, periodo, orden, now],
		)?;
		let cycle = tx.query_row(
			"SELECT * FROM caea_cycle WHERE cuit = ?1 AND periodo = ?2 AND orden = ?3",
			params![cuit, periodo, orden],
			cycle_from_row,
		)?;
		tx.commit()?;
		Ok(cycle)
	}

	pub fn get_cycle_by_id(&self, cycle_id: i64) -> Result<Option<CaeaCycle>> {
		let connection = self.connect()?;
		connection
			.query_row("SELECT * FROM caea_cycle WHERE id = ?1", params![cycle_id], cycle_from_row)
			.optional()
			.context("Could not read cycle")
	}

	pub fn get_cycle(&self, cuit: i64, periodo: i64, orden: i64) -> Result<Option<CaeaCycle>> {
		let connection = self.connect()?;
		connection
			.query_row(
				"SELECT * FROM caea_cycle WHERE cuit = ?1 AND periodo = ?2 AND orden = ?3",
				params![cuit, periodo, orden],
				cycle_from_row,
			)
			.optional()
			.context("Could not read cycle")
	}

	pub fn get_active_cycle(
		&self,
		cuit: i64,
		periodo: i64,
		orden: i64,
	) -> Result<Option<CaeaCycle>> {
		let connection = self.connect()?;
		connection
			.query_row(
				"SELECT * FROM caea_cycle
				 WHERE cuit = ?1 AND periodo = ?2 AND orden = ?3
				   AND status = 'active' AND caea_code IS NOT NULL
				 LIMIT 1",
				params![cuit, periodo, orden],
				cycle_from_row,
			)
			.optional()
			.context("Could not read active cycle")
	}

	/// Applies a solicit response: the cycle becomes `active` only when AFIP
	/// actually returned a code.
	pub fn update_cycle_from_afip(&self, cycle_id: i64, afip_result: &Value) -> Result<()> {
		let connection = self.connect()?;
		let caea = caea_code_from(afip_result);
		let (status, last_error) = match &caea {
			Some(_) => (CycleStatus::Active, None),
			None => (CycleStatus::Requested, Some("missing_caea_code")),
		};
		connection.execute(
			"UPDATE caea_cycle SET caea_code = ?1, status = ?2, updated_at = ?3, last_error = ?4
			 WHERE id = ?5",
			params![caea, status, now_iso(), last_error, cycle_id],
		)?;
		Ok(())
	}

	pub fn set_cycle_status(
		&self,
		cycle_id: i64,
		status: CycleStatus,
		error: Option<&str>,
	) -> Result<()> {
		let connection = self.connect()?;
		connection.execute(
			"UPDATE caea_cycle SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
			params![status, error, now_iso(), cycle_id],
		)?;
		Ok(())
	}

	pub fn set_cycle_error(&self, cycle_id: i64, error: &str) -> Result<()> {
		self.set_cycle_status(cycle_id, CycleStatus::Error, Some(error))
	}

	/// Repairs the `active ⇔ has code` invariant after crashes or manual
	/// edits. Returns how many rows were demoted.
	pub fn normalize_cycle_statuses(&self) -> Result<usize> {
		let connection = self.connect()?;
		let demoted = connection.execute(
			"UPDATE caea_cycle
			 SET status = 'requested', last_error = 'missing_caea_code', updated_at = ?1
			 WHERE status = 'active' AND (caea_code IS NULL OR TRIM(caea_code) = '')",
			params![now_iso()],
		)?;
		Ok(demoted)
	}

	// ===== caea_invoice =====

	/// Allocates the next voucher number for the `(cuit, pto_vta, cbte_tipo)`
	/// sequence. `BEGIN IMMEDIATE` serialises concurrent reservations, and
	/// numbers are never reused: a failed inform keeps its row.
	pub fn reserve_next_invoice_number(
		&self,
		cuit: i64,
		pto_vta: i64,
		cbte_tipo: i64,
	) -> Result<i64> {
		let mut connection = self.connect()?;
		let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
		let max_nro: Option<i64> = tx.query_row(
			"SELECT MAX(cbte_nro) FROM caea_invoice
			 WHERE cuit = ?1 AND pto_vta = ?2 AND cbte_tipo = ?3",
			params![cuit, pto_vta, cbte_tipo],
			|row| row.get(0),
		)?;
		tx.commit()?;
		Ok(max_nro.unwrap_or(0) + 1)
	}

	pub fn create_local_invoice(
		&self,
		cycle_id: i64,
		cuit: i64,
		pto_vta: i64,
		cbte_tipo: i64,
		cbte_nro: i64,
		payload: &Value,
	) -> Result<CaeaInvoice> {
		let connection = self.connect()?;
		let now = now_iso();
		connection.execute(
			"INSERT INTO caea_invoice
			 (cycle_id, cuit, pto_vta, cbte_tipo, cbte_nro, payload_json, status, created_at, updated_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'issued_local', ?7, ?7)",
			params![cycle_id, cuit, pto_vta, cbte_tipo, cbte_nro, payload.to_string(), now],
		)?;
		connection
			.query_row(
				"SELECT * FROM caea_invoice WHERE id = last_insert_rowid()",
				[],
				invoice_from_row,
			)
			.context("Could not read back created invoice")
	}

	pub fn mark_invoice_informed(&self, invoice_id: i64) -> Result<()> {
		let connection = self.connect()?;
		connection.execute(
			"UPDATE caea_invoice SET status = 'informed', updated_at = ?1, last_error = NULL
			 WHERE id = ?2",
			params![now_iso(), invoice_id],
		)?;
		Ok(())
	}

	pub fn mark_invoice_error(&self, invoice_id: i64, error: &str) -> Result<()> {
		let connection = self.connect()?;
		connection.execute(
			"UPDATE caea_invoice SET status = 'error', updated_at = ?1, last_error = ?2
			 WHERE id = ?3",
			params![now_iso(), error, invoice_id],
		)?;
		Ok(())
	}

	// ===== afip_outbox =====

	/// Enqueues a job under its idempotency key. A live row is returned
	/// untouched; a `failed` row is revived as `pending` with zero attempts.
	pub fn add_outbox_job(
		&self,
		job_type: JobType,
		idempotency_key: &str,
		payload: &Value,
	) -> Result<OutboxJob> {
		let connection = self.connect()?;
		let now = now_iso();
		connection.execute(
			"INSERT OR IGNORE INTO afip_outbox
			 (job_type, idempotency_key, payload_json, status, attempts, next_retry_at, created_at, updated_at)
			 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4)",
			params![job_type, idempotency_key, payload.to_string(), now],
		)?;

		let job = connection.query_row(
			"SELECT * FROM afip_outbox WHERE idempotency_key = ?1",
			params![idempotency_key],
			job_from_row,
		)?;
		if job.status != JobStatus::Failed {
			return Ok(job);
		}

		let now = now_iso();
		connection.execute(
			"UPDATE afip_outbox
			 SET status = 'pending', attempts = 0, next_retry_at = ?1, updated_at = ?1, last_error = NULL
			 WHERE id = ?2",
			params![now, job.id],
		)?;
		connection
			.query_row(
				"SELECT * FROM afip_outbox WHERE id = ?1",
				params![job.id],
				job_from_row,
			)
			.context("Could not read back revived job")
	}

	/// Crash recovery: rows left `processing` beyond the timeout go back to
	/// `retrying` with their attempt count untouched.
	pub fn sweep_stale_processing(&self) -> Result<usize> {
		let connection = self.connect()?;
		let cutoff = utc_iso(
			Utc::now() -
				chrono::Duration::from_std(STALE_PROCESSING_TIMEOUT)
					.expect("timeout fits in chrono"),
		);
		let swept = connection.execute(
			"UPDATE afip_outbox
			 SET status = 'retrying', last_error = 'stale_processing_reset', updated_at = ?1
			 WHERE status = 'processing' AND updated_at < ?2",
			params![now_iso(), cutoff],
		)?;
		Ok(swept)
	}

	pub fn fetch_due_outbox_jobs(&self, limit: u32) -> Result<Vec<OutboxJob>> {
		let connection = self.connect()?;
		let mut statement = connection.prepare(
			"SELECT * FROM afip_outbox
			 WHERE status IN ('pending', 'retrying') AND next_retry_at <= ?1
			 ORDER BY id ASC
			 LIMIT ?2",
		)?;
		let jobs = statement
			.query_map(params![now_iso(), limit], job_from_row)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(jobs)
	}

	/// Moves a due job to `processing`. Returns false when another worker got
	/// there first, in which case the caller must skip the job.
	pub fn claim_outbox_job(&self, job_id: i64) -> Result<bool> {
		let connection = self.connect()?;
		let claimed = connection.execute(
			"UPDATE afip_outbox SET status = 'processing', updated_at = ?1
			 WHERE id = ?2 AND status IN ('pending', 'retrying')",
			params![now_iso(), job_id],
		)?;
		Ok(claimed > 0)
	}

	pub fn mark_outbox_done(&self, job_id: i64, response: &Value) -> Result<()> {
		let connection = self.connect()?;
		connection.execute(
			"UPDATE afip_outbox
			 SET status = 'done', updated_at = ?1, last_error = NULL, last_response_json = ?2
			 WHERE id = ?3",
			params![now_iso(), response.to_string(), job_id],
		)?;
		Ok(())
	}

	pub fn mark_outbox_retry(
		&self,
		job_id: i64,
		attempts: i64,
		next_retry_at: &str,
		error: &str,
	) -> Result<JobStatus> {
		let status =
			if attempts >= OUTBOX_MAX_ATTEMPTS { JobStatus::Failed } else { JobStatus::Retrying };
		let connection = self.connect()?;
		connection.execute(
			"UPDATE afip_outbox
			 SET status = ?1, attempts = ?2, next_retry_at = ?3, last_error = ?4, updated_at = ?5
			 WHERE id = ?6",
			params![status, attempts, next_retry_at, error, now_iso(), job_id],
		)?;
		Ok(status)
	}

	pub fn get_outbox_job(&self, job_id: i64) -> Result<Option<OutboxJob>> {
		let connection = self.connect()?;
		connection
			.query_row("SELECT * FROM afip_outbox WHERE id = ?1", params![job_id], job_from_row)
			.optional()
			.context("Could not read outbox job")
	}

	pub fn list_outbox(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<OutboxJob>> {
		let connection = self.connect()?;
		let jobs = match status {
			Some(status) => {
				let mut statement = connection.prepare(
					"SELECT * FROM afip_outbox WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
				)?;
				let jobs = statement
					.query_map(params![status, limit], job_from_row)?
					.collect::<rusqlite::Result<Vec<_>>>()?;
				jobs
			},
			None => {
				let mut statement = connection
					.prepare("SELECT * FROM afip_outbox ORDER BY id DESC LIMIT ?1")?;
				let jobs = statement
					.query_map(params![limit], job_from_row)?
					.collect::<rusqlite::Result<Vec<_>>>()?;
				jobs
			},
		};
		Ok(jobs)
	}

	pub fn list_caea_assignments(&self, limit: u32) -> Result<Vec<CaeaAssignment>> {
		let connection = self.connect()?;
		let mut statement = connection.prepare(
			"SELECT
				c.id AS cycle_id,
				c.cuit AS cuit,
				c.periodo AS periodo,
				c.orden AS orden,
				c.caea_code AS caea_code,
				i.pto_vta AS pto_vta,
				i.cbte_tipo AS cbte_tipo,
				COUNT(*) AS invoices_count,
				MIN(i.cbte_nro) AS cbte_from,
				MAX(i.cbte_nro) AS cbte_to,
				SUM(CASE WHEN i.status = 'informed' THEN 1 ELSE 0 END) AS informed_count,
				SUM(CASE WHEN i.status = 'issued_local' THEN 1 ELSE 0 END) AS pending_inform_count,
				SUM(CASE WHEN i.status = 'error' THEN 1 ELSE 0 END) AS error_count
			 FROM caea_invoice i
			 JOIN caea_cycle c ON c.id = i.cycle_id
			 GROUP BY c.id, c.cuit, c.periodo, c.orden, c.caea_code, i.pto_vta, i.cbte_tipo
			 ORDER BY c.periodo DESC, c.orden DESC, i.pto_vta ASC, i.cbte_tipo ASC
			 LIMIT ?1",
		)?;
		let assignments = statement
			.query_map(params![limit], |row| {
				Ok(CaeaAssignment {
					cycle_id: row.get("cycle_id")?,
					cuit: row.get("cuit")?,
					periodo: row.get("periodo")?,
					orden: row.get("orden")?,
					caea_code: row.get("caea_code")?,
					pto_vta: row.get("pto_vta")?,
					cbte_tipo: row.get("cbte_tipo")?,
					invoices_count: row.get("invoices_count")?,
					cbte_from: row.get("cbte_from")?,
					cbte_to: row.get("cbte_to")?,
					informed_count: row.get("informed_count")?,
					pending_inform_count: row.get("pending_inform_count")?,
					error_count: row.get("error_count")?,
				})
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(assignments)
	}
}
