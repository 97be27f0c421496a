//! Cycle preallocation.
//!
//! Bootstrap keeps the current and next half-month cycles present for every
//! configured CUIT, repairs the `active ⇔ has code` invariant, and drains the
//! outbox so freshly queued solicitations go out immediately.

use serde::Serialize;

use crate::{
	constants::OUTBOX_BOOTSTRAP_LIMIT,
	state::models::{JobStatus, JobType},
};

use super::{calendar::resolve_current_and_next_cycles, outbox::OutboxCounters, CaeaEngine};

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BootstrapCounts {
	pub ensured: usize,
	pub queued: usize,
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BootstrapSummary {
	pub processed_cuits: usize,
	pub ensured_cycles: usize,
	pub queued_jobs: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BootstrapOutcome {
	Skipped { reason: &'static str },
	Ok { summary: BootstrapSummary, outbox: OutboxCounters },
}

/// Parses the comma-separated CUIT list, dropping (and logging) junk entries.
pub fn configured_cuits(raw: &str) -> Vec<i64> {
	raw.split(',')
		.map(str::trim)
		.filter(|piece| !piece.is_empty())
		.filter_map(|piece| match piece.parse::<i64>() {
			Ok(cuit) => Some(cuit),
			Err(_) => {
				tracing::warn!("Ignoring invalid CUIT in bootstrap list: {piece}");
				None
			},
		})
		.collect()
}

impl CaeaEngine {
	/// Ensures both tracked cycles exist for `cuit` and queues a solicit for
	/// each one that is not already active with a code. Idempotent: existing
	/// cycles and live jobs are left untouched.
	pub fn bootstrap_cuit_cycles(&self, cuit: i64) -> anyhow::Result<BootstrapCounts> {
		let mut counts = BootstrapCounts::default();
		for (periodo, orden) in resolve_current_and_next_cycles(self.clock().now_utc()) {
			let cycle = self.db().create_cycle(cuit, periodo, orden)?;
			counts.ensured += 1;
			if cycle.is_usable() {
				continue;
			}
			let job = self.db().add_outbox_job(
				JobType::SolicitCaea,
				&super::solicit_key(cuit, periodo, orden),
				&serde_json::json!({
					"cycle_id": cycle.id,
					"cycle": {"Cuit": cuit, "Periodo": periodo, "Orden": orden},
				}),
			)?;
			if matches!(
				job.status,
				JobStatus::Pending | JobStatus::Retrying | JobStatus::Processing
			) {
				counts.queued += 1;
			}
		}
		Ok(counts)
	}

	/// One full bootstrap pass: normalise statuses, preallocate cycles for
	/// every configured CUIT, then drain the outbox.
	pub async fn bootstrap_caea_cycles_once(&self) -> anyhow::Result<BootstrapOutcome> {
		self.db().init()?;
		let demoted = self.db().normalize_cycle_statuses()?;
		if demoted > 0 {
			tracing::warn!(demoted, "Demoted active cycles without a CAEA code");
		}

		let cuits = configured_cuits(self.bootstrap_cuits());
		if cuits.is_empty() {
			tracing::info!("CAEA bootstrap skipped: no bootstrap CUITs configured");
			return Ok(BootstrapOutcome::Skipped { reason: "no_cuits" });
		}

		let mut summary = BootstrapSummary::default();
		for cuit in cuits {
			let counts = self.bootstrap_cuit_cycles(cuit)?;
			summary.processed_cuits += 1;
			summary.ensured_cycles += counts.ensured;
			summary.queued_jobs += counts.queued;
		}

		let outbox = self.process_pending_outbox_jobs(OUTBOX_BOOTSTRAP_LIMIT).await?;
		tracing::info!(
			cuits = summary.processed_cuits,
			ensured = summary.ensured_cycles,
			queued = summary.queued_jobs,
			outbox_done = outbox.done,
			"CAEA bootstrap done"
		);
		Ok(BootstrapOutcome::Ok { summary, outbox })
	}
}

#[cfg(test)]
mod tests {
	use chrono::{TimeZone, Utc};
	use serde_json::json;

	use super::*;
	use crate::{
		caea::test_utils::engine_at,
		soap::wsfe::test_utils::caea_granted_body,
		state::models::CycleStatus,
	};

	#[test]
	fn cuit_list_parsing_drops_junk() {
		assert_eq!(configured_cuits(""), Vec::<i64>::new());
		assert_eq!(
			configured_cuits("30740253022, 20111111112 ,,abc"),
			vec![30740253022, 20111111112]
		);
	}

	#[tokio::test]
	async fn bootstrap_without_cuits_is_skipped() {
		let harness = engine_at(vec![], Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(), "");
		let outcome = harness.engine.bootstrap_caea_cycles_once().await.unwrap();
		assert!(matches!(outcome, BootstrapOutcome::Skipped { reason: "no_cuits" }));
	}

	#[tokio::test]
	async fn bootstrap_preallocates_both_windows_and_is_idempotent() {
		let harness = engine_at(
			// Both solicits fail over the network; the cycles stay queued.
			(0..12).map(|_| Err(crate::soap::SoapCallError::Network("down".into()))).collect(),
			Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(),
			"30740253022",
		);
		let engine = &harness.engine;

		let counts = engine.bootstrap_cuit_cycles(30740253022).unwrap();
		assert_eq!(counts, BootstrapCounts { ensured: 2, queued: 2 });

		assert!(engine.db().get_cycle(30740253022, 202602, 1).unwrap().is_some());
		assert!(engine.db().get_cycle(30740253022, 202602, 2).unwrap().is_some());

		// Second run: same cycles, no duplicate jobs.
		let counts = engine.bootstrap_cuit_cycles(30740253022).unwrap();
		assert_eq!(counts, BootstrapCounts { ensured: 2, queued: 2 });
		assert_eq!(engine.db().list_outbox(None, 10).unwrap().len(), 2);
	}

	#[tokio::test]
	async fn bootstrap_skips_active_cycles() {
		let harness = engine_at(
			vec![Ok(caea_granted_body("61234567890123"))],
			Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(),
			"30740253022",
		);
		let engine = &harness.engine;

		let (cycle, _) = engine.queue_solicit(30740253022, 202602, 1).unwrap();
		engine
			.db()
			.update_cycle_from_afip(cycle.id, &json!({"ResultGet": {"CAEA": "61234567890123"}}))
			.unwrap();
		// The already-satisfied solicit job is parked done.
		let job = &engine.db().list_outbox(None, 10).unwrap()[0];
		engine.db().mark_outbox_done(job.id, &json!({})).unwrap();

		let counts = engine.bootstrap_cuit_cycles(30740253022).unwrap();
		// Active first half is skipped; only the second half queues.
		assert_eq!(counts, BootstrapCounts { ensured: 2, queued: 1 });
	}

	#[tokio::test]
	async fn full_bootstrap_normalises_then_drains() {
		let harness = engine_at(
			vec![
				Ok(caea_granted_body("61234567890123")),
				Ok(caea_granted_body("61234567890124")),
			],
			Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(),
			"30740253022",
		);
		let engine = &harness.engine;

		// A corrupted row: active without code. Bootstrap must repair it.
		let (broken, _) = engine.queue_solicit(30740253022, 202602, 1).unwrap();
		engine.db().set_cycle_status(broken.id, CycleStatus::Active, None).unwrap();

		let outcome = engine.bootstrap_caea_cycles_once().await.unwrap();
		let BootstrapOutcome::Ok { summary, outbox } = outcome else {
			panic!("expected full bootstrap run");
		};
		assert_eq!(summary.processed_cuits, 1);
		assert_eq!(summary.ensured_cycles, 2);
		assert_eq!(outbox.done, 2);

		let repaired = engine.db().get_cycle_by_id(broken.id).unwrap().unwrap();
		assert_eq!(repaired.status, CycleStatus::Active);
		assert_eq!(repaired.caea_code.as_deref(), Some("61234567890123"));
	}
}
