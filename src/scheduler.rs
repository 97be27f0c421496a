//! Periodic driver for the background jobs: ticket watchdogs, the outbox
//! worker and cycle bootstrap.
//!
//! Each job runs in its own task and executes inline on its tick, so at most
//! one instance of a job is ever in flight; `MissedTickBehavior::Delay`
//! collapses missed ticks into one. Dropping the returned handles (or the
//! runtime shutting down) cancels every job.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
	caea::CaeaEngine,
	constants::{BOOTSTRAP_TICK, OUTBOX_SCHEDULER_LIMIT, OUTBOX_TICK},
	wsaa::TicketKeeper,
};

pub fn make_periodic_tick(period: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let start = tokio::time::Instant::now() +
		if yield_immediately { Duration::ZERO } else { period };
	let mut interval = tokio::time::interval_at(start, period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval
}

pub struct Scheduler {
	pub engine: Arc<CaeaEngine>,
	pub wsfe_tickets: Arc<TicketKeeper>,
	pub wspci_tickets: Arc<TicketKeeper>,
	pub watchdog_period: Duration,
}

impl Scheduler {
	/// Spawns all periodic jobs. Every job also fires once immediately, so a
	/// restart converges without waiting a full period.
	pub fn spawn(self) -> Vec<JoinHandle<()>> {
		vec![
			spawn_token_watchdog(self.wsfe_tickets, self.watchdog_period),
			spawn_token_watchdog(self.wspci_tickets, self.watchdog_period),
			spawn_outbox_worker(self.engine.clone()),
			spawn_bootstrap(self.engine),
		]
	}
}

fn spawn_token_watchdog(tickets: Arc<TicketKeeper>, period: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = make_periodic_tick(period, true);
		loop {
			tick.tick().await;
			tracing::info!("Verifying {} token expiration", tickets.label());
			if !tickets.needs_renewal() {
				tracing::info!("{} token still valid and not expiring soon", tickets.label());
				continue;
			}
			let envelope = tickets.renew().await;
			if envelope.is_success() {
				tracing::info!("{} token generated successfully", tickets.label());
			} else {
				tracing::warn!("Couldn't generate {} token by scheduler", tickets.label());
			}
		}
	})
}

fn spawn_outbox_worker(engine: Arc<CaeaEngine>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = make_periodic_tick(OUTBOX_TICK, true);
		loop {
			tick.tick().await;
			match engine.process_pending_outbox_jobs(OUTBOX_SCHEDULER_LIMIT).await {
				Ok(counters) => tracing::info!(
					processed = counters.processed,
					done = counters.done,
					retried = counters.retried,
					failed = counters.failed,
					"CAEA outbox tick finished"
				),
				Err(error) => tracing::error!("CAEA outbox tick failed: {error:#}"),
			}
		}
	})
}

fn spawn_bootstrap(engine: Arc<CaeaEngine>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = make_periodic_tick(BOOTSTRAP_TICK, true);
		loop {
			tick.tick().await;
			if let Err(error) = engine.bootstrap_caea_cycles_once().await {
				tracing::error!("CAEA bootstrap tick failed: {error:#}");
			}
		}
	})
}
