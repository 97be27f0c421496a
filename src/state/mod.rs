//! Embedded relational state store.
//!
//! Three tables back the resilience engine: `caea_cycle`, `caea_invoice` and
//! `afip_outbox`. Every repository function opens its own connection, runs a
//! single transaction and closes; invoice-number reservation takes the write
//! lock up front with `BEGIN IMMEDIATE` so concurrent reservations serialise.

pub mod models;
pub mod repository;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StateDb {
	path: PathBuf,
}

impl StateDb {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	pub(crate) fn connect(&self) -> Result<Connection> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)
				.with_context(|| format!("Could not create state directory {parent:?}"))?;
		}
		let connection = Connection::open(&self.path)
			.with_context(|| format!("Could not open state database {:?}", self.path))?;
		connection.busy_timeout(BUSY_TIMEOUT).context("Could not set busy timeout")?;
		Ok(connection)
	}

	pub fn init(&self) -> Result<()> {
		let connection = self.connect()?;
		connection
			.execute_batch(
				"CREATE TABLE IF NOT EXISTS caea_cycle (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					cuit INTEGER NOT NULL,
					periodo INTEGER NOT NULL,
					orden INTEGER NOT NULL,
					caea_code TEXT,
					status TEXT NOT NULL,
					created_at TEXT NOT NULL,
					updated_at TEXT NOT NULL,
					last_error TEXT
				);
				CREATE UNIQUE INDEX IF NOT EXISTS ux_caea_cycle
				ON caea_cycle (cuit, periodo, orden);

				CREATE TABLE IF NOT EXISTS caea_invoice (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					cycle_id INTEGER NOT NULL,
					cuit INTEGER NOT NULL,
					pto_vta INTEGER NOT NULL,
					cbte_tipo INTEGER NOT NULL,
					cbte_nro INTEGER NOT NULL,
					payload_json TEXT NOT NULL,
					status TEXT NOT NULL,
					created_at TEXT NOT NULL,
					updated_at TEXT NOT NULL,
					last_error TEXT,
					FOREIGN KEY (cycle_id) REFERENCES caea_cycle(id)
				);
				CREATE UNIQUE INDEX IF NOT EXISTS ux_caea_invoice
				ON caea_invoice (cuit, pto_vta, cbte_tipo, cbte_nro);

				CREATE TABLE IF NOT EXISTS afip_outbox (
					id INTEGER PRIMARY KEY AUTOINCREMENT,
					job_type TEXT NOT NULL,
					idempotency_key TEXT NOT NULL UNIQUE,
					payload_json TEXT NOT NULL,
					status TEXT NOT NULL,
					attempts INTEGER NOT NULL DEFAULT 0,
					next_retry_at TEXT NOT NULL,
					created_at TEXT NOT NULL,
					updated_at TEXT NOT NULL,
					last_error TEXT,
					last_response_json TEXT
				);",
			)
			.context("Could not initialise state schema")?;
		Ok(())
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	/// A fresh on-disk store in a throwaway directory.
	pub fn new_test_db() -> (tempfile::TempDir, StateDb) {
		let dir = tempfile::tempdir().expect("temp dir");
		let db = StateDb::new(dir.path().join("afrelay_state.db"));
		db.init().expect("schema init");
		(dir, db)
	}
}
