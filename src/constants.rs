use std::time::Duration;

// ======= Outbox worker =======

/// Attempts after which an outbox job is parked as failed.
pub const OUTBOX_MAX_ATTEMPTS: i64 = 10;

/// Upper bound for the exponential retry backoff.
pub const OUTBOX_BACKOFF_CAP_SECS: i64 = 3600;

/// Jobs stuck in `processing` longer than this are swept back to `retrying`.
pub const STALE_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Batch size used by the scheduler's outbox tick.
pub const OUTBOX_SCHEDULER_LIMIT: u32 = 30;

/// Cadence of the outbox worker tick.
pub const OUTBOX_TICK: Duration = Duration::from_secs(60);

/// Cadence of the full bootstrap pass (also runs once at startup).
pub const BOOTSTRAP_TICK: Duration = Duration::from_secs(6 * 60 * 60);

/// Batch size used when bootstrap drains the outbox.
pub const OUTBOX_BOOTSTRAP_LIMIT: u32 = 100;

// ======= SOAP gateway =======

/// Total attempts for a SOAP call that fails on transport errors.
pub const SOAP_MAX_ATTEMPTS: u32 = 3;

/// Fixed wait between SOAP retry attempts.
pub const SOAP_RETRY_WAIT: Duration = Duration::from_millis(500);

// ======= WSAA tickets =======

/// Lifetime requested for a login ticket.
pub const TICKET_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Tickets are renewed this many minutes before their expiration by default.
pub const DEFAULT_RENEW_BEFORE_MINUTES: i64 = 15;

// ======= Settings environment variables =======

pub const WSAA_PRODUCTION: &str = "WSAA_PRODUCTION";
pub const WSFE_PRODUCTION: &str = "WSFE_PRODUCTION";
pub const WSPCI_PRODUCTION: &str = "WSPCI_PRODUCTION";

pub const AFRELAY_STATE_DB: &str = "AFRELAY_STATE_DB";

pub const AFIP_TOKEN_WATCHDOG_MINUTES: &str = "AFIP_TOKEN_WATCHDOG_MINUTES";
pub const WSFE_TOKEN_RENEW_BEFORE_MINUTES: &str = "WSFE_TOKEN_RENEW_BEFORE_MINUTES";
pub const WSPCI_TOKEN_RENEW_BEFORE_MINUTES: &str = "WSPCI_TOKEN_RENEW_BEFORE_MINUTES";

pub const CAEA_BOOTSTRAP_CUITS: &str = "CAEA_BOOTSTRAP_CUITS";

pub const OBS_MAX_LOGS: &str = "OBS_MAX_LOGS";
pub const OBS_MAX_EVENTS: &str = "OBS_MAX_EVENTS";

pub const JWT_SECRET_KEY: &str = "JWT_SECRET_KEY";
