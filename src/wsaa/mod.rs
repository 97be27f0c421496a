//! WSAA login ticket lifecycle.
//!
//! AFIP allows one valid ticket per `(CUIT, service)` window: renewing too
//! often gets rejected, renewing too late fails every in-flight call. The
//! keeper renews inside a configurable window before expiry and persists the
//! response atomically so readers never observe a torn file.

pub mod ticket;

pub use ticket::{TicketKeeper, TimeSource};
