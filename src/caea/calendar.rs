//! CAEA period/order arithmetic.
//!
//! CAEA windows are half-months in Argentina local time (UTC-3, no DST). The
//! engine keeps the running window and the next one preallocated.

use chrono::{DateTime, Datelike, FixedOffset, Utc};

pub fn ar_tz() -> FixedOffset {
	FixedOffset::west_opt(3 * 3600).expect("UTC-3 is a valid offset")
}

fn month_roll(year: i32, month: u32) -> (i32, u32) {
	if month == 12 {
		(year + 1, 1)
	} else {
		(year, month + 1)
	}
}

/// The two `(periodo, orden)` windows that must be held ready at `now`:
/// the current half-month and the one after it.
pub fn resolve_current_and_next_cycles(now: DateTime<Utc>) -> [(i64, i64); 2] {
	let local = now.with_timezone(&ar_tz());
	let periodo = (local.year() as i64) * 100 + local.month() as i64;

	if local.day() <= 15 {
		return [(periodo, 1), (periodo, 2)];
	}

	let (next_year, next_month) = month_roll(local.year(), local.month());
	let next_periodo = (next_year as i64) * 100 + next_month as i64;
	[(periodo, 2), (next_periodo, 1)]
}
