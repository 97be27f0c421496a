use chrono::{DateTime, SecondsFormat, Utc};

/// Wall clock seam so expiry predicates and calendar arithmetic can be tested
/// against a fixed instant.
pub trait Clock: Send + Sync {
	fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_utc(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Canonical timestamp representation for rows and envelopes. Fixed width so
/// the state store can compare timestamps lexicographically.
pub fn utc_iso(dt: DateTime<Utc>) -> String {
	dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn now_iso() -> String {
	utc_iso(Utc::now())
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub struct FixedClock(pub DateTime<Utc>);

	impl Clock for FixedClock {
		fn now_utc(&self) -> DateTime<Utc> {
			self.0
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn iso_timestamps_are_fixed_width_and_sortable() {
		let earlier = Utc.with_ymd_and_hms(2026, 2, 11, 3, 4, 59).unwrap();
		let later = Utc.with_ymd_and_hms(2026, 2, 11, 3, 5, 0).unwrap();

		let a = utc_iso(earlier);
		let b = utc_iso(later);
		assert_eq!(a.len(), b.len());
		assert!(a < b);
		assert_eq!(b, "2026-02-11T03:05:00.000000+00:00");
	}
}
