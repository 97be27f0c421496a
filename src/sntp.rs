//! Minimal SNTP client for AFIP's time service.
//!
//! WSAA rejects login tickets whose timestamps drift from AFIP's clock, so
//! ticket times are sourced from `time.afip.gov.ar` rather than the local
//! wall clock.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::net::UdpSocket;

use crate::constants::TICKET_LIFETIME;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamps for one `loginTicketRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketTimes {
	pub unique_id: i64,
	pub generation_time: String,
	pub expiration_time: String,
}

pub fn ticket_times_from(now: DateTime<Utc>) -> TicketTimes {
	let expiration = now + chrono::Duration::from_std(TICKET_LIFETIME).expect("fits in chrono");
	TicketTimes {
		unique_id: now.timestamp(),
		generation_time: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
		expiration_time: expiration.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
	}
}

#[derive(Clone, Debug)]
pub struct SntpClient {
	server: String,
}

impl SntpClient {
	pub fn new(server: impl Into<String>) -> Self {
		Self { server: server.into() }
	}

	pub fn server(&self) -> &str {
		&self.server
	}

	/// Sends a single client-mode SNTP packet and reads the transmit
	/// timestamp out of the reply.
	pub async fn query(&self) -> Result<DateTime<Utc>> {
		let socket = UdpSocket::bind("0.0.0.0:0").await.context("Could not bind UDP socket")?;
		socket
			.connect(&self.server)
			.await
			.with_context(|| format!("Could not reach NTP server {}", self.server))?;

		// LI = 0, VN = 3, Mode = 3 (client).
		let mut packet = [0u8; 48];
		packet[0] = 0x1B;
		socket.send(&packet).await.context("Could not send NTP request")?;

		let mut response = [0u8; 48];
		let received = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut response))
			.await
			.map_err(|_| anyhow!("NTP request to {} timed out", self.server))?
			.context("Could not read NTP response")?;
		if received < 48 {
			return Err(anyhow!("Short NTP response: {received} bytes"));
		}

		// Transmit timestamp: seconds since 1900 at offset 40.
		let seconds = u32::from_be_bytes(response[40..44].try_into().expect("4 bytes")) as u64;
		let unix = seconds
			.checked_sub(NTP_UNIX_OFFSET)
			.ok_or_else(|| anyhow!("NTP response predates the Unix epoch"))?;

		Utc.timestamp_opt(unix as i64, 0)
			.single()
			.ok_or_else(|| anyhow!("NTP response carried an invalid timestamp"))
	}

	pub async fn ticket_times(&self) -> Result<TicketTimes> {
		let now = self.query().await?;
		tracing::debug!(
			unique_id = now.timestamp(),
			"Resolved ticket timestamps from {}",
			self.server
		);
		Ok(ticket_times_from(now))
	}

	/// Readiness probe: AFIP operations are pointless if the time source is
	/// down, since every new ticket needs it.
	pub async fn is_reachable(&self) -> bool {
		match self.query().await {
			Ok(_) => true,
			Err(error) => {
				tracing::warn!("NTP readiness check failed: {error:#}");
				false
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ticket_times_span_ten_minutes() {
		let now = Utc.with_ymd_and_hms(2026, 1, 7, 5, 40, 8).unwrap();
		let times = ticket_times_from(now);

		assert_eq!(times.unique_id, 1767764408);
		assert_eq!(times.generation_time, "2026-01-07T05:40:08Z");
		assert_eq!(times.expiration_time, "2026-01-07T05:50:08Z");
	}

	#[tokio::test]
	async fn query_against_local_mock_server() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().unwrap();

		tokio::spawn(async move {
			let mut buf = [0u8; 48];
			let (_, peer) = server.recv_from(&mut buf).await.unwrap();
			let mut reply = [0u8; 48];
			reply[0] = 0x1C; // LI = 0, VN = 3, Mode = 4 (server)
			let ntp_seconds = (1767764408u64 + NTP_UNIX_OFFSET) as u32;
			reply[40..44].copy_from_slice(&ntp_seconds.to_be_bytes());
			server.send_to(&reply, peer).await.unwrap();
		});

		let client = SntpClient::new(addr.to_string());
		let stamp = client.query().await.unwrap();
		assert_eq!(stamp.timestamp(), 1767764408);
	}
}
