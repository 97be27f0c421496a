use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use openssl::{cms::CMSOptions, cms::CmsContentInfo, pkey::PKey, x509::X509};
use serde_json::Value;

use crate::{
	clock::Clock,
	settings::Settings,
	sntp::{SntpClient, TicketTimes},
	soap::{
		envelope::{SoapCallError, SoapEnvelope},
		wsaa::WsaaClient,
		xml,
	},
};

/// Source of trusted timestamps for ticket requests.
#[async_trait]
pub trait TimeSource: Send + Sync {
	async fn ticket_times(&self) -> Result<TicketTimes>;
}

#[async_trait]
impl TimeSource for SntpClient {
	async fn ticket_times(&self) -> Result<TicketTimes> {
		SntpClient::ticket_times(self).await
	}
}

/// Parsed `loginTicketResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTicket {
	pub token: String,
	pub sign: String,
	pub generation_time: String,
	pub expiration_time: String,
}

pub fn build_login_ticket_request(service: &str, times: &TicketTimes) -> String {
	format!(
		"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
		<loginTicketRequest version=\"1.0\">\
		<header>\
		<uniqueId>{}</uniqueId>\
		<generationTime>{}</generationTime>\
		<expirationTime>{}</expirationTime>\
		</header>\
		<service>{service}</service>\
		</loginTicketRequest>",
		times.unique_id, times.generation_time, times.expiration_time
	)
}

fn text_of(value: &Value) -> Option<String> {
	match value {
		Value::String(text) => Some(text.clone()),
		Value::Number(number) => Some(number.to_string()),
		_ => None,
	}
}

pub fn parse_login_ticket_response(ticket_xml: &str) -> Result<LoginTicket> {
	let document = xml::decode_document(ticket_xml)
		.map_err(|error| anyhow!("Could not parse loginTicketResponse: {error}"))?;
	let response = document
		.get("loginTicketResponse")
		.ok_or_else(|| anyhow!("Missing loginTicketResponse element"))?;

	let field = |section: &str, name: &str| -> Result<String> {
		response
			.get(section)
			.and_then(|s| s.get(name))
			.and_then(text_of)
			.ok_or_else(|| anyhow!("Missing {section}/{name} in loginTicketResponse"))
	};

	Ok(LoginTicket {
		token: field("credentials", "token")?,
		sign: field("credentials", "sign")?,
		generation_time: field("header", "generationTime")?,
		expiration_time: field("header", "expirationTime")?,
	})
}

/// Reads `<expirationTime>` out of a stored `loginTicketResponse` document.
pub fn read_expiration(ticket_xml: &str) -> Result<DateTime<Utc>> {
	let document = xml::decode_document(ticket_xml)
		.map_err(|error| anyhow!("Could not parse ticket file: {error}"))?;
	let expiration = document
		.get("loginTicketResponse")
		.and_then(|response| response.get("header"))
		.and_then(|header| header.get("expirationTime"))
		.and_then(Value::as_str)
		.context("missing_expiration_time")?;
	DateTime::parse_from_rfc3339(expiration)
		.map(|parsed| parsed.with_timezone(&Utc))
		.with_context(|| format!("Unparseable expirationTime: {expiration}"))
}

pub fn is_expired(path: &Path, clock: &dyn Clock) -> Result<bool> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("Could not read ticket file {path:?}"))?;
	Ok(clock.now_utc() >= read_expiration(&contents)?)
}

pub fn is_expiring_soon(
	path: &Path,
	clock: &dyn Clock,
	renew_before_minutes: i64,
) -> Result<bool> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("Could not read ticket file {path:?}"))?;
	let expiration = read_expiration(&contents)?;
	Ok(expiration - clock.now_utc() <= Duration::minutes(renew_before_minutes))
}

fn sign_cms(payload: &[u8], cert_file: &Path, key_file: &Path) -> Result<Vec<u8>> {
	let cert = X509::from_pem(
		&std::fs::read(cert_file)
			.with_context(|| format!("Could not read certificate {cert_file:?}"))?,
	)
	.context("Invalid taxpayer certificate")?;
	let key = PKey::private_key_from_pem(
		&std::fs::read(key_file)
			.with_context(|| format!("Could not read private key {key_file:?}"))?,
	)
	.context("Invalid private key")?;

	// Attached signature (not detached), DER output, as WSAA requires.
	let cms = CmsContentInfo::sign(Some(&cert), Some(&key), None, Some(payload), CMSOptions::BINARY)
		.context("CMS signing failed")?;
	cms.to_der().context("CMS DER encoding failed")
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.with_context(|| format!("Could not create directory {parent:?}"))?;
	}
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, contents).with_context(|| format!("Could not write {tmp:?}"))?;
	std::fs::rename(&tmp, path).with_context(|| format!("Could not replace {path:?}"))?;
	Ok(())
}

/// Manages the signed ticket for one AFIP service.
pub struct TicketKeeper {
	/// `<service>` value inside the ticket request.
	service_name: &'static str,
	/// Short label used for logs.
	label: &'static str,
	request_file: PathBuf,
	response_file: PathBuf,
	cms_file: PathBuf,
	cert_file: PathBuf,
	key_file: PathBuf,
	renew_before_minutes: i64,
	wsaa: WsaaClient,
	time_source: Arc<dyn TimeSource>,
	clock: Arc<dyn Clock>,
}

impl TicketKeeper {
	pub fn wsfe(
		settings: &Settings,
		wsaa: WsaaClient,
		time_source: Arc<dyn TimeSource>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let files = &settings.wsaa;
		Self {
			service_name: "wsfe",
			label: "wsfe",
			request_file: files.xml_dir.join("loginTicketRequest.xml"),
			response_file: files.xml_dir.join("loginTicketResponse.xml"),
			cms_file: files.crypto_dir.join("loginTicketRequest.xml.cms"),
			cert_file: files.cert_file.clone(),
			key_file: files.key_file.clone(),
			renew_before_minutes: settings.scheduler.wsfe_renew_before_minutes,
			wsaa,
			time_source,
			clock,
		}
	}

	pub fn wspci(
		settings: &Settings,
		wsaa: WsaaClient,
		time_source: Arc<dyn TimeSource>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let files = &settings.wsaa;
		Self {
			service_name: "ws_sr_padron_a5",
			label: "wspci",
			request_file: files.xml_dir.join("wspci_loginTicketRequest.xml"),
			response_file: files.xml_dir.join("wspci_loginTicketResponse.xml"),
			cms_file: files.crypto_dir.join("wspci_loginTicketRequest.xml.cms"),
			cert_file: files.cert_file.clone(),
			key_file: files.key_file.clone(),
			renew_before_minutes: settings.scheduler.wspci_renew_before_minutes,
			wsaa,
			time_source,
			clock,
		}
	}

	pub fn label(&self) -> &'static str {
		self.label
	}

	pub fn response_file(&self) -> &Path {
		&self.response_file
	}

	/// True when no usable ticket is on disk: missing, unreadable, or inside
	/// the renew window.
	pub fn needs_renewal(&self) -> bool {
		if !self.response_file.is_file() {
			return true;
		}
		is_expiring_soon(&self.response_file, self.clock.as_ref(), self.renew_before_minutes)
			.unwrap_or(true)
	}

	/// Credentials from the stored ticket, without touching the network.
	pub fn credentials(&self) -> Result<(String, String)> {
		let contents = std::fs::read_to_string(&self.response_file).with_context(|| {
			format!("No stored {} ticket at {:?}", self.label, self.response_file)
		})?;
		let ticket = parse_login_ticket_response(&contents)?;
		Ok((ticket.token, ticket.sign))
	}

	/// Returns a non-expiring `(token, sign)` pair, renewing first if needed.
	pub async fn ensure_ticket(&self) -> Result<(String, String)> {
		if self.needs_renewal() {
			let envelope = self.renew().await;
			if let Some(error) = envelope.error() {
				return Err(anyhow!(
					"Could not renew {} ticket: {} ({})",
					self.label,
					error.detail,
					error.error_type
				));
			}
		}
		self.credentials()
	}

	/// Runs the LoginCms protocol end to end. Failures never leave a partial
	/// ticket behind: the stored response is replaced only after the new one
	/// parses.
	pub async fn renew(&self) -> SoapEnvelope {
		match self.renew_inner().await {
			Ok(envelope) => envelope,
			Err(error) => {
				tracing::error!("{} ticket renewal failed: {error:#}", self.label);
				SoapEnvelope::failure(
					"loginCms",
					&SoapCallError::Unknown(format!("{error:#}")),
				)
			},
		}
	}

	async fn renew_inner(&self) -> Result<SoapEnvelope> {
		let times = self.time_source.ticket_times().await.context("NTP timestamp failed")?;
		let request_xml = build_login_ticket_request(self.service_name, &times);
		write_atomic(&self.request_file, &request_xml)?;

		let der = sign_cms(request_xml.as_bytes(), &self.cert_file, &self.key_file)?;
		if let Some(parent) = self.cms_file.parent() {
			std::fs::create_dir_all(parent)
				.with_context(|| format!("Could not create directory {parent:?}"))?;
		}
		std::fs::write(&self.cms_file, &der)
			.with_context(|| format!("Could not write {:?}", self.cms_file))?;

		let b64_cms = base64::engine::general_purpose::STANDARD.encode(&der);
		let envelope = self.wsaa.login_cms(&b64_cms).await;

		if let Some(ticket_xml) = envelope.response().and_then(Value::as_str) {
			// Validate before persisting: a response that does not parse must
			// not replace a still-working ticket.
			let ticket = parse_login_ticket_response(ticket_xml)?;
			write_atomic(&self.response_file, ticket_xml)?;
			tracing::info!(
				expiration = %ticket.expiration_time,
				"{} ticket renewed",
				self.label
			);
		}
		Ok(envelope)
	}
}

#[cfg(test)]
pub mod test_utils {
	use std::path::Path;

	use openssl::{
		asn1::Asn1Time, hash::MessageDigest, nid::Nid, pkey::PKey, rsa::Rsa,
		x509::X509NameBuilder, x509::X509,
	};

	use super::*;

	pub struct FixedTimeSource(pub TicketTimes);

	#[async_trait]
	impl TimeSource for FixedTimeSource {
		async fn ticket_times(&self) -> Result<TicketTimes> {
			Ok(self.0.clone())
		}
	}

	pub fn test_ticket_times() -> TicketTimes {
		TicketTimes {
			unique_id: 1767764408,
			generation_time: "2026-01-07T05:40:08Z".to_string(),
			expiration_time: "2026-01-07T05:50:08Z".to_string(),
		}
	}

	/// Writes a throwaway self-signed identity, mirroring what AFIP's
	/// homologation environment accepts for signing tests.
	pub fn write_test_identity(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
		let rsa = Rsa::generate(2048).unwrap();
		let key = PKey::from_rsa(rsa).unwrap();

		let mut name = X509NameBuilder::new().unwrap();
		name.append_entry_by_nid(Nid::COMMONNAME, "afrelay-test").unwrap();
		let name = name.build();

		let mut builder = X509::builder().unwrap();
		builder.set_version(2).unwrap();
		builder.set_subject_name(&name).unwrap();
		builder.set_issuer_name(&name).unwrap();
		builder.set_pubkey(&key).unwrap();
		builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
		builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
		builder.sign(&key, MessageDigest::sha256()).unwrap();
		let cert = builder.build();

		let cert_file = dir.join("returned_certificate.pem");
		let key_file = dir.join("PrivateKey.key");
		std::fs::write(&cert_file, cert.to_pem().unwrap()).unwrap();
		std::fs::write(&key_file, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
		(cert_file, key_file)
	}

	pub fn ticket_response_xml(expiration: &str) -> String {
		format!(
			"<loginTicketResponse version=\"1.0\">\
			<header><source>CN=wsaahomo</source><destination>CN=afrelay</destination>\
			<uniqueId>1767764408</uniqueId>\
			<generationTime>2026-01-07T05:40:08-03:00</generationTime>\
			<expirationTime>{expiration}</expirationTime></header>\
			<credentials><token>dG9rZW4=</token><sign>c2lnbg==</sign></credentials>\
			</loginTicketResponse>"
		)
	}
}
