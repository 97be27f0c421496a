use std::time::Duration;

use async_trait::async_trait;

use super::envelope::SoapCallError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one SOAP POST. Components hold this behind an `Arc` handed to
/// them at startup, so tests swap in scripted transports and no process-wide
/// client state exists.
#[async_trait]
pub trait SoapTransport: Send + Sync {
	async fn call(
		&self,
		endpoint: &str,
		soap_action: &str,
		body: String,
	) -> Result<String, SoapCallError>;
}

pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	pub fn new() -> Result<Self, SoapCallError> {
		let client = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.map_err(|error| SoapCallError::Unknown(error.to_string()))?;
		Ok(Self { client })
	}
}

fn classify_request_error(error: reqwest::Error) -> SoapCallError {
	if error.is_connect() || error.is_timeout() {
		SoapCallError::Network(error.to_string())
	} else {
		SoapCallError::Http(error.to_string())
	}
}

#[async_trait]
impl SoapTransport for HttpTransport {
	async fn call(
		&self,
		endpoint: &str,
		soap_action: &str,
		body: String,
	) -> Result<String, SoapCallError> {
		let response = self
			.client
			.post(endpoint)
			.header("Content-Type", "text/xml; charset=utf-8")
			.header("SOAPAction", format!("\"{soap_action}\""))
			.body(body)
			.send()
			.await
			.map_err(classify_request_error)?;

		let status = response.status();
		let text = response.text().await.map_err(classify_request_error)?;

		// AFIP delivers SOAP faults with a 500 status; hand those bodies back
		// so the decoder can surface the fault instead of a bare HTTP error.
		if !status.is_success() && !text.trim_start().starts_with('<') {
			return Err(SoapCallError::Http(format!("HTTP {status}: {text}")));
		}

		Ok(text)
	}
}
