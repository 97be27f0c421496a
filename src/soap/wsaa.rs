use std::sync::Arc;

use serde_json::Value;

use crate::observability::Observability;

use super::{
	envelope::{SoapCallError, SoapEnvelope},
	gateway::consult_afip,
	transport::SoapTransport,
	xml,
};

pub const WSAA_NAMESPACE: &str = "http://wsaa.view.sua.dvadac.desein.afip.gov";

/// WSAA authentication endpoint. Its single operation exchanges a signed CMS
/// for a login ticket.
#[derive(Clone)]
pub struct WsaaClient {
	transport: Arc<dyn SoapTransport>,
	endpoint: String,
	obs: Observability,
}

impl WsaaClient {
	pub fn new(transport: Arc<dyn SoapTransport>, endpoint: String, obs: Observability) -> Self {
		Self { transport, endpoint, obs }
	}

	/// `LoginCms`: submits the base64 CMS and returns the raw
	/// `loginTicketResponse` XML as the envelope response.
	pub async fn login_cms(&self, b64_cms: &str) -> SoapEnvelope {
		tracing::info!("Starting CMS login request to AFIP");

		let cms = Value::String(b64_cms.to_string());
		let request_xml = xml::encode_request("loginCms", WSAA_NAMESPACE, &[("in0", &cms)]);

		consult_afip(&self.obs, "wsaa", "loginCms", || async {
			let body = self.transport.call(&self.endpoint, "", request_xml.clone()).await?;
			let document = xml::decode_document(&body)?;
			xml::check_fault(&document)?;
			let response = xml::extract_response_element(&document, "loginCmsResponse")?;
			response.get("loginCmsReturn").cloned().ok_or_else(|| {
				SoapCallError::InvalidResponse("Missing loginCmsReturn element".to_string())
			})
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		observability::test_utils::new_test_observability,
		soap::transport::test_utils::ScriptedTransport,
	};

	fn login_cms_response_body(ticket_xml: &str) -> String {
		let escaped = ticket_xml.replace('<', "&lt;").replace('>', "&gt;");
		format!(
			"<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
			<soapenv:Body><loginCmsResponse xmlns=\"{WSAA_NAMESPACE}\">\
			<loginCmsReturn>{escaped}</loginCmsReturn>\
			</loginCmsResponse></soapenv:Body></soapenv:Envelope>"
		)
	}

	#[tokio::test]
	async fn login_cms_returns_inner_ticket_xml() {
		let ticket = "<loginTicketResponse><credentials><token>abc</token>\
			<sign>def</sign></credentials></loginTicketResponse>";
		let transport = Arc::new(ScriptedTransport::new(vec![Ok(login_cms_response_body(
			ticket,
		))]));
		let client = WsaaClient::new(
			transport.clone(),
			"https://wsaahomo.invalid/ws/services/LoginCms".to_string(),
			new_test_observability(),
		);

		let envelope = client.login_cms("bACsDEf==").await;
		assert_eq!(envelope.response().unwrap(), &Value::String(ticket.to_string()));

		let (_, sent) = transport.calls.lock().unwrap()[0].clone();
		assert!(sent.contains("<in0>bACsDEf==</in0>"));
	}

	#[tokio::test]
	async fn login_cms_fault_surfaces_as_soap_fault() {
		let fault = "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
			<soapenv:Body><soapenv:Fault><faultcode>ns1:cms.expired</faultcode>\
			<faultstring>CMS expired</faultstring></soapenv:Fault></soapenv:Body>\
			</soapenv:Envelope>";
		let transport =
			Arc::new(ScriptedTransport::new(vec![Ok(fault.to_string())]));
		let client = WsaaClient::new(
			transport,
			"https://wsaahomo.invalid/ws/services/LoginCms".to_string(),
			new_test_observability(),
		);

		let envelope = client.login_cms("AAAA").await;
		let error = envelope.error().unwrap();
		assert_eq!(error.error_type, "SOAPFault");
		assert!(error.detail.contains("CMS expired"));
	}
}
