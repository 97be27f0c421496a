use std::sync::Arc;

use serde_json::{json, Value};

use crate::observability::Observability;

use super::{
	envelope::{SoapCallError, SoapEnvelope},
	gateway::consult_afip,
	transport::SoapTransport,
	xml,
};

pub const WSPCI_NAMESPACE: &str = "http://a5.soap.ws.server.puc.sr/";

/// Taxpayer registry (padrón A5) operations.
#[derive(Clone)]
pub struct WspciClient {
	transport: Arc<dyn SoapTransport>,
	endpoint: String,
	obs: Observability,
}

impl WspciClient {
	pub fn new(transport: Arc<dyn SoapTransport>, endpoint: String, obs: Observability) -> Self {
		Self { transport, endpoint, obs }
	}

	async fn request(
		&self,
		method: &'static str,
		result_tag: &'static str,
		params: Vec<(&'static str, Value)>,
	) -> SoapEnvelope {
		let borrowed = params.iter().map(|(name, value)| (*name, value)).collect::<Vec<_>>();
		let request_xml = xml::encode_request(method, WSPCI_NAMESPACE, &borrowed);
		let response_tag = format!("{method}Response");

		consult_afip(&self.obs, "wspci", method, || async {
			let body = self.transport.call(&self.endpoint, "", request_xml.clone()).await?;
			let document = xml::decode_document(&body)?;
			xml::check_fault(&document)?;
			let response = xml::extract_response_element(&document, &response_tag)?;
			response.get(result_tag).cloned().ok_or_else(|| {
				SoapCallError::InvalidResponse(format!("Missing {result_tag} element"))
			})
		})
		.await
	}

	pub async fn get_persona(
		&self,
		token: &str,
		sign: &str,
		cuit_representada: i64,
		id_persona: i64,
	) -> SoapEnvelope {
		tracing::info!(id_persona, "Querying persona data");
		self.request(
			"getPersona",
			"personaReturn",
			vec![
				("token", json!(token)),
				("sign", json!(sign)),
				("cuitRepresentada", json!(cuit_representada)),
				("idPersona", json!(id_persona)),
			],
		)
		.await
	}

	pub async fn dummy(&self) -> SoapEnvelope {
		self.request("dummy", "return", Vec::new()).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		observability::test_utils::new_test_observability,
		soap::transport::test_utils::ScriptedTransport,
	};

	#[tokio::test]
	async fn get_persona_parses_persona_return() {
		let body = format!(
			"<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
			<soap:Body><ns2:getPersonaResponse xmlns:ns2=\"{WSPCI_NAMESPACE}\">\
			<personaReturn><persona><idPersona>20111111112</idPersona>\
			<tipoPersona>FISICA</tipoPersona></persona></personaReturn>\
			</ns2:getPersonaResponse></soap:Body></soap:Envelope>"
		);
		let transport = Arc::new(ScriptedTransport::new(vec![Ok(body)]));
		let client = WspciClient::new(
			transport.clone(),
			"https://wspcihomo.invalid/personaServiceA5".to_string(),
			new_test_observability(),
		);

		let envelope = client.get_persona("tkn", "sgn", 30740253022, 20111111112).await;
		let response = envelope.response().unwrap();
		assert_eq!(response["persona"]["tipoPersona"], json!("FISICA"));

		let (_, sent) = transport.calls.lock().unwrap()[0].clone();
		assert!(sent.contains("<cuitRepresentada>30740253022</cuitRepresentada>"));
		assert!(sent.contains("<idPersona>20111111112</idPersona>"));
	}
}
