use std::sync::Arc;

use serde_json::{json, Value};

use crate::observability::Observability;

use super::{
	envelope::{SoapCallError, SoapEnvelope},
	gateway::consult_afip,
	transport::SoapTransport,
	xml,
};

pub const WSFE_NAMESPACE: &str = "http://ar.gov.afip.dif.FEV1/";

/// Credentials attached to every authenticated WSFE operation.
#[derive(Debug, Clone)]
pub struct Auth {
	pub token: String,
	pub sign: String,
	pub cuit: i64,
}

impl Auth {
	pub fn to_value(&self) -> Value {
		json!({"Token": self.token, "Sign": self.sign, "Cuit": self.cuit})
	}
}

/// WSFEv1 electronic invoicing operations.
#[derive(Clone)]
pub struct WsfeClient {
	transport: Arc<dyn SoapTransport>,
	endpoint: String,
	obs: Observability,
}

impl WsfeClient {
	pub fn new(transport: Arc<dyn SoapTransport>, endpoint: String, obs: Observability) -> Self {
		Self { transport, endpoint, obs }
	}

	async fn request(
		&self,
		method: &'static str,
		params: Vec<(&'static str, Value)>,
	) -> SoapEnvelope {
		let borrowed = params.iter().map(|(name, value)| (*name, value)).collect::<Vec<_>>();
		let request_xml = xml::encode_request(method, WSFE_NAMESPACE, &borrowed);
		let soap_action = format!("{WSFE_NAMESPACE}{method}");
		let response_tag = format!("{method}Response");
		let result_tag = format!("{method}Result");

		consult_afip(&self.obs, "wsfe", method, || async {
			let body = self
				.transport
				.call(&self.endpoint, &soap_action, request_xml.clone())
				.await?;
			let document = xml::decode_document(&body)?;
			xml::check_fault(&document)?;
			let response = xml::extract_response_element(&document, &response_tag)?;
			response.get(&result_tag).cloned().ok_or_else(|| {
				SoapCallError::InvalidResponse(format!("Missing {result_tag} element"))
			})
		})
		.await
	}

	pub async fn fecae_solicitar(&self, auth: &Auth, fe_cae_req: Value) -> SoapEnvelope {
		self.request("FECAESolicitar", vec![("Auth", auth.to_value()), ("FeCAEReq", fe_cae_req)])
			.await
	}

	pub async fn fe_comp_ultimo_autorizado(
		&self,
		auth: &Auth,
		pto_vta: i64,
		cbte_tipo: i64,
	) -> SoapEnvelope {
		self.request(
			"FECompUltimoAutorizado",
			vec![
				("Auth", auth.to_value()),
				("PtoVta", json!(pto_vta)),
				("CbteTipo", json!(cbte_tipo)),
			],
		)
		.await
	}

	pub async fn fe_comp_consultar(&self, auth: &Auth, fe_comp_cons_req: Value) -> SoapEnvelope {
		self.request(
			"FECompConsultar",
			vec![("Auth", auth.to_value()), ("FeCompConsReq", fe_comp_cons_req)],
		)
		.await
	}

	pub async fn caea_solicitar(&self, auth: &Auth, periodo: i64, orden: i64) -> SoapEnvelope {
		self.request(
			"FECAEASolicitar",
			vec![
				("Auth", auth.to_value()),
				("Periodo", json!(periodo)),
				("Orden", json!(orden)),
			],
		)
		.await
	}

	pub async fn caea_consultar(&self, auth: &Auth, periodo: i64, orden: i64) -> SoapEnvelope {
		self.request(
			"FECAEAConsultar",
			vec![
				("Auth", auth.to_value()),
				("Periodo", json!(periodo)),
				("Orden", json!(orden)),
			],
		)
		.await
	}

	pub async fn caea_reg_informativo(
		&self,
		auth: &Auth,
		fe_caea_reg_inf_req: Value,
	) -> SoapEnvelope {
		self.request(
			"FECAEARegInformativo",
			vec![("Auth", auth.to_value()), ("FeCAEARegInfReq", fe_caea_reg_inf_req)],
		)
		.await
	}

	pub async fn caea_sin_movimiento_consultar(
		&self,
		auth: &Auth,
		caea: Option<String>,
		pto_vta: i64,
	) -> SoapEnvelope {
		self.request(
			"FECAEASinMovimientoConsultar",
			vec![
				("Auth", auth.to_value()),
				("CAEA", caea.map_or(Value::Null, Value::String)),
				("PtoVta", json!(pto_vta)),
			],
		)
		.await
	}

	pub async fn caea_sin_movimiento_informar(
		&self,
		auth: &Auth,
		pto_vta: i64,
		caea: String,
	) -> SoapEnvelope {
		self.request(
			"FECAEASinMovimientoInformar",
			vec![("Auth", auth.to_value()), ("PtoVta", json!(pto_vta)), ("CAEA", json!(caea))],
		)
		.await
	}

	/// `FEParamGet*` family; `extra` carries operation-specific arguments.
	pub async fn fe_param_get(
		&self,
		auth: &Auth,
		method: &'static str,
		extra: Vec<(&'static str, Value)>,
	) -> SoapEnvelope {
		let mut params = vec![("Auth", auth.to_value())];
		params.extend(extra);
		self.request(method, params).await
	}

	pub async fn fe_dummy(&self) -> SoapEnvelope {
		self.request("FEDummy", Vec::new()).await
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn wsfe_result_body(method: &str, result_xml: &str) -> String {
		format!(
			"<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
			<soap:Body><{method}Response xmlns=\"{WSFE_NAMESPACE}\">\
			<{method}Result>{result_xml}</{method}Result>\
			</{method}Response></soap:Body></soap:Envelope>"
		)
	}

	pub fn caea_granted_body(caea: &str) -> String {
		wsfe_result_body(
			"FECAEASolicitar",
			&format!(
				"<ResultGet><CAEA>{caea}</CAEA><Periodo>202601</Periodo><Orden>1</Orden>\
				<FchVigDesde>20260101</FchVigDesde><FchVigHasta>20260115</FchVigHasta>\
				</ResultGet>"
			),
		)
	}

	pub fn caea_window_closed_body(code: i64, msg: &str) -> String {
		wsfe_result_body(
			"FECAEASolicitar",
			&format!("<Errors><Err><Code>{code}</Code><Msg>{msg}</Msg></Err></Errors>"),
		)
	}

	pub fn test_auth() -> Auth {
		Auth { token: "token".to_string(), sign: "sign".to_string(), cuit: 30740253022 }
	}
}

#[cfg(test)]
mod tests {
	use super::{test_utils::*, *};
	use crate::{
		observability::test_utils::new_test_observability,
		soap::transport::test_utils::ScriptedTransport,
	};

	fn client(transport: Arc<ScriptedTransport>) -> WsfeClient {
		WsfeClient::new(
			transport,
			"https://wsfehomo.invalid/service.asmx".to_string(),
			new_test_observability(),
		)
	}

	#[tokio::test]
	async fn caea_solicitar_extracts_the_result_element() {
		let transport =
			Arc::new(ScriptedTransport::new(vec![Ok(caea_granted_body("61234567890123"))]));
		let wsfe = client(transport.clone());

		let envelope = wsfe.caea_solicitar(&test_auth(), 202601, 1).await;
		let response = envelope.response().unwrap();
		assert_eq!(response["ResultGet"]["CAEA"], json!(61234567890123i64));

		let (_, sent) = transport.calls.lock().unwrap()[0].clone();
		assert!(sent.contains("<Periodo>202601</Periodo><Orden>1</Orden>"));
		assert!(sent.contains("<Cuit>30740253022</Cuit>"));
	}

	#[tokio::test]
	async fn reg_informativo_preserves_detail_order() {
		let transport = Arc::new(ScriptedTransport::new(vec![Ok(wsfe_result_body(
			"FECAEARegInformativo",
			"<FeCabResp><Resultado>A</Resultado></FeCabResp>",
		))]));
		let wsfe = client(transport.clone());

		let req = json!({
			"FeCabReq": {"CantReg": 1, "PtoVta": 1, "CbteTipo": 11},
			"FeDetReq": {"FECAEADetRequest": [
				{"Concepto": 1, "DocTipo": 99, "CbteDesde": 1, "CbteHasta": 1,
				 "CAEA": "61234567890123"}
			]},
		});
		let envelope = wsfe.caea_reg_informativo(&test_auth(), req).await;
		assert!(envelope.is_success());

		let (_, sent) = transport.calls.lock().unwrap()[0].clone();
		let cab = sent.find("<FeCabReq>").unwrap();
		let det = sent.find("<FeDetReq>").unwrap();
		assert!(cab < det);
		assert!(sent.contains("<CAEA>61234567890123</CAEA>"));
	}
}
