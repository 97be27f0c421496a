//! SOAP 1.1 encoding and decoding.
//!
//! Requests are rendered from order-preserving JSON values, so AFIP's aliased
//! payload fields (`Iva`/`AlicIva`, `Tributos`/`Tributo`, ...) reach the wire
//! in the order the caller supplied them. Responses are decoded into JSON
//! values where repeated sibling elements collapse into arrays, which is the
//! shape the resilience engine inspects (`Errors.Err[*]`).

use std::fmt::Write;

use quick_xml::{escape::escape, events::Event, Reader};
use serde_json::{Map, Value};

use super::envelope::SoapCallError;

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Renders a complete SOAP 1.1 request envelope for `method`, with `params`
/// written in order under the operation element.
pub fn encode_request(method: &str, namespace: &str, params: &[(&str, &Value)]) -> String {
	let mut body = String::new();
	for (name, value) in params {
		write_value(&mut body, name, value);
	}
	format!(
		"<?xml version=\"1.0\" encoding=\"utf-8\"?>\
		<soap:Envelope xmlns:soap=\"{SOAP_ENVELOPE_NS}\">\
		<soap:Body>\
		<{method} xmlns=\"{namespace}\">{body}</{method}>\
		</soap:Body>\
		</soap:Envelope>"
	)
}

fn write_value(out: &mut String, name: &str, value: &Value) {
	match value {
		// Optional fields are omitted, matching the WSDL's minOccurs=0 usage.
		Value::Null => {},
		Value::Object(map) => {
			let _ = write!(out, "<{name}>");
			for (key, child) in map {
				write_value(out, key, child);
			}
			let _ = write!(out, "</{name}>");
		},
		Value::Array(items) => {
			for item in items {
				write_value(out, name, item);
			}
		},
		Value::String(text) => {
			let _ = write!(out, "<{name}>{}</{name}>", escape(text.as_str()));
		},
		scalar => {
			let _ = write!(out, "<{name}>{scalar}</{name}>");
		},
	}
}

struct Element {
	name: String,
	children: Vec<(String, Value)>,
	text: String,
}

impl Element {
	fn new(name: String) -> Self {
		Self { name, children: Vec::new(), text: String::new() }
	}

	fn into_value(self) -> (String, Value) {
		let value = if self.children.is_empty() {
			leaf_value(self.text.trim())
		} else {
			let mut map = Map::new();
			for (name, child) in self.children {
				match map.get_mut(&name) {
					None => {
						map.insert(name, child);
					},
					Some(Value::Array(items)) => items.push(child),
					Some(existing) => {
						let first = existing.take();
						*existing = Value::Array(vec![first, child]);
					},
				}
			}
			Value::Object(map)
		};
		(self.name, value)
	}
}

fn leaf_value(text: &str) -> Value {
	if text.is_empty() {
		return Value::Null;
	}
	// Integers are surfaced as numbers; anything with a leading zero (AFIP
	// codes, CUIT-formatted strings) stays textual.
	let looks_numeric = !text.starts_with('0') || text.len() == 1;
	if looks_numeric {
		if let Ok(number) = text.parse::<i64>() {
			return Value::Number(number.into());
		}
	}
	Value::String(text.to_string())
}

fn local_name(qname: &[u8]) -> String {
	let name = String::from_utf8_lossy(qname);
	match name.rsplit_once(':') {
		Some((_, local)) => local.to_string(),
		None => name.into_owned(),
	}
}

/// Parses an XML document into a JSON value keyed by local element names.
pub fn decode_document(xml: &str) -> Result<Value, SoapCallError> {
	let mut reader = Reader::from_str(xml);
	let mut stack: Vec<Element> = vec![Element::new(String::new())];

	loop {
		match reader.read_event() {
			Ok(Event::Start(start)) => {
				stack.push(Element::new(local_name(start.name().as_ref())));
			},
			Ok(Event::Empty(empty)) => {
				let name = local_name(empty.name().as_ref());
				stack.last_mut().expect("document root on stack").children.push((name, Value::Null));
			},
			Ok(Event::Text(text)) => {
				let unescaped = text
					.unescape()
					.map_err(|error| SoapCallError::InvalidResponse(error.to_string()))?;
				stack.last_mut().expect("document root on stack").text.push_str(&unescaped);
			},
			Ok(Event::CData(cdata)) => {
				stack
					.last_mut()
					.expect("document root on stack")
					.text
					.push_str(&String::from_utf8_lossy(&cdata));
			},
			Ok(Event::End(_)) => {
				let element = stack.pop().expect("document root on stack");
				let (name, value) = element.into_value();
				let Some(parent) = stack.last_mut() else {
					return Err(SoapCallError::InvalidResponse(
						"Unbalanced XML document".to_string(),
					));
				};
				parent.children.push((name, value));
			},
			Ok(Event::Eof) => break,
			Ok(_) => {},
			Err(error) => return Err(SoapCallError::InvalidResponse(error.to_string())),
		}
	}

	if stack.len() != 1 {
		return Err(SoapCallError::InvalidResponse("Unbalanced XML document".to_string()));
	}
	let (_, document) = stack.pop().expect("checked above").into_value();
	Ok(document)
}

/// Fails with [`SoapCallError::Fault`] when the response body carries a SOAP
/// fault.
pub fn check_fault(document: &Value) -> Result<(), SoapCallError> {
	let Some(fault) = document
		.get("Envelope")
		.and_then(|envelope| envelope.get("Body"))
		.and_then(|body| body.get("Fault"))
	else {
		return Ok(());
	};

	let code = fault.get("faultcode").and_then(Value::as_str).unwrap_or("soap:Server");
	let detail = fault
		.get("faultstring")
		.and_then(Value::as_str)
		.unwrap_or("SOAP fault without faultstring");
	Err(SoapCallError::Fault(format!("{code}: {detail}")))
}

/// Looks up the operation response element (`FECAEASolicitarResponse`,
/// `loginCmsResponse`, ...) inside the SOAP body.
pub fn extract_response_element(document: &Value, tag: &str) -> Result<Value, SoapCallError> {
	document
		.get("Envelope")
		.and_then(|envelope| envelope.get("Body"))
		.and_then(|body| body.get(tag))
		.cloned()
		.ok_or_else(|| SoapCallError::InvalidResponse(format!("Missing {tag} element")))
}
