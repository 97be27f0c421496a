//! SOAP boundary with AFIP.
//!
//! Requests are encoded as plain SOAP 1.1 envelopes and executed through a
//! [`transport::SoapTransport`] handle; every call is funnelled through the
//! gateway, which applies the transport retry policy and produces the uniform
//! `{status, response | error}` envelope the rest of the service consumes.

pub mod envelope;
pub mod gateway;
pub mod transport;
pub mod wsaa;
pub mod wsfe;
pub mod wspci;
pub mod xml;

pub use envelope::{SoapCallError, SoapEnvelope, SoapFailure};
pub use transport::{HttpTransport, SoapTransport};
