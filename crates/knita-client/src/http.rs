use crate::control::{ControlPlane, EventStream};
use crate::{ClientConfig, TransportError};
use knita_protocol::{
    CloseRequest, Empty, ErrorBody, EventReader, ExecRequest, Method, OpenRequest, OpenResponse,
    TransferRequest, PROTOCOL_HEADER, PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufReader, Read};
use tracing::debug;

/// Upper bound on how much of an error body is read back.
const MAX_ERROR_BODY: u64 = 64 * 1024;

type HttpResponse = ureq::http::Response<ureq::Body>;

/// Control plane reached over HTTP/1.1:
/// - `POST /v1/open`, `/v1/import`, `/v1/export`, `/v1/close`: JSON in, JSON out
/// - `POST /v1/exec`: JSON in, newline-delimited event stream out
///
/// The agent is cheap to share; wrap one instance in an `Arc` for all
/// runtimes of a build.
pub struct HttpControlPlane {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpControlPlane {
    pub fn new(config: &ClientConfig) -> Self {
        // Status codes are inspected here so error bodies can be read.
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: config.base_url(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, method: Method, body: &impl Serialize) -> Result<HttpResponse, TransportError> {
        let payload = serde_json::to_vec(body).map_err(|e| TransportError::Encode {
            method: method.name(),
            message: e.to_string(),
        })?;
        let url = format!("{}{}", self.base_url, method.path());
        debug!("POST {url} ({} bytes)", payload.len());

        let resp = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string())
            .send(payload.as_slice())
            .map_err(|e| TransportError::Connection {
                address: self.base_url.clone(),
                message: e.to_string(),
            })?;

        let code = resp.status().as_u16();
        if !(200..300).contains(&code) {
            let mut text = String::new();
            let _ = resp
                .into_body()
                .into_reader()
                .take(MAX_ERROR_BODY)
                .read_to_string(&mut text);
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map_or_else(|_| text.trim().to_owned(), |body| body.message);
            debug!("{} rejected with HTTP {code}: {message}", method.name());
            return Err(TransportError::Rejected {
                method: method.name(),
                status: code,
                message,
            });
        }
        Ok(resp)
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        body: &impl Serialize,
    ) -> Result<T, TransportError> {
        let resp = self.post(method, body)?;
        let decode = |message: String| TransportError::Decode {
            method: method.name(),
            message,
        };
        let mut raw = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut raw)
            .map_err(|e| decode(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| decode(e.to_string()))
    }
}

impl ControlPlane for HttpControlPlane {
    fn open(&self, request: &OpenRequest) -> Result<OpenResponse, TransportError> {
        self.call(Method::Open, request)
    }

    fn exec(&self, request: &ExecRequest) -> Result<EventStream, TransportError> {
        let resp = self.post(Method::Exec, request)?;
        let reader = BufReader::new(resp.into_body().into_reader());
        Ok(Box::new(EventReader::new(reader)))
    }

    fn import(&self, request: &TransferRequest) -> Result<(), TransportError> {
        self.call::<Empty>(Method::Import, request).map(|_| ())
    }

    fn export(&self, request: &TransferRequest) -> Result<(), TransportError> {
        self.call::<Empty>(Method::Export, request).map(|_| ())
    }

    fn close(&self, request: &CloseRequest) -> Result<(), TransportError> {
        self.call::<Empty>(Method::Close, request).map(|_| ())
    }
}
