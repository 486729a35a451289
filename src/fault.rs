use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use actix_web::http::StatusCode;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{HttpResponse, ResponseError};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};

/// Structured HTTP failure raised by handlers and middleware.
///
/// `Fault` renders as a JSON error response and carries everything the
/// classifier reads on the fault channel: status output, optional message,
/// cause chain, attached data and context tags.
///
/// ```rust
/// use actix_web_middleware_detailed_response::Fault;
///
/// async fn handler() -> Result<&'static str, Fault> {
///     Err(Fault::bad_request("missing `name`").with_data(serde_json::json!({"field": "name"})))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Fault {
    status: StatusCode,
    message: Option<String>,
    stack: Option<String>,
    data: FaultData,
    headers: BTreeMap<String, String>,
    tags: BTreeSet<String>,
}

/// Metadata attached to a [`Fault`].
#[derive(Debug, Clone, Default)]
pub enum FaultData {
    #[default]
    None,
    Plain(Value),
    /// Raw upstream response kept for diagnostics; only its summary is logged.
    Upstream(UpstreamResponse),
}

/// A response received from an upstream HTTP call, including its body.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub status_message: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Bounded form of an [`UpstreamResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSummary {
    pub path: String,
    pub method: String,
    pub status_code: u16,
    pub status_message: String,
}

/// Status output of a fault, as sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultOutput {
    pub status_code: u16,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

impl UpstreamResponse {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        status_message: impl Into<String>,
    ) -> Self {
        UpstreamResponse {
            method: method.into(),
            path: path.into(),
            status,
            status_message: status_message.into(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn summary(&self) -> UpstreamSummary {
        UpstreamSummary {
            path: self.path.clone(),
            method: self.method.clone(),
            status_code: self.status,
            status_message: self.status_message.clone(),
        }
    }
}

impl FaultData {
    /// Loggable form of the data: upstream responses shrink to their summary,
    /// everything else passes through unchanged.
    pub fn normalize(&self) -> Value {
        match self {
            FaultData::None => Value::Null,
            FaultData::Plain(value) => value.clone(),
            FaultData::Upstream(upstream) => json!(upstream.summary()),
        }
    }
}

impl Fault {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Fault::from_status(status).with_message(message)
    }

    /// A fault without a message of its own.
    pub fn from_status(status: StatusCode) -> Self {
        Fault {
            status,
            message: None,
            stack: None,
            data: FaultData::None,
            headers: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401 with a `WWW-Authenticate` challenge for `scheme`.
    pub fn unauthorized(message: impl Into<String>, scheme: &str) -> Self {
        Fault::new(StatusCode::UNAUTHORIZED, message).with_header("www-authenticate", scheme)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Fault::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    /// Fault for a failed upstream call, keeping the upstream response as data.
    pub fn bad_gateway(message: impl Into<String>, upstream: UpstreamResponse) -> Self {
        Fault::new(StatusCode::BAD_GATEWAY, message).with_upstream(upstream)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.message = (!message.is_empty()).then_some(message);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = FaultData::Plain(data);
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamResponse) -> Self {
        self.data = FaultData::Upstream(upstream);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a context tag, e.g. `try` for an optional authentication strategy.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Record `cause` and its sources as the fault's stack.
    pub fn caused_by(mut self, cause: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![cause.to_string()];
        let mut source = cause.source();
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        self.stack = Some(chain.join("\ncaused by: "));
        self
    }

    pub(crate) fn with_stack(mut self, stack: String) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Build a fault out of an arbitrary actix error.
    pub fn from_error(err: &actix_web::Error) -> Self {
        if let Some(fault) = err.as_error::<Fault>() {
            return fault.clone();
        }

        let message = err.to_string();
        let debug = format!("{err:?}");
        let fault = Fault::from_status(err.as_response_error().status_code())
            .with_message(message.clone());
        if debug != message {
            fault.with_stack(debug)
        } else {
            fault
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn data(&self) -> &FaultData {
        &self.data
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn reason(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("Unknown")
    }

    /// Body sent to the client. Server errors never expose their message.
    pub fn payload(&self) -> Value {
        let message = if self.status.is_server_error() {
            "An internal server error occurred"
        } else {
            self.message.as_deref().unwrap_or(self.reason())
        };
        json!({
            "statusCode": self.status.as_u16(),
            "error": self.reason(),
            "message": message,
        })
    }

    pub fn output(&self) -> FaultOutput {
        FaultOutput {
            status_code: self.status.as_u16(),
            payload: self.payload(),
            headers: self.headers.clone(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => f.write_str(self.reason()),
        }
    }
}

impl std::error::Error for Fault {}

impl ResponseError for Fault {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder.insert_header((name, value));
            }
        }
        builder.json(self.payload())
    }
}
