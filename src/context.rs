use std::collections::BTreeMap;

use actix_web::HttpMessage;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{self, HeaderMap};
use actix_web::web::Query;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::agent::UserAgentClassifier;
use crate::config::PluginConfig;
use crate::fault::{Fault, FaultOutput};

/// Header checked for a caller supplied request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id generated when the caller did not send one.
///
/// Stored in the request extensions so handlers can read the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        {
            Self(Uuid::new_v4())
        }
        #[cfg(feature = "uuid_v7")]
        {
            Self(Uuid::now_v7())
        }
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Data of one emitted record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Request id, only with `include_id`. A generated id is written back
    /// to the request extensions so later readers see the same value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub user_agent: String,
    pub browser: String,
    pub is_bot: bool,
    pub ip: String,
    pub method: String,
    /// Route template, e.g. `/users/{id}`.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    /// Milliseconds between receiving the request and finishing the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Fault details folded into a [`RequestContext`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub data: Value,
    pub output: FaultOutput,
}

impl From<&Fault> for ErrorInfo {
    fn from(fault: &Fault) -> Self {
        ErrorInfo {
            message: fault.to_string(),
            stack: fault.stack().map(str::to_string),
            data: fault.data().normalize(),
            output: fault.output(),
        }
    }
}

impl RequestContext {
    pub fn with_error(mut self, fault: &Fault) -> Self {
        self.error = Some(ErrorInfo::from(fault));
        self
    }

    pub(crate) fn set_response_time(
        &mut self,
        received: Option<OffsetDateTime>,
        responded: Option<OffsetDateTime>,
    ) {
        self.response_time = response_time_ms(received, responded);
    }
}

/// Elapsed milliseconds, present only when both instants are known.
pub fn response_time_ms(
    received: Option<OffsetDateTime>,
    responded: Option<OffsetDateTime>,
) -> Option<u64> {
    let elapsed = responded? - received?;
    u64::try_from(elapsed.whole_milliseconds()).ok()
}

/// Read-only copy of the request metadata, taken before the request is
/// handed to the inner service.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub(crate) id: Option<String>,
    pub(crate) referrer: Option<String>,
    pub(crate) user_agent: String,
    pub(crate) browser: String,
    pub(crate) is_bot: bool,
    pub(crate) ip: String,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: BTreeMap<String, String>,
    pub(crate) headers: Option<BTreeMap<String, String>>,
    pub(crate) payload: Option<Value>,
    pub(crate) received: Option<OffsetDateTime>,
}

impl RequestSnapshot {
    pub fn capture(
        req: &ServiceRequest,
        config: &PluginConfig,
        classifier: &dyn UserAgentClassifier,
        received: OffsetDateTime,
    ) -> Self {
        let user_agent = header_str(req.headers(), &header::USER_AGENT).unwrap_or_default();

        let ip = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .or_else(|| {
                req.connection_info()
                    .realip_remote_addr()
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let query = Query::<BTreeMap<String, String>>::from_query(req.query_string())
            .map(Query::into_inner)
            .unwrap_or_default();

        RequestSnapshot {
            id: config.include_id.then(|| request_id(req)),
            referrer: header_str(req.headers(), &header::REFERER),
            browser: classifier.browser(&user_agent),
            is_bot: classifier.is_bot(&user_agent),
            user_agent,
            ip,
            method: req.method().to_string(),
            path: req.path().to_string(),
            query,
            headers: config.request_headers.then(|| header_map(req.headers())),
            payload: None,
            received: Some(received),
        }
    }

    /// Concrete request path, as opposed to the route template.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Build the record for a finished request answered with `status`.
    pub fn extract(&self, route: &str, status: u16) -> RequestContext {
        RequestContext {
            id: self.id.clone(),
            referrer: self.referrer.clone(),
            user_agent: self.user_agent.clone(),
            browser: self.browser.clone(),
            is_bot: self.is_bot,
            ip: self.ip.clone(),
            method: self.method.clone(),
            path: route.to_string(),
            query: self.query.clone(),
            status_code: status,
            message: String::new(),
            redirect_to: None,
            response_time: None,
            request_payload: self.payload.clone(),
            request_headers: self.headers.clone(),
            error: None,
        }
    }
}

/// Inserts a fresh [`RequestId`] into the extensions when none is found.
fn request_id(req: &ServiceRequest) -> String {
    #[cfg(feature = "tracing-request-id")]
    {
        if let Some(id) = req.extensions().get::<tracing_actix_web::RequestId>() {
            return id.to_string();
        }
    }

    let header = header::HeaderName::from_static(REQUEST_ID_HEADER);
    if let Some(id) = header_str(req.headers(), &header) {
        return id;
    }

    if let Some(id) = req.extensions().get::<RequestId>() {
        return id.0.as_hyphenated().to_string();
    }

    let id = RequestId::new();
    req.extensions_mut().insert(id);
    id.0.as_hyphenated().to_string()
}

fn header_str(headers: &HeaderMap, name: &header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}
