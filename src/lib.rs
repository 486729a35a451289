//! Actix-web middleware that turns redirects, not-found responses and request
//! faults into tagged, structured log records.
//!
//! Every finished request is looked at twice: once as a completed response and
//! once for the error attached to it, if any. Redirects (301, 302) and
//! not-found (404) records come from the response; 4xx and 5xx records come
//! from the fault. A request is never logged twice for the same fault, and the
//! response itself is never touched.
//!
//! # Examples:
//! ## By default middleware uses the standard `log` crate for logging.
//! ```bash
//! cargo add actix-web-middleware-detailed-response
//! ```
//! Example usage with standard `log` crate and `structured_logger` crate:
//! ```rust
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_detailed_response::{DetailedResponse, Fault};
//! use tokio;
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     HttpServer::new(|| {
//!         App::new()
//!             .wrap(DetailedResponse::default())
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!             .route(
//!                 "/error",
//!                 web::get().to(|| async { Err::<&str, _>(Fault::bad_request("bad bad bad")) }),
//!             )
//!     })
//!     .bind("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//!
//! # Tags
//!
//! Every record carries the base tags (`detailed-response` by default) and at
//! most one category:
//!
//! | status | category | refinement |
//! |---|---|---|
//! | 301, 302 | `redirect` | |
//! | 404 | `not-found` | |
//! | 400 | `user-error` | `bad-request` |
//! | 401 | `user-error` | `unauthorized` |
//! | other 4xx | `user-error` | |
//! | 500 | `server-error` | `internal-server` |
//! | 503 | `server-error` | `service-unavailable` |
//! | 504 | `server-error` | `client-timeout` |
//! | other 5xx | `server-error` | |
//!
//! # Configuration
//!
//! Options can be given as JSON, with unknown keys ignored:
//!
//! ```rust
//! use actix_web_middleware_detailed_response::DetailedResponse;
//! use serde_json::json;
//!
//! let logger = DetailedResponse::from_options(&json!({
//!     "excludeStatus": [401],
//!     "requestPayload": true,
//!     "tags": ["api"],
//! }));
//! ```
//!
//! or with the builder:
//!
//! ```rust
//! use actix_web_middleware_detailed_response::DetailedResponse;
//!
//! let logger = DetailedResponse::default()
//!     .requests(true)              // log every request, not only redirects and 404
//!     .include_id(true)            // x-request-id or a generated UUID
//!     .request_headers(true)
//!     .ignore_unauthorized_try(true)
//!     .exclude("/health")
//!     .exclude_regex(r"^/assets/.*")
//!     .unwrap();
//! ```
//!
//! Single routes opt out with [`RouteLogging::disabled`] as resource or scope
//! `app_data`.
//!
//! # Feature Flags
//!
//! - `log` (default) - Emit records through the standard `log` crate
//! - `tracing-request-id` - Use `tracing-actix-web`'s request ID for the `id` field
//! - `uuid_v7` - Use UUIDv7 instead of UUIDv4 for generated request IDs

mod agent;
mod classify;
mod config;
mod context;
mod fault;
mod logger;
mod payload;
mod wrapper;

pub use crate::agent::{BasicClassifier, UserAgentClassifier};
pub use crate::classify::{
    Decision, FaultEvent, ResponseEvent, ResponseView, Severity, SkipReason, Tags, Verdict,
    classify_fault, classify_response, tag,
};
pub use crate::config::{ConfigError, DEFAULT_TAG, PluginConfig};
pub use crate::context::{ErrorInfo, RequestContext, RequestId, RequestSnapshot};
pub use crate::fault::{Fault, FaultData, FaultOutput, UpstreamResponse, UpstreamSummary};
pub use crate::logger::{DetailedResponse, RouteLogging};
pub use crate::payload::CAPTURE_LIMIT;
pub use crate::wrapper::{Discard, Emission, Sink};
#[cfg(feature = "log")]
pub use crate::wrapper::{LogSink, rust_log};
