//! Decision tables for the two notification channels.
//!
//! Both functions are pure: they read the resolved [`PluginConfig`] and one
//! notification and return either the tags and message to emit, or the
//! reason nothing is emitted. Status 404 belongs to the response channel
//! only, and the fault channel drops notifications that miss the required
//! tags, so one request never yields two records for the same fault.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::PluginConfig;
use crate::fault::Fault;

/// Tag names used by the classifier.
pub mod tag {
    pub const REDIRECT: &str = "redirect";
    pub const NOT_FOUND: &str = "not-found";
    pub const USER_ERROR: &str = "user-error";
    pub const SERVER_ERROR: &str = "server-error";

    pub const BAD_REQUEST: &str = "bad-request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const CLIENT_TIMEOUT: &str = "client-timeout";
    pub const SERVICE_UNAVAILABLE: &str = "service-unavailable";
    pub const INTERNAL_SERVER: &str = "internal-server";

    /// Notification raised for an error returned by a handler.
    pub const HANDLER: &str = "handler";
    /// Notification raised for an error propagated by an inner service.
    pub const INTERNAL: &str = "internal";
    pub const IMPLEMENTATION: &str = "implementation";
    pub const ERROR: &str = "error";
    /// Authentication strategy that lets the request continue on failure.
    pub const TRY: &str = "try";
    pub const LIFECYCLE: &str = "lifecycle";
}

/// The single category tag of an emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Redirect,
    NotFound,
    UserError,
    ServerError,
    /// Verbose-mode diagnostics, not tied to a response status.
    Lifecycle,
}

impl Severity {
    pub fn tag(self) -> &'static str {
        match self {
            Severity::Redirect => tag::REDIRECT,
            Severity::NotFound => tag::NOT_FOUND,
            Severity::UserError => tag::USER_ERROR,
            Severity::ServerError => tag::SERVER_ERROR,
            Severity::Lifecycle => tag::LIFECYCLE,
        }
    }
}

/// Set of labels attached to one emission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub fn base(config: &PluginConfig) -> Self {
        config.tags.iter().cloned().collect()
    }

    pub fn insert(&mut self, tag: impl Into<String>) {
        self.0.insert(tag.into());
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Tags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Tags(iter.into_iter().map(Into::into).collect())
    }
}

/// Why a notification produced no emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RouteDisabled,
    /// The client went away before a response existed.
    NoResponse,
    /// Status outside the redirect/not-found set while per-request logging is off.
    Untracked,
    ExcludedStatus,
    /// 404 is emitted by the response channel.
    NotFoundOwnedByResponse,
    /// Faults below 400 are left to the response channel.
    BelowErrorRange,
    TryAuthentication,
    MissingRequiredTag,
}

/// What to emit for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub tags: Tags,
    pub severity: Option<Severity>,
    pub message: String,
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Emit(Verdict),
}

impl Decision {
    pub fn is_emit(&self) -> bool {
        matches!(self, Decision::Emit(_))
    }
}

/// Completed-response notification.
#[derive(Debug, Clone, Copy)]
pub struct ResponseEvent<'a> {
    /// Route template, or the concrete path when no route matched.
    pub route: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub route_disabled: bool,
    pub response: Option<ResponseView<'a>>,
}

/// The parts of a response the classifier reads.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    /// Outgoing `Location` header.
    pub location: Option<&'a str>,
    /// Message of the fault that produced the response, if any.
    pub fault_message: Option<&'a str>,
}

/// Request-fault notification.
#[derive(Debug, Clone, Copy)]
pub struct FaultEvent<'a> {
    pub route: &'a str,
    pub route_disabled: bool,
    /// Tags describing where the notification came from, plus the fault's own tags.
    pub tags: &'a BTreeSet<String>,
    pub fault: &'a Fault,
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302)
}

pub fn classify_response(config: &PluginConfig, event: &ResponseEvent<'_>) -> Decision {
    if event.route_disabled {
        return Decision::Skip(SkipReason::RouteDisabled);
    }
    let Some(response) = event.response else {
        return Decision::Skip(SkipReason::NoResponse);
    };

    let status = response.status;
    if !(is_redirect(status) || status == 404) && !config.requests {
        return Decision::Skip(SkipReason::Untracked);
    }
    if config.exclude_status.contains(&status) {
        return Decision::Skip(SkipReason::ExcludedStatus);
    }

    let mut tags = Tags::base(config);
    let route = event.route;

    let verdict = if is_redirect(status) {
        tags.insert(tag::REDIRECT);
        let location = response.location.unwrap_or("-");
        Verdict {
            tags,
            severity: Some(Severity::Redirect),
            message: format!("{route}: HTTP {status} Redirect to {location}"),
            redirect_to: response.location.map(str::to_string),
        }
    } else if status == 404 {
        tags.insert(tag::NOT_FOUND);
        let message = match response.fault_message {
            Some(message) => format!("{route}: {message}"),
            None => format!("{route}: HTTP 404 not found"),
        };
        Verdict {
            tags,
            severity: Some(Severity::NotFound),
            message,
            redirect_to: None,
        }
    } else {
        Verdict {
            tags,
            severity: None,
            message: format!("{} {} {status}", event.method, event.path),
            redirect_to: None,
        }
    };

    Decision::Emit(verdict)
}

pub fn classify_fault(config: &PluginConfig, event: &FaultEvent<'_>) -> Decision {
    if event.route_disabled {
        return Decision::Skip(SkipReason::RouteDisabled);
    }

    let status = event.fault.status().as_u16();
    if status == 404 {
        return Decision::Skip(SkipReason::NotFoundOwnedByResponse);
    }
    if status < 400 {
        return Decision::Skip(SkipReason::BelowErrorRange);
    }
    if config.ignore_unauthorized_try && status == 401 && event.tags.contains(tag::TRY) {
        return Decision::Skip(SkipReason::TryAuthentication);
    }
    if config.exclude_status.contains(&status) {
        return Decision::Skip(SkipReason::ExcludedStatus);
    }
    if !config.required_tags.is_empty() && config.required_tags.is_disjoint(event.tags) {
        return Decision::Skip(SkipReason::MissingRequiredTag);
    }

    let severity = if status < 500 {
        Severity::UserError
    } else {
        Severity::ServerError
    };

    let mut tags = Tags::base(config);
    if config.include_event_tags {
        for event_tag in event.tags {
            if severity == Severity::UserError && event_tag == tag::ERROR {
                continue;
            }
            tags.insert(event_tag.as_str());
        }
    }
    tags.insert(severity.tag());
    if let Some(refinement) = refinement_tag(status) {
        tags.insert(refinement);
    }

    let route = event.route;
    let message = match event.fault.message() {
        Some(message) => message.to_string(),
        None => format!("{status} error on path {route}"),
    };

    Decision::Emit(Verdict {
        tags,
        severity: Some(severity),
        message: format!("{route}: {message}"),
        redirect_to: None,
    })
}

fn refinement_tag(status: u16) -> Option<&'static str> {
    match status {
        504 => Some(tag::CLIENT_TIMEOUT),
        503 => Some(tag::SERVICE_UNAVAILABLE),
        400 => Some(tag::BAD_REQUEST),
        401 => Some(tag::UNAUTHORIZED),
        500 => Some(tag::INTERNAL_SERVER),
        _ => None,
    }
}
