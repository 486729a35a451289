use std::{
    collections::{BTreeSet, HashSet},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::future::LocalBoxFuture;
use futures_core::ready;
use pin_project_lite::pin_project;
use regex::Regex;
use serde_json::Value;
use time::OffsetDateTime;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::LOCATION;
use actix_web::{Error, HttpRequest, HttpResponse, Result};

use crate::agent::{BasicClassifier, UserAgentClassifier};
use crate::classify::{
    Decision, FaultEvent, ResponseEvent, ResponseView, Severity, SkipReason, Tags, Verdict,
    classify_fault, classify_response, tag,
};
use crate::config::{ConfigError, PluginConfig};
use crate::context::{RequestContext, RequestSnapshot};
use crate::fault::Fault;
use crate::payload::{self, CaptureIssue, Captured};
use crate::wrapper::{Emission, Sink, dispatch};

/// Middleware classifying finished requests and faults into tagged log records.
///
/// Redirects (301, 302) and not-found responses are logged from the
/// completed response; 4xx and 5xx faults are logged from the error attached
/// to the request. Nothing about the response is changed.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_detailed_response::DetailedResponse;
///
/// let app = App::new()
///     .wrap(DetailedResponse::default().exclude_status(400));
/// ```
pub struct DetailedResponse(Rc<Inner>);

#[derive(Clone)]
struct Inner {
    config: PluginConfig,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
    classifier: Rc<dyn UserAgentClassifier>,
    sink: Rc<dyn Sink>,
}

/// Per-route switch, registered as resource or scope `app_data`.
///
/// The switch is read from the routed request, so it only covers responses
/// that reach this middleware as `Ok`. An error returned by a resource or
/// scope middleware arrives without its request and is still logged; use
/// [`DetailedResponse::exclude`] or [`DetailedResponse::exclude_regex`] for
/// such routes.
///
/// ```rust
/// use actix_web::{App, HttpResponse, web};
/// use actix_web_middleware_detailed_response::{DetailedResponse, RouteLogging};
///
/// let app = App::new().wrap(DetailedResponse::default()).service(
///     web::resource("/health")
///         .app_data(RouteLogging::disabled())
///         .to(HttpResponse::Ok),
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLogging {
    enabled: bool,
}

impl RouteLogging {
    pub fn enabled() -> Self {
        RouteLogging { enabled: true }
    }

    pub fn disabled() -> Self {
        RouteLogging { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn default_sink() -> Rc<dyn Sink> {
    #[cfg(feature = "log")]
    {
        Rc::new(crate::wrapper::LogSink::default())
    }
    #[cfg(not(feature = "log"))]
    {
        Rc::new(crate::wrapper::Discard)
    }
}

impl DetailedResponse {
    /// Create the middleware from resolved options.
    pub fn new(config: PluginConfig) -> DetailedResponse {
        DetailedResponse(Rc::new(Inner {
            config,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
            classifier: Rc::new(BasicClassifier),
            sink: default_sink(),
        }))
    }

    /// Create the middleware from caller options, see [`PluginConfig::resolve`].
    pub fn from_options(options: &Value) -> DetailedResponse {
        DetailedResponse::new(PluginConfig::resolve(options))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.0.config
    }

    fn inner_mut(&mut self) -> &mut Inner {
        Rc::make_mut(&mut self.0)
    }

    fn configure(mut self, f: impl FnOnce(&mut PluginConfig)) -> Self {
        f(&mut self.inner_mut().config);
        self
    }

    /// Never log responses or faults with this status.
    pub fn exclude_status(self, status: u16) -> Self {
        self.configure(|c| {
            c.exclude_status.insert(status);
        })
    }

    /// Only log faults whose notification carries this tag (or another required one).
    pub fn required_tag(self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.configure(|c| {
            c.required_tags.insert(tag);
        })
    }

    /// Add the request id to records: `x-request-id` when sent, otherwise a
    /// generated [`RequestId`](crate::RequestId) that is also stored in the
    /// request extensions for handlers to read.
    pub fn include_id(self, on: bool) -> Self {
        self.configure(|c| c.include_id = on)
    }

    pub fn ignore_unauthorized_try(self, on: bool) -> Self {
        self.configure(|c| c.ignore_unauthorized_try = on)
    }

    pub fn include_event_tags(self, on: bool) -> Self {
        self.configure(|c| c.include_event_tags = on)
    }

    pub fn request_payload(self, on: bool) -> Self {
        self.configure(|c| c.request_payload = on)
    }

    pub fn request_headers(self, on: bool) -> Self {
        self.configure(|c| c.request_headers = on)
    }

    /// Log every completed request, not only redirects and not-found.
    pub fn requests(self, on: bool) -> Self {
        self.configure(|c| c.requests = on)
    }

    /// Replace the base tags.
    pub fn tags<I, T>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect();
        self.configure(|c| c.tags = tags)
    }

    pub fn verbose(self, on: bool) -> Self {
        self.configure(|c| c.verbose = on)
    }

    /// Ignore and do not log requests for the specified path or route template.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        self.inner_mut().exclude.insert(path.into());
        self
    }

    /// Ignore and do not log requests whose path or route template matches `pattern`.
    pub fn exclude_regex<T: AsRef<str>>(mut self, pattern: T) -> Result<Self, ConfigError> {
        let re = Regex::new(pattern.as_ref())?;
        self.inner_mut().exclude_regex.push(re);
        Ok(self)
    }

    /// Replace the default user-agent classifier.
    pub fn classifier(mut self, classifier: impl UserAgentClassifier + 'static) -> Self {
        self.inner_mut().classifier = Rc::new(classifier);
        self
    }

    /// Send records to `sink` instead of the `log` facade.
    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.inner_mut().sink = Rc::new(sink);
        self
    }

    /// Sets the logging target to `target`.
    ///
    /// By default, the log target is `actix_web_middleware_detailed_response::logger`.
    #[cfg(feature = "log")]
    pub fn log_target(self, target: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        self.sink(crate::wrapper::LogSink::new(target))
    }
}

impl Default for DetailedResponse {
    /// Default options: base tag `detailed-response`, redirects and
    /// not-found from responses, 4xx and 5xx from faults.
    fn default() -> Self {
        DetailedResponse::new(PluginConfig::default())
    }
}

impl Inner {
    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.contains(path) || self.exclude_regex.iter().any(|r| r.is_match(path))
    }

    fn route_disabled(&self, req: &HttpRequest, route: &str) -> bool {
        let switched_off = req
            .app_data::<RouteLogging>()
            .is_some_and(|switch| !switch.is_enabled());
        switched_off || self.is_excluded(route)
    }

    fn emission(
        &self,
        snapshot: &RequestSnapshot,
        route: &str,
        status: u16,
        verdict: Verdict,
        fault: Option<&Fault>,
    ) -> Emission {
        let mut data = snapshot.extract(route, status);
        data.message = verdict.message;
        data.redirect_to = verdict.redirect_to;
        if let Some(fault) = fault {
            data = data.with_error(fault);
        }
        Emission {
            tags: verdict.tags,
            severity: verdict.severity,
            data,
        }
    }

    fn lifecycle(&self, mut data: RequestContext, kind: &str, message: String) -> Emission {
        let mut tags = Tags::base(&self.config);
        tags.insert(tag::LIFECYCLE);
        tags.insert(kind);
        tags.insert(tag::ERROR);
        data.message = format!("{}: {message}", data.path);
        Emission {
            tags,
            severity: Some(Severity::Lifecycle),
            data,
        }
    }

    /// Run both channels for one finished request.
    ///
    /// `fault_tags` describes where the fault notification came from.
    fn observe(
        &self,
        snapshot: &RequestSnapshot,
        route: &str,
        route_disabled: bool,
        response: ResponseView<'_>,
        fault: Option<(&Fault, &[&str])>,
    ) -> Vec<Emission> {
        let mut out = Vec::new();

        let event = ResponseEvent {
            route,
            method: snapshot.method(),
            path: snapshot.path(),
            route_disabled,
            response: Some(response),
        };
        match classify_response(&self.config, &event) {
            Decision::Emit(verdict) => {
                out.push(self.emission(snapshot, route, response.status, verdict, None))
            }
            Decision::Skip(reason) => trace_skip("response", route, reason),
        }

        if let Some((fault, source)) = fault {
            let tags: BTreeSet<String> = source
                .iter()
                .map(|t| t.to_string())
                .chain(fault.tags().iter().cloned())
                .collect();
            let event = FaultEvent {
                route,
                route_disabled,
                tags: &tags,
                fault,
            };
            match classify_fault(&self.config, &event) {
                Decision::Emit(verdict) => out.push(self.emission(
                    snapshot,
                    route,
                    response.status,
                    verdict,
                    Some(fault),
                )),
                Decision::Skip(reason) => trace_skip("fault", route, reason),
            }
        }

        out
    }
}

#[allow(unused_variables)]
fn trace_skip(channel: &str, route: &str, reason: SkipReason) {
    #[cfg(feature = "log")]
    log::trace!("{channel} notification for {route} not logged: {reason:?}");
}

impl<S, B> Transform<S, ServiceRequest> for DetailedResponse
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Transform = DetailedResponseService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(DetailedResponseService {
            service: Rc::new(service),
            inner: Rc::clone(&self.0),
        }))
    }
}

pin_project! {
    /// Response body wrapper; pending records are emitted once the body is dropped.
    pub struct ObservedBody<B> {
        #[pin]
        body: B,
        pending: Vec<Emission>,
        received: Option<OffsetDateTime>,
        // verbose mode only
        diagnostics: Option<RequestContext>,
        stream_failed: bool,
        inner: Rc<Inner>,
    }

    impl<B> PinnedDrop for ObservedBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            let responded = Some(OffsetDateTime::now_utc());

            if *this.stream_failed {
                if let Some(data) = this.diagnostics.take() {
                    let note = this.inner.lifecycle(
                        data,
                        "response-stream",
                        "response body stream failed".to_string(),
                    );
                    this.pending.push(note);
                }
            }

            for mut emission in this.pending.drain(..) {
                emission.data.set_response_time(*this.received, responded);
                dispatch(&*this.inner.sink, emission);
            }
        }
    }
}

impl<B: MessageBody> MessageBody for ObservedBody<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => {
                *this.stream_failed = true;
                Poll::Ready(Some(Err(err)))
            }
            None => Poll::Ready(None),
        }
    }
}

/// Detailed response middleware service.
pub struct DetailedResponseService<S> {
    inner: Rc<Inner>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for DetailedResponseService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Future = DetailedResponseFuture<B>;

    actix_service::forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        if self.inner.is_excluded(req.path()) {
            return DetailedResponseFuture {
                fut: Box::pin(async move { (service.call(req).await, Captured::default()) }),
                snapshot: None,
                inner: Rc::clone(&self.inner),
            };
        }

        let snapshot = RequestSnapshot::capture(
            &req,
            &self.inner.config,
            &*self.inner.classifier,
            OffsetDateTime::now_utc(),
        );
        let capture_payload = self.inner.config.request_payload;

        DetailedResponseFuture {
            fut: Box::pin(async move {
                let captured = if capture_payload {
                    payload::capture(&mut req).await
                } else {
                    Captured::default()
                };
                (service.call(req).await, captured)
            }),
            snapshot: Some(snapshot),
            inner: Rc::clone(&self.inner),
        }
    }
}

type ServiceOutput<B> = (Result<ServiceResponse<B>, Error>, Captured);

pin_project! {
    pub struct DetailedResponseFuture<B> {
        #[pin]
        fut: LocalBoxFuture<'static, ServiceOutput<B>>,
        snapshot: Option<RequestSnapshot>,
        inner: Rc<Inner>,
    }
}

impl<B: MessageBody> Future for DetailedResponseFuture<B> {
    type Output = Result<ServiceResponse<ObservedBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let (res, captured) = ready!(this.fut.poll(cx));
        let inner = Rc::clone(this.inner);

        let Some(mut snapshot) = this.snapshot.take() else {
            return Poll::Ready(res.map(|res| {
                res.map_body(move |_, body| ObservedBody {
                    body,
                    pending: Vec::new(),
                    received: None,
                    diagnostics: None,
                    stream_failed: false,
                    inner,
                })
            }));
        };
        snapshot.payload = captured.value;
        let received = snapshot.received;

        match res {
            Ok(res) => {
                let req = res.request();
                let route = req
                    .match_pattern()
                    .unwrap_or_else(|| snapshot.path().to_string());
                let route_disabled = inner.route_disabled(req, &route);
                let status = res.status().as_u16();
                let fault = res.response().error().map(Fault::from_error);
                let location = res.headers().get(LOCATION).and_then(|v| v.to_str().ok());

                let view = ResponseView {
                    status,
                    location,
                    fault_message: fault.as_ref().and_then(Fault::message),
                };
                let source = [tag::HANDLER, tag::ERROR];
                let mut pending = inner.observe(
                    &snapshot,
                    &route,
                    route_disabled,
                    view,
                    fault.as_ref().map(|f| (f, &source[..])),
                );

                let verbose = inner.config.verbose && !route_disabled;
                if verbose {
                    if let Some(issue) = captured.issue {
                        pending.push(capture_note(&inner, &snapshot, &route, status, issue));
                    }
                }
                let diagnostics = verbose.then(|| snapshot.extract(&route, status));

                Poll::Ready(Ok(res.map_body(move |_, body| ObservedBody {
                    body,
                    pending,
                    received,
                    diagnostics,
                    stream_failed: false,
                    inner,
                })))
            }

            Err(err) => {
                // routing data is gone with the request; the concrete path stands in for the route
                let rendered: HttpResponse = err.error_response();
                let route = snapshot.path().to_string();
                let status = rendered.status().as_u16();
                let fault = Fault::from_error(&err);
                let location = rendered
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok());

                let view = ResponseView {
                    status,
                    location,
                    fault_message: fault.message(),
                };
                let source = [tag::INTERNAL, tag::IMPLEMENTATION, tag::ERROR];
                let mut pending =
                    inner.observe(&snapshot, &route, false, view, Some((&fault, &source[..])));

                if inner.config.verbose {
                    if let Some(issue) = captured.issue {
                        pending.push(capture_note(&inner, &snapshot, &route, status, issue));
                    }
                }

                let responded = Some(OffsetDateTime::now_utc());
                for mut emission in pending {
                    emission.data.set_response_time(received, responded);
                    dispatch(&*inner.sink, emission);
                }

                Poll::Ready(Err(err))
            }
        }
    }
}

fn capture_note(
    inner: &Inner,
    snapshot: &RequestSnapshot,
    route: &str,
    status: u16,
    issue: CaptureIssue,
) -> Emission {
    let message = match issue {
        CaptureIssue::ReadFailed(err) => format!("request body read failed: {err}"),
        CaptureIssue::TooLarge => format!(
            "request body larger than {} bytes, not captured",
            payload::CAPTURE_LIMIT
        ),
    };
    inner.lifecycle(snapshot.extract(route, status), "request-payload", message)
}
