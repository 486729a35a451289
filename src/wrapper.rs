use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::classify::{Severity, Tags};
use crate::context::RequestContext;

/// One record handed to the log sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub tags: Tags,
    pub severity: Option<Severity>,
    pub data: RequestContext,
}

/// Destination of emitted records.
///
/// Sinks own formatting and delivery. `emit` is called on the request's own
/// task and must hand the record off without waiting on delivery.
pub trait Sink {
    fn emit(&self, emission: Emission);
}

impl<F> Sink for F
where
    F: Fn(Emission),
{
    fn emit(&self, emission: Emission) {
        self(emission)
    }
}

/// Sink that drops everything. Used when the `log` feature is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Sink for Discard {
    fn emit(&self, _emission: Emission) {}
}

/// Forward `emission` to `sink`; a panicking sink never reaches the request.
pub(crate) fn dispatch(sink: &dyn Sink, emission: Emission) {
    if catch_unwind(AssertUnwindSafe(|| sink.emit(emission))).is_err() {
        #[cfg(feature = "log")]
        log::warn!("detailed-response sink panicked, record dropped");
    }
}

#[cfg(feature = "log")]
pub use self::rust_log::LogSink;

#[cfg(feature = "log")]
pub mod rust_log {
    use std::borrow::Cow;
    use std::panic::Location;

    use serde_json::Value;

    use super::{Emission, Sink};
    use crate::classify::Severity;

    /// Sink writing records through the `log` facade.
    ///
    /// The record message is the classified message; every top-level field
    /// of the data and the tag list become key/values. Nested values are
    /// rendered as JSON.
    #[derive(Debug, Clone)]
    pub struct LogSink {
        target: Cow<'static, str>,
    }

    impl LogSink {
        pub fn new(target: impl Into<Cow<'static, str>>) -> Self {
            LogSink {
                target: target.into(),
            }
        }

        pub fn target(&self) -> &str {
            &self.target
        }
    }

    impl Default for LogSink {
        fn default() -> Self {
            LogSink::new("actix_web_middleware_detailed_response::logger")
        }
    }

    impl Sink for LogSink {
        fn emit(&self, emission: Emission) {
            log(
                level(emission.severity),
                &self.target,
                module_path!(),
                Location::caller(),
                &emission,
            );
        }
    }

    pub fn level(severity: Option<Severity>) -> log::Level {
        match severity {
            Some(Severity::ServerError) => log::Level::Error,
            Some(Severity::UserError) | Some(Severity::NotFound) => log::Level::Warn,
            Some(Severity::Redirect) | None => log::Level::Info,
            Some(Severity::Lifecycle) => log::Level::Debug,
        }
    }

    pub(crate) fn render_fields(emission: &Emission) -> Vec<(String, Option<String>)> {
        let mut fields = vec![(
            "tags".to_string(),
            Some(Value::from_iter(emission.tags.iter()).to_string()),
        )];

        if let Ok(Value::Object(map)) = serde_json::to_value(&emission.data) {
            fields.extend(map.into_iter().map(|(key, value)| {
                let value = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                };
                (key, value)
            }));
        }
        fields
    }

    pub fn log(
        level: log::Level,
        target: &str,
        module_path: &'static str,
        loc: &'static Location,
        emission: &Emission,
    ) {
        if !log::log_enabled!(target: target, level) {
            return;
        }

        let fields = render_fields(emission);
        let kvs: Vec<(&str, log::kv::Value)> = fields
            .iter()
            .map(|(k, v)| match v {
                Some(v) => (k.as_str(), log::kv::Value::from_display(v)),
                None => (k.as_str(), log::kv::Value::null()),
            })
            .collect();
        let kvs = kvs.as_slice();

        log::logger().log(
            &log::Record::builder()
                .args(format_args!("{}", emission.data.message))
                .level(level)
                .target(target)
                .module_path_static(Some(module_path))
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .key_values(&kvs)
                .build(),
        );
    }
}
