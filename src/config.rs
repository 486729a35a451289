use std::collections::BTreeSet;

use serde_json::Value;

/// Tag attached to every emission when no `tags` option is given.
pub const DEFAULT_TAG: &str = "detailed-response";

/// Errors raised while reading option text.
///
/// Option values never fail: malformed values resolve to their falsy or empty
/// form. Only text that is not JSON at all, or an exclusion pattern that is
/// not a valid regex, is reported.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("options are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid exclusion pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// Resolved middleware options.
///
/// Built once when the middleware is constructed and shared read-only by all
/// requests afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Status codes that are never logged.
    pub exclude_status: BTreeSet<u16>,
    /// Fault notifications must carry at least one of these tags. Empty means no filter.
    pub required_tags: BTreeSet<String>,
    pub include_id: bool,
    /// Drop 401 faults raised by an authentication strategy in `try` mode.
    pub ignore_unauthorized_try: bool,
    /// Merge the fault notification's own tags into the emitted tags.
    pub include_event_tags: bool,
    pub request_payload: bool,
    pub request_headers: bool,
    /// Log every completed request, not only redirects and not-found.
    pub requests: bool,
    /// Base tags carried by every emission.
    pub tags: Vec<String>,
    /// Emit low-level lifecycle diagnostics as well.
    pub verbose: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            exclude_status: BTreeSet::new(),
            required_tags: BTreeSet::new(),
            include_id: false,
            ignore_unauthorized_try: false,
            include_event_tags: false,
            request_payload: false,
            request_headers: false,
            requests: false,
            tags: vec![DEFAULT_TAG.to_string()],
            verbose: false,
        }
    }
}

impl PluginConfig {
    /// Merge caller options (camelCase keys) over the defaults.
    ///
    /// Unknown keys are ignored. A known key holding a value of the wrong
    /// shape resolves to `false` or an empty set instead of failing.
    ///
    /// ```rust
    /// use actix_web_middleware_detailed_response::PluginConfig;
    /// use serde_json::json;
    ///
    /// let config = PluginConfig::resolve(&json!({
    ///     "excludeStatus": [400],
    ///     "requests": true,
    ///     "somethingElse": 1,
    /// }));
    /// assert!(config.exclude_status.contains(&400));
    /// assert!(config.requests);
    /// assert_eq!(config.tags, vec!["detailed-response".to_string()]);
    /// ```
    pub fn resolve(options: &Value) -> PluginConfig {
        let mut config = PluginConfig::default();
        let Some(options) = options.as_object() else {
            return config;
        };

        if let Some(value) = options.get("excludeStatus") {
            config.exclude_status = status_set(value);
        }
        if let Some(value) = options.get("requiredTags") {
            config.required_tags = string_list(value).into_iter().collect();
        }
        if let Some(value) = options.get("includeId") {
            config.include_id = flag(value);
        }
        if let Some(value) = options.get("ignoreUnauthorizedTry") {
            config.ignore_unauthorized_try = flag(value);
        }
        if let Some(value) = options.get("includeEventTags") {
            config.include_event_tags = flag(value);
        }
        if let Some(value) = options.get("requestPayload") {
            config.request_payload = flag(value);
        }
        if let Some(value) = options.get("requestHeaders") {
            config.request_headers = flag(value);
        }
        if let Some(value) = options.get("requests") {
            config.requests = flag(value);
        }
        if let Some(value) = options.get("tags") {
            config.tags = string_list(value);
        }
        if let Some(value) = options.get("verbose") {
            config.verbose = flag(value);
        }

        config
    }

    /// Parse option text as JSON and [`resolve`](PluginConfig::resolve) it.
    pub fn from_json_str(options: &str) -> Result<PluginConfig, ConfigError> {
        let value: Value = serde_json::from_str(options)?;
        Ok(PluginConfig::resolve(&value))
    }
}

fn flag(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

fn status_set(value: &Value) -> BTreeSet<u16> {
    let Some(items) = value.as_array() else {
        return BTreeSet::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter_map(|code| u16::try_from(code).ok())
        .collect()
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        // a lone string is treated as a one-element list
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = PluginConfig::resolve(&json!({}));
        assert_eq!(config, PluginConfig::default());
        assert!(config.exclude_status.is_empty());
        assert!(config.required_tags.is_empty());
        assert_eq!(config.tags, vec!["detailed-response".to_string()]);
        assert!(!config.include_id);
        assert!(!config.requests);
        assert!(!config.verbose);
    }

    #[test]
    fn test_known_keys_override_defaults() {
        let config = PluginConfig::resolve(&json!({
            "excludeStatus": [400, 503],
            "requiredTags": ["handler"],
            "includeId": true,
            "ignoreUnauthorizedTry": true,
            "includeEventTags": true,
            "requestPayload": true,
            "requestHeaders": true,
            "requests": true,
            "tags": ["api", "access"],
            "verbose": true,
        }));

        assert_eq!(config.exclude_status, BTreeSet::from([400, 503]));
        assert_eq!(config.required_tags, BTreeSet::from(["handler".to_string()]));
        assert!(config.include_id);
        assert!(config.ignore_unauthorized_try);
        assert!(config.include_event_tags);
        assert!(config.request_payload);
        assert!(config.request_headers);
        assert!(config.requests);
        assert_eq!(config.tags, vec!["api".to_string(), "access".to_string()]);
        assert!(config.verbose);
    }

    #[test]
    fn test_malformed_values_are_falsy() {
        let config = PluginConfig::resolve(&json!({
            "excludeStatus": "400",
            "requiredTags": 12,
            "includeId": "yes",
            "requests": 1,
            "tags": {"a": 1},
            "unknown": [1, 2, 3],
        }));

        assert!(config.exclude_status.is_empty());
        assert!(config.required_tags.is_empty());
        assert!(!config.include_id);
        assert!(!config.requests);
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_mixed_status_entries() {
        let config = PluginConfig::resolve(&json!({
            "excludeStatus": [404, "302", -1, 70000, null],
            "tags": "single",
        }));
        assert_eq!(config.exclude_status, BTreeSet::from([302, 404]));
        assert_eq!(config.tags, vec!["single".to_string()]);
    }

    #[test]
    fn test_non_object_options() {
        assert_eq!(PluginConfig::resolve(&json!(null)), PluginConfig::default());
        assert_eq!(PluginConfig::resolve(&json!([1])), PluginConfig::default());
    }

    #[test]
    fn test_from_json_str() {
        let config = PluginConfig::from_json_str(r#"{"verbose": true}"#).unwrap();
        assert!(config.verbose);

        let err = PluginConfig::from_json_str("{verbose").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        assert!(err.to_string().starts_with("options are not valid JSON"));
    }
}
