#![expect(
    clippy::module_name_repetitions,
    reason = "Config suffix is intentional for clarity"
)]

use std::collections::BTreeMap;
use std::time::Duration;

use bon::Builder;
use reqwest::Method;
use serde_json::Value;

/// Retries after the initial attempt when nothing else is configured.
pub const DEFAULT_RETRIES: u32 = 3;

/// Effective HTTP configuration of one call.
///
/// Maps are ordered so that equal configurations always produce the same cache key.
#[derive(Debug, Clone, PartialEq, Builder)]
#[non_exhaustive]
pub struct RequestConfig {
    #[builder(default = Method::GET)]
    pub method: Method,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    #[builder(default)]
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Per-attempt timeout; the client default applies when absent
    pub timeout: Option<Duration>,
    /// Retries after the initial attempt, so `3` allows four attempts in total
    #[builder(default = DEFAULT_RETRIES)]
    pub retries: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-call changes applied on top of a call site's base [`RequestConfig`].
///
/// Header and query entries are merged key by key; every other field replaces the base value.
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[non_exhaustive]
pub struct RequestOverrides {
    pub method: Option<Method>,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    #[builder(default)]
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOverrides {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl RequestConfig {
    #[must_use]
    pub fn merge(&self, overrides: &RequestOverrides) -> RequestConfig {
        let mut merged = self.clone();

        if let Some(method) = &overrides.method {
            merged.method = method.clone();
        }
        merged.headers.extend(
            overrides
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
            .query
            .extend(overrides.query.iter().map(|(k, v)| (k.clone(), v.clone())));
        if overrides.body.is_some() {
            merged.body.clone_from(&overrides.body);
        }
        merged.timeout = overrides.timeout.or(merged.timeout);
        merged.retries = overrides.retries.unwrap_or(merged.retries);

        merged
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults() {
        let config = RequestConfig::default();

        assert_eq!(config.method, Method::GET);
        assert_eq!(config.retries, 3);
        assert!(config.headers.is_empty());
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn merge_overrides_fields_and_extends_maps() {
        let base = RequestConfig::builder()
            .headers(BTreeMap::from([
                ("x-client".to_owned(), "dashboard".to_owned()),
                ("x-page".to_owned(), "portfolio".to_owned()),
            ]))
            .query(BTreeMap::from([("limit".to_owned(), "10".to_owned())]))
            .retries(1)
            .build();
        let overrides = RequestOverrides::builder()
            .method(Method::POST)
            .headers(BTreeMap::from([("x-page".to_owned(), "orders".to_owned())]))
            .query(BTreeMap::from([("offset".to_owned(), "20".to_owned())]))
            .body(json!({"symbol": "AAPL"}))
            .build();

        let merged = base.merge(&overrides);

        assert_eq!(merged.method, Method::POST);
        assert_eq!(merged.headers["x-client"], "dashboard");
        assert_eq!(merged.headers["x-page"], "orders");
        assert_eq!(merged.query.len(), 2);
        assert_eq!(merged.body, Some(json!({"symbol": "AAPL"})));
        assert_eq!(merged.retries, 1, "retries are kept unless overridden");
    }

    #[test]
    fn empty_overrides_leave_config_untouched() {
        let base = RequestConfig::builder()
            .timeout(Duration::from_secs(5))
            .build();
        let overrides = RequestOverrides::default();

        assert!(overrides.is_empty());
        assert_eq!(base.merge(&overrides), base);
    }
}
