//! Configuration for the simulation engine.
//!
//! Defines endpoints, their candidate responses, matching rules and global
//! settings. Documents are YAML (JSON is accepted as well). Unknown fields
//! are ignored so documents written for newer versions still load.

use crate::router::PathPattern;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// A complete, validated configuration.
///
/// Immutable once loaded; a reload always builds a new value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Endpoint definitions, in matching order
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Configuration {
    /// Decode a configuration document and normalize it.
    ///
    /// Accepts either a mapping with `settings`/`endpoints` or a bare
    /// sequence of endpoints. An empty document yields an empty configuration.
    /// The result is not validated; call [`Configuration::validate`].
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        let doc: serde_yaml::Value = serde_yaml::from_slice(bytes)?;
        let mut config = match doc {
            serde_yaml::Value::Null => Self::default(),
            serde_yaml::Value::Sequence(_) => Self {
                settings: Settings::default(),
                endpoints: serde_yaml::from_value(doc)?,
            },
            other => serde_yaml::from_value(other)?,
        };
        config.normalize();
        Ok(config)
    }

    /// Load and validate configuration from a YAML or JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read(path)?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut keys = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let key = endpoint.key();
            endpoint
                .validate()
                .map_err(|e| anyhow::anyhow!("Endpoint {} ({}): {}", i, key, e))?;
            if !keys.insert(key.clone()) {
                anyhow::bail!("Endpoint {}: duplicate endpoint key {}", i, key);
            }
        }
        Ok(())
    }

    /// Find an endpoint by its identity key.
    pub fn endpoint(&self, key: &EndpointKey) -> Option<(usize, &Endpoint)> {
        self.endpoints
            .iter()
            .enumerate()
            .find(|(_, e)| e.method == key.method && e.path_pattern == key.path_pattern)
    }

    fn normalize(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.normalize();
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Delay applied when a response defines none of its own
    #[serde(default)]
    pub default_delay_ms: u64,

    /// Content type added when a response does not set one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Log every matched request
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_delay_ms: 0,
            default_content_type: default_content_type(),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_true() -> bool {
    true
}

/// Identity of an endpoint: upper-cased method plus normalized path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub method: String,
    pub path_pattern: String,
}

impl EndpointKey {
    pub fn new(method: &str, path_pattern: &str) -> Self {
        Self {
            method: method.trim().to_uppercase(),
            path_pattern: normalize_path(path_pattern),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path_pattern)
    }
}

/// How an endpoint picks one of its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Operator-selected response, or the default
    #[default]
    Manual,
    /// Cycle through responses in order
    Sequence,
    /// First response whose matchers pass, or the default
    Conditional,
}

/// A single endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Path pattern with `{name}` variables
    pub path_pattern: String,

    /// Pattern as originally authored, before normalization
    #[serde(default)]
    pub original_path_pattern: Option<String>,

    /// HTTP method
    pub method: String,

    /// Response selection policy
    #[serde(default)]
    pub selection_policy: SelectionPolicy,

    /// Candidate responses, in declaration order
    #[serde(default)]
    pub responses: Vec<Response>,

    /// Rules the request must satisfy for this endpoint to apply
    #[serde(default)]
    pub matchers: Vec<Rule>,
}

impl Endpoint {
    /// Identity key of this endpoint.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            method: self.method.clone(),
            path_pattern: self.path_pattern.clone(),
        }
    }

    /// The response flagged `isDefault`, else the first declared one.
    pub fn default_response(&self) -> Option<&Response> {
        self.responses
            .iter()
            .find(|r| r.is_default)
            .or_else(|| self.responses.first())
    }

    /// Look up a response by id.
    pub fn response(&self, id: &str) -> Option<&Response> {
        self.responses.iter().find(|r| r.id == id)
    }

    /// Validate the endpoint definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.method.is_empty() {
            anyhow::bail!("method cannot be empty");
        }
        PathPattern::parse(&self.path_pattern)?;

        for rule in &self.matchers {
            rule.validate()?;
        }

        let mut ids = HashSet::new();
        let mut defaults = 0;
        for response in &self.responses {
            response
                .validate()
                .map_err(|e| anyhow::anyhow!("Response {}: {}", response.id, e))?;
            if !ids.insert(response.id.as_str()) {
                anyhow::bail!("duplicate response id {}", response.id);
            }
            if response.is_default {
                defaults += 1;
            }
        }
        if defaults > 1 {
            anyhow::bail!("{} responses are marked isDefault, at most one allowed", defaults);
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if self.original_path_pattern.is_none() {
            self.original_path_pattern = Some(self.path_pattern.clone());
        }
        self.path_pattern = normalize_path(&self.path_pattern);
        self.method = self.method.trim().to_uppercase();
    }
}

/// A candidate response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Identifier, unique within the endpoint
    pub id: String,

    /// Whether this is the endpoint's default response
    #[serde(default)]
    pub is_default: bool,

    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Static body, used verbatim
    #[serde(default, deserialize_with = "canonical_body")]
    pub body: Option<String>,

    /// Body template, rendered per request
    #[serde(default, deserialize_with = "canonical_body")]
    pub body_template: Option<String>,

    /// Template engine name
    #[serde(default = "default_template_engine")]
    pub template_engine: String,

    /// Delay in milliseconds
    #[serde(default)]
    pub static_delay_ms: u64,

    /// Rules gating `staticDelayMs`
    #[serde(default)]
    pub delay_conditions: Vec<Rule>,

    /// Rules used by the conditional selection policy
    #[serde(default)]
    pub matchers: Vec<Rule>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub category: Option<String>,
}

fn default_status() -> u16 {
    200
}

fn default_template_engine() -> String {
    crate::template::SIMPLE_ENGINE.to_string()
}

impl Response {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("response id cannot be empty");
        }
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        for rule in self.delay_conditions.iter().chain(&self.matchers) {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Body content as written in the document: literal text or structured data.
#[derive(Deserialize)]
#[serde(untagged)]
enum BodyContent {
    Text(String),
    Structured(serde_json::Value),
}

impl BodyContent {
    fn into_canonical(self) -> String {
        match self {
            BodyContent::Text(text) => text,
            BodyContent::Structured(value) => value.to_string(),
        }
    }
}

fn canonical_body<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BodyContent>::deserialize(deserializer)?.map(BodyContent::into_canonical))
}

fn scalar_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<serde_json::Value>::deserialize(deserializer)?.map(|value| match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }),
    )
}

/// Which part of the request a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Header,
    #[serde(alias = "query")]
    QueryParam,
    PathVariable,
    Body,
    Method,
    Path,
    #[serde(other)]
    Unknown,
}

impl RuleKind {
    fn requires_name(self) -> bool {
        matches!(
            self,
            RuleKind::Header | RuleKind::QueryParam | RuleKind::PathVariable
        )
    }
}

/// Comparison applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[default]
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Exists,
    #[serde(other)]
    Unknown,
}

/// A matchable condition against one part of a request.
///
/// Used both as an endpoint/response matcher and as a delay condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub kind: RuleKind,

    /// Header, query parameter, path variable or body field name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "scalar_text")]
    pub value: Option<String>,

    /// Regular expression for the `regex` operator
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub operator: Operator,

    #[serde(default)]
    pub case_sensitive: bool,

    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl Rule {
    /// Create a required, case-insensitive rule.
    pub fn new(kind: RuleKind, operator: Operator) -> Self {
        Self {
            kind,
            name: None,
            value: None,
            pattern: None,
            operator,
            case_sensitive: false,
            required: true,
            compiled: OnceLock::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self.compiled = OnceLock::new();
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self.compiled = OnceLock::new();
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// The compiled full-match regex for this rule, if it has a valid one.
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| {
                let source = self.pattern.as_deref().or(self.value.as_deref())?;
                build_regex(source, self.case_sensitive).ok()
            })
            .as_ref()
    }

    /// Validate the rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kind.requires_name() && self.name.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("{:?} rule requires a name", self.kind);
        }
        if self.operator == Operator::Regex {
            let source = self
                .pattern
                .as_deref()
                .or(self.value.as_deref())
                .ok_or_else(|| anyhow::anyhow!("regex rule requires a pattern"))?;
            build_regex(source, self.case_sensitive)
                .map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        }
        Ok(())
    }
}

fn build_regex(source: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{})$", source))
        .case_insensitive(!case_sensitive)
        .build()
}

/// Normalize a path or path pattern: leading `/`, no trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_document() {
        let yaml = r#"
settings:
  defaultDelayMs: 25
endpoints:
  - pathPattern: /users/{id}/
    method: get
    selectionPolicy: sequence
    responses:
      - id: r1
        status: 200
        body: "hello"
      - id: r2
        isDefault: true
        status: 404
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.settings.default_delay_ms, 25);

        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.path_pattern, "/users/{id}");
        assert_eq!(endpoint.original_path_pattern.as_deref(), Some("/users/{id}/"));
        assert_eq!(endpoint.selection_policy, SelectionPolicy::Sequence);
        assert_eq!(endpoint.default_response().unwrap().id, "r2");
        assert_eq!(endpoint.responses[0].template_engine, "simple");
    }

    #[test]
    fn test_parse_bare_sequence() {
        let yaml = r#"
- pathPattern: /health
  method: GET
  responses:
    - id: ok
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].selection_policy, SelectionPolicy::Manual);
        assert_eq!(config.endpoints[0].responses[0].status, 200);
    }

    #[test]
    fn test_empty_document() {
        let config = Configuration::parse(b"").unwrap();
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_structured_body_is_canonicalized() {
        let yaml = r#"
endpoints:
  - pathPattern: /items
    method: GET
    responses:
      - id: list
        body:
          items: [1, 2]
        bodyTemplate:
          id: "{{path.id}}"
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        let response = &config.endpoints[0].responses[0];
        assert_eq!(response.body.as_deref(), Some(r#"{"items":[1,2]}"#));
        assert_eq!(response.body_template.as_deref(), Some(r#"{"id":"{{path.id}}"}"#));
    }

    #[test]
    fn test_json_document_with_unknown_fields() {
        let json = r#"{
            "endpoints": [{
                "pathPattern": "/ping",
                "method": "POST",
                "owner": "team-a",
                "responses": [{"id": "pong", "status": 201, "color": "blue"}]
            }]
        }"#;
        let config = Configuration::parse(json.as_bytes()).unwrap();
        assert_eq!(config.endpoints[0].responses[0].status, 201);
    }

    #[test]
    fn test_duplicate_endpoint_keys_rejected() {
        let yaml = r#"
endpoints:
  - pathPattern: /a
    method: GET
  - pathPattern: /a/
    method: get
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate endpoint key GET /a"));
    }

    #[test]
    fn test_same_path_different_method_allowed() {
        let yaml = r#"
endpoints:
  - pathPattern: /a
    method: GET
  - pathPattern: /a
    method: POST
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_response_ids_rejected() {
        let yaml = r#"
endpoints:
  - pathPattern: /a
    method: GET
    responses:
      - id: r1
      - id: r1
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiple_defaults_rejected() {
        let yaml = r#"
endpoints:
  - pathPattern: /a
    method: GET
    responses:
      - id: r1
        isDefault: true
      - id: r2
        isDefault: true
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_status_rejected() {
        let yaml = r#"
endpoints:
  - pathPattern: /a
    method: GET
    responses:
      - id: r1
        status: 700
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
endpoints:
  - pathPattern: /search
    method: GET
    matchers:
      - kind: query-param
        name: limit
        value: 10
        operator: equals
      - kind: header
        name: X-Trace
        operator: exists
        required: false
      - kind: body
        operator: fuzzy
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        config.validate().unwrap();
        let rules = &config.endpoints[0].matchers;
        assert_eq!(rules[0].kind, RuleKind::QueryParam);
        assert_eq!(rules[0].value.as_deref(), Some("10"));
        assert!(rules[0].required);
        assert!(!rules[0].case_sensitive);
        assert!(!rules[1].required);
        assert_eq!(rules[2].operator, Operator::Unknown);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let rule = Rule::new(RuleKind::Path, Operator::Regex).with_pattern("/users/(");
        assert!(rule.validate().is_err());
        assert!(rule.regex().is_none());
    }

    #[test]
    fn test_named_kind_requires_name() {
        let rule = Rule::new(RuleKind::Header, Operator::Exists);
        assert!(rule.validate().is_err());
        assert!(rule.named("X-Slow").validate().is_ok());
    }

    #[test]
    fn test_malformed_path_pattern_rejected() {
        let yaml = r#"
endpoints:
  - pathPattern: /users/{id
    method: GET
"#;
        let config = Configuration::parse(yaml.as_bytes()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("users/"), "/users");
        assert_eq!(normalize_path("/users/{id}"), "/users/{id}");
    }

    #[test]
    fn test_endpoint_key_display() {
        let key = EndpointKey::new("get", "/users/{id}/");
        assert_eq!(key.to_string(), "GET /users/{id}");
    }
}
