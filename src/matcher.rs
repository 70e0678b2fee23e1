//! Rule evaluation.
//!
//! Evaluates a single [`Rule`] against one value taken from a request, and
//! rule lists against a whole request.

use crate::config::{Operator, Rule, RuleKind};
use crate::engine::MockRequest;
use crate::router::PathBinding;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A request as seen by rules: the inbound request plus its path bindings.
pub struct RequestView<'a> {
    pub request: &'a MockRequest,
    pub bindings: &'a PathBinding,
    json: OnceLock<Option<serde_json::Value>>,
}

impl<'a> RequestView<'a> {
    pub fn new(request: &'a MockRequest, bindings: &'a PathBinding) -> Self {
        Self {
            request,
            bindings,
            json: OnceLock::new(),
        }
    }

    /// Request body as text, if non-empty and UTF-8.
    pub fn body_text(&self) -> Option<&'a str> {
        if self.request.body.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.request.body).ok()
    }

    /// Request body parsed as JSON, if it is JSON. Parsed at most once.
    pub fn body_json(&self) -> Option<&serde_json::Value> {
        self.json
            .get_or_init(|| self.body_text().and_then(|s| serde_json::from_str(s).ok()))
            .as_ref()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Extract the value a rule inspects, or `None` when it is absent.
    pub fn value_for(&self, rule: &Rule) -> Option<Cow<'_, str>> {
        let name = rule.name.as_deref();
        match rule.kind {
            RuleKind::Header => self.header(name?).map(Cow::Borrowed),
            RuleKind::QueryParam => self
                .request
                .query
                .get(name?)
                .map(|v| Cow::Borrowed(v.as_str())),
            RuleKind::PathVariable => self.bindings.get(name?).map(|v| Cow::Borrowed(v.as_str())),
            RuleKind::Method => Some(Cow::Borrowed(self.request.method.as_str())),
            RuleKind::Path => Some(Cow::Borrowed(self.request.path.as_str())),
            RuleKind::Body => match name {
                None => self.body_text().map(Cow::Borrowed),
                Some(field) => {
                    let json = self.body_json()?;
                    json_field(json, field).map(Cow::Owned)
                }
            },
            RuleKind::Unknown => None,
        }
    }
}

/// Evaluate a rule against a value.
///
/// An absent value only satisfies an optional `exists` rule. Unknown
/// operators never match.
pub fn evaluate(rule: &Rule, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return rule.operator == Operator::Exists && !rule.required;
    };

    match rule.operator {
        Operator::Exists => true,
        Operator::Regex => rule.regex().is_some_and(|re| re.is_match(actual)),
        Operator::Unknown => false,
        op => {
            let expected = rule.value.as_deref().unwrap_or("");
            let (actual, expected): (Cow<'_, str>, Cow<'_, str>) = if rule.case_sensitive {
                (Cow::Borrowed(actual), Cow::Borrowed(expected))
            } else {
                (
                    Cow::Owned(actual.to_lowercase()),
                    Cow::Owned(expected.to_lowercase()),
                )
            };
            match op {
                Operator::Equals => actual == expected,
                Operator::Contains => actual.contains(expected.as_ref()),
                Operator::StartsWith => actual.starts_with(expected.as_ref()),
                Operator::EndsWith => actual.ends_with(expected.as_ref()),
                _ => false,
            }
        }
    }
}

/// Evaluate a rule against the request.
pub fn evaluate_request(rule: &Rule, request: &RequestView<'_>) -> bool {
    let value = request.value_for(rule);
    evaluate(rule, value.as_deref())
}

/// True when every required rule passes. Non-required rules are advisory.
pub fn matches_all(rules: &[Rule], request: &RequestView<'_>) -> bool {
    rules
        .iter()
        .filter(|rule| rule.required)
        .all(|rule| evaluate_request(rule, request))
}

/// Resolve a field of a JSON body: `$`-prefixed JSONPath or a dotted path.
fn json_field(json: &serde_json::Value, field: &str) -> Option<String> {
    if field.starts_with('$') {
        use jsonpath_rust::JsonPath;

        let path = JsonPath::try_from(field).ok()?;
        let found = match path.find(json) {
            serde_json::Value::Array(mut items) => {
                if items.is_empty() {
                    return None;
                }
                items.swap_remove(0)
            }
            serde_json::Value::Null => return None,
            other => other,
        };
        return Some(json_text(&found));
    }

    let mut current = json;
    for part in field.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        return None;
    }
    Some(json_text(current))
}

/// Text form of a JSON value: strings unquoted, everything else as JSON.
pub fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a query string into key-value pairs. The first occurrence of a key wins.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params
            .entry(percent_decode(key, true))
            .or_insert_with(|| percent_decode(value, true));
    }

    params
}

/// Percent-decode a URL component. `+` becomes a space when `plus_as_space` is set.
pub fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                out.push((hex_value(bytes[i + 1]) << 4) | hex_value(bytes[i + 2]));
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}
