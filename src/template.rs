//! Template engines for dynamic response bodies.
//!
//! Engines are registered by name. Two ship by default: `simple`, which only
//! substitutes `{{ placeholders }}`, and `handlebars` for bodies that need
//! conditionals and loops.

use crate::error::TemplateError;
use crate::matcher::RequestView;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the placeholder-substitution engine.
pub const SIMPLE_ENGINE: &str = "simple";

/// Name of the Handlebars engine.
pub const HANDLEBARS_ENGINE: &str = "handlebars";

/// A named template engine.
pub trait TemplateEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Render `template` against a JSON context.
    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, TemplateError>;
}

/// Registry of template engines keyed by name.
#[derive(Clone)]
pub struct TemplateRegistry {
    engines: HashMap<String, Arc<dyn TemplateEngine>>,
}

impl TemplateRegistry {
    /// Create a registry with the built-in engines.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SimpleEngine));
        registry.register(Arc::new(HandlebarsEngine::new()));
        registry
    }

    /// Create a registry with no engines.
    pub fn empty() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an engine, replacing any engine with the same name.
    pub fn register(&mut self, engine: Arc<dyn TemplateEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    /// Render a template with the named engine.
    pub fn render(
        &self,
        engine: &str,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let engine = self
            .engines
            .get(engine)
            .ok_or_else(|| TemplateError::UnknownEngine(engine.to_string()))?;
        engine.render(template, context)
    }

    /// Registered engine names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Context for template rendering.
#[derive(Debug, Serialize, Default)]
pub struct TemplateContext {
    /// Path variables from the matched pattern
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers, names lower-cased
    pub headers: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub request_path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl TemplateContext {
    /// Assemble the context for a routed request.
    pub fn from_request(view: &RequestView<'_>) -> Self {
        Self {
            path: view.bindings.clone(),
            query: view.request.query.clone(),
            headers: view
                .request
                .headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            method: view.request.method.clone(),
            request_path: view.request.path.clone(),
            body: view.body_text().map(String::from),
            json: view.body_json().cloned(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Placeholder substitution without control flow.
///
/// `{{ a.b.c }}` is replaced by the context value at that dotted path, or by
/// a built-in (`uuid`, `now`, `timestamp`, `randomInt`). Anything it cannot
/// resolve is left in place untouched, so rendering never fails.
pub struct SimpleEngine;

impl TemplateEngine for SimpleEngine {
    fn name(&self) -> &str {
        SIMPLE_ENGINE
    }

    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };

            let key = after[..end].trim();
            match lookup(context, key).or_else(|| builtin(key)) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

fn lookup(context: &serde_json::Value, key: &str) -> Option<String> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }

    let mut current = context;
    for part in key.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(match current {
        serde_json::Value::Null => String::new(),
        other => crate::matcher::json_text(other),
    })
}

fn builtin(key: &str) -> Option<String> {
    use rand::Rng;

    match key {
        "uuid" => Some(random_uuid()),
        "now" => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        "timestamp" => Some(chrono::Utc::now().timestamp_millis().to_string()),
        "randomInt" => Some(rand::thread_rng().gen_range(0..=100).to_string()),
        _ => None,
    }
}

/// Handlebars templates with the mock helpers registered.
pub struct HandlebarsEngine {
    handlebars: Handlebars<'static>,
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Response bodies are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn name(&self) -> &str {
        HANDLEBARS_ENGINE
    }

    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, TemplateError> {
        self.handlebars
            .render_template(template, context)
            .map_err(|e| TemplateError::Render {
                engine: HANDLEBARS_ENGINE.to_string(),
                message: e.to_string(),
            })
    }
}

fn random_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    )
}

// Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) => {
            // Pretty print JSON text, pass anything else through
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json) => out.write(&serde_json::to_string_pretty(&json).unwrap_or_default())?,
                Err(_) => out.write(s)?,
            }
        }
        Some(value) => out.write(&value.to_string())?,
        None => {}
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&random_uuid())?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(v) if !v.is_null() && !v.is_string() => out.write(&v.to_string())?,
        _ => out.write(default)?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
