//! Path routing.
//!
//! Compiles endpoint path patterns such as `/users/{id}` and resolves an
//! incoming method and path to the first endpoint whose pattern fits.

use crate::config::Endpoint;
use crate::matcher::percent_decode;
use std::collections::HashMap;
use tracing::warn;

/// Path variable values extracted from a matched request path.
pub type PathBinding = HashMap<String, String>;

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `prefix{name}suffix`, binding exactly one path segment
    Variable {
        name: String,
        prefix: String,
        suffix: String,
    },
}

impl PathPattern {
    /// Parse a path pattern. Each `/`-separated segment holds at most one variable.
    pub fn parse(pattern: &str) -> anyhow::Result<Self> {
        let mut segments = Vec::new();
        let mut names = Vec::new();

        for raw in split_segments(pattern) {
            let Some(open) = raw.find('{') else {
                if raw.contains('}') {
                    anyhow::bail!("unbalanced '}}' in segment '{}'", raw);
                }
                segments.push(Segment::Literal(raw.to_string()));
                continue;
            };

            let close = raw[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| anyhow::anyhow!("unterminated variable in segment '{}'", raw))?;
            let name = &raw[open + 1..close];
            let suffix = &raw[close + 1..];
            if name.is_empty() || name.contains('{') {
                anyhow::bail!("invalid variable name in segment '{}'", raw);
            }
            if suffix.contains('{') || suffix.contains('}') {
                anyhow::bail!("segment '{}' holds more than one variable", raw);
            }
            if names.contains(&name) {
                anyhow::bail!("variable '{}' appears more than once", name);
            }
            names.push(name);

            segments.push(Segment::Variable {
                name: name.to_string(),
                prefix: raw[..open].to_string(),
                suffix: suffix.to_string(),
            });
        }

        Ok(Self { segments })
    }

    /// Match pre-split path segments, returning the variable bindings.
    pub fn matches<S: AsRef<str>>(&self, path: &[S]) -> Option<PathBinding> {
        if path.len() != self.segments.len() {
            return None;
        }

        let mut bindings = PathBinding::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            let actual = actual.as_ref();
            match segment {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Variable {
                    name,
                    prefix,
                    suffix,
                } => {
                    if actual.len() <= prefix.len() + suffix.len()
                        || !actual.starts_with(prefix.as_str())
                        || !actual.ends_with(suffix.as_str())
                    {
                        return None;
                    }
                    let value = &actual[prefix.len()..actual.len() - suffix.len()];
                    bindings.insert(name.clone(), percent_decode(value, false));
                }
            }
        }

        Some(bindings)
    }
}

/// Split a path into its non-empty segments.
fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// An endpoint selected by the router.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// Position of the endpoint in the configuration
    pub index: usize,
    pub endpoint: &'a Endpoint,
    pub bindings: PathBinding,
}

#[derive(Debug)]
struct CompiledRoute {
    method: String,
    pattern: PathPattern,
    index: usize,
}

/// Router over a configuration's endpoints, in declaration order.
#[derive(Debug)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Compile the path patterns of the given endpoints.
    pub fn new(endpoints: &[Endpoint]) -> Self {
        let routes = endpoints
            .iter()
            .enumerate()
            .filter_map(|(index, endpoint)| match PathPattern::parse(&endpoint.path_pattern) {
                Ok(pattern) => Some(CompiledRoute {
                    method: endpoint.method.clone(),
                    pattern,
                    index,
                }),
                Err(e) => {
                    warn!(
                        endpoint = %endpoint.key(),
                        error = %e,
                        "Skipping endpoint with invalid path pattern"
                    );
                    None
                }
            })
            .collect();

        Self { routes }
    }

    /// Every endpoint whose method and path shape fit, in declaration order.
    ///
    /// The iterator only borrows the router and the endpoints; `method` and
    /// `path` are copied.
    pub fn candidates<'a>(
        &'a self,
        endpoints: &'a [Endpoint],
        method: &str,
        path: &str,
    ) -> impl Iterator<Item = RouteMatch<'a>> + 'a {
        let method = method.to_string();
        let segments: Vec<String> = split_segments(path).into_iter().map(String::from).collect();
        self.routes
            .iter()
            .filter(move |route| route.method.eq_ignore_ascii_case(&method))
            .filter_map(move |route| {
                let bindings = route.pattern.matches(segments.as_slice())?;
                let endpoint = endpoints.get(route.index)?;
                Some(RouteMatch {
                    index: route.index,
                    endpoint,
                    bindings,
                })
            })
    }

    /// The first endpoint fitting the method and path.
    pub fn resolve<'a>(
        &'a self,
        endpoints: &'a [Endpoint],
        method: &str,
        path: &str,
    ) -> Option<RouteMatch<'a>> {
        self.candidates(endpoints, method, path).next()
    }
}
