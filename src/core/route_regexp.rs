//! Route templates compiled to anchored regular expressions.
//!
//! A template mixes literal text with variables written as `{name}` or `{name:pattern}`.
//! Variables without a pattern match `[^/]+` in paths, `[^.]+` in hosts and `.*` in query
//! values. Capture groups are named positionally (`v0`, `v1`, ...) so user patterns never
//! collide with the generated names, and captures come back in declaration order.
use regex::Regex;

use crate::core::router::RouteError;

/// Which part of the request a template is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexpKind {
    /// Whole path, anchored at both ends
    Path,
    /// Path prefix, anchored at the start only
    Prefix,
    /// Host name, port ignored unless the template names one
    Host,
    /// A single `key=value` query pair
    Query,
}

impl RegexpKind {
    fn default_pattern(self) -> &'static str {
        match self {
            RegexpKind::Path | RegexpKind::Prefix => "[^/]+",
            RegexpKind::Host => "[^.]+",
            RegexpKind::Query => ".*",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRegexp {
    template: String,
    kind: RegexpKind,
    regex: Regex,
    var_names: Vec<String>,
    /// Query key for `RegexpKind::Query`
    query_key: Option<String>,
    /// Host templates that spell out a port are matched against `host:port`
    host_with_port: bool,
}

impl RouteRegexp {
    pub fn new(template: &str, kind: RegexpKind) -> Result<Self, RouteError> {
        let idxs = brace_indices(template)?;
        let default_pattern = kind.default_pattern();

        let mut pattern = String::from("^");
        let mut var_names: Vec<String> = Vec::with_capacity(idxs.len());
        let mut literal_text = String::new();
        let mut end = 0;

        for (i, (start, stop)) in idxs.iter().copied().enumerate() {
            let raw = &template[end..start];
            literal_text.push_str(raw);
            pattern.push_str(&regex::escape(raw));
            end = stop;

            let inner = &template[start + 1..stop - 1];
            let (name, var_pattern) = match inner.split_once(':') {
                Some((name, var_pattern)) => (name.trim(), var_pattern),
                None => (inner.trim(), default_pattern),
            };
            if name.is_empty() || var_pattern.is_empty() {
                return Err(RouteError::MissingVariable {
                    template: template.to_string(),
                });
            }
            if var_names.iter().any(|existing| existing == name) {
                return Err(RouteError::DuplicateVariable {
                    name: name.to_string(),
                    template: template.to_string(),
                });
            }
            pattern.push_str(&format!("(?P<v{i}>{var_pattern})"));
            var_names.push(name.to_string());
        }

        let rest = &template[end..];
        literal_text.push_str(rest);
        pattern.push_str(&regex::escape(rest));

        if kind == RegexpKind::Query && template.ends_with('=') {
            // `key=` alone accepts any value
            pattern.push_str(".*");
        }
        if kind != RegexpKind::Prefix {
            pattern.push('$');
        }

        let regex = Regex::new(&pattern).map_err(|e| RouteError::InvalidPattern {
            template: template.to_string(),
            reason: e.to_string(),
        })?;

        let query_key = match kind {
            RegexpKind::Query => Some(
                template
                    .split_once('=')
                    .map(|(key, _)| key)
                    .unwrap_or(template)
                    .to_string(),
            ),
            _ => None,
        };

        Ok(Self {
            template: template.to_string(),
            kind,
            regex,
            var_names,
            query_key,
            host_with_port: kind == RegexpKind::Host && literal_text.contains(':'),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn kind(&self) -> RegexpKind {
        self.kind
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    /// The query key a query template applies to
    pub fn query_key(&self) -> Option<&str> {
        self.query_key.as_deref()
    }

    /// Normalize a request host for matching against this template
    pub fn host_subject<'a>(&self, host: &'a str) -> &'a str {
        if self.host_with_port {
            return host;
        }
        strip_port(host)
    }

    pub fn is_match(&self, subject: &str) -> bool {
        self.regex.is_match(subject)
    }

    /// Captured variables in declaration order, or `None` when the subject does not match
    pub fn captures(&self, subject: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(subject)?;
        Some(
            self.var_names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let value = caps
                        .name(&format!("v{i}"))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    (name.clone(), value)
                })
                .collect(),
        )
    }
}

fn strip_port(host: &str) -> &str {
    // bracketed IPv6 literal
    if host.starts_with('[') {
        return match host.find(']') {
            Some(i) => &host[..=i],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Positions of the outermost `{...}` groups, so patterns may themselves contain braces
fn brace_indices(template: &str) -> Result<Vec<(usize, usize)>, RouteError> {
    let mut level = 0i32;
    let mut start = 0;
    let mut idxs = Vec::new();
    for (i, b) in template.bytes().enumerate() {
        match b {
            b'{' => {
                if level == 0 {
                    start = i;
                }
                level += 1;
            }
            b'}' => {
                level -= 1;
                if level == 0 {
                    idxs.push((start, i + 1));
                } else if level < 0 {
                    return Err(RouteError::UnbalancedBraces {
                        template: template.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    if level != 0 {
        return Err(RouteError::UnbalancedBraces {
            template: template.to_string(),
        });
    }
    Ok(idxs)
}
