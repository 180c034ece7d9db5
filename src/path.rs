//! Path grammar and URL builder (spec.md §4.A).
//!
//! A `Template` is the normalised colon-form of a route path. It knows how
//! to `match_path` an inbound URL into a parameter map, and how to
//! `compile` a parameter map back into a URL — the same grammar serves
//! both directions, which is what lets `url()` reconstruct the path a
//! route was just matched against (spec.md §8, property 2).

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    CatchAll(String),
}

#[derive(Debug, Clone)]
pub struct Template {
    pub raw: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug)]
pub struct TemplateError(pub String);

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TemplateError {}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Normalise bracket notation (`[x]` -> `:x`, `[...x]` -> `:x*`) to colon
/// form. Either form may appear in a user-authored template; both are
/// accepted identically (spec.md §4.A).
pub fn normalize_brackets(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            let mut name = String::new();
            let mut catch_all = false;
            if chars.peek() == Some(&'.') {
                // consume "..."
                for _ in 0..3 {
                    chars.next();
                }
                catch_all = true;
            }
            while let Some(&nc) = chars.peek() {
                if nc == ']' {
                    chars.next();
                    break;
                }
                name.push(nc);
                chars.next();
            }
            out.push(':');
            out.push_str(&name);
            if catch_all {
                out.push('*');
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl Template {
    /// Parse a template (bracket or colon form) into segments, validating
    /// the grammar in spec.md §3: no duplicate parameter names, catch-all
    /// only as the final segment, and `[A-Za-z0-9_-]+` for every name.
    pub fn parse(raw: &str) -> Result<Template, TemplateError> {
        let normalized = normalize_brackets(raw);
        let trimmed = normalized.trim_matches('/');
        let mut segments = Vec::new();
        let mut seen_names: Vec<&str> = Vec::new();

        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        for (i, part) in parts.iter().enumerate() {
            if let Some(rest) = part.strip_prefix(':') {
                let (name, catch_all) = if let Some(n) = rest.strip_suffix('*') {
                    (n, true)
                } else {
                    (rest, false)
                };
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(TemplateError(format!(
                        "invalid parameter name `{}` in `{}`",
                        name, raw
                    )));
                }
                if seen_names.contains(&name) {
                    return Err(TemplateError(format!(
                        "duplicate parameter name `{}` in `{}`",
                        name, raw
                    )));
                }
                if catch_all && i != parts.len() - 1 {
                    return Err(TemplateError(format!(
                        "catch-all parameter `{}` must be the final segment in `{}`",
                        name, raw
                    )));
                }
                seen_names.push(name);
                segments.push(if catch_all {
                    Segment::CatchAll(name.to_string())
                } else {
                    Segment::Param(name.to_string())
                });
            } else {
                if part.is_empty() || !part.chars().all(is_name_char) {
                    return Err(TemplateError(format!(
                        "invalid literal segment `{}` in `{}`",
                        part, raw
                    )));
                }
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Template {
            raw: format!("/{}", trimmed),
            segments,
        })
    }

    /// Collision-detection key: every parameter name collapses to `:`
    /// (spec.md §3, §4.B.4, §8 property 1).
    pub fn shape(&self) -> String {
        let mut out = String::from("/");
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            match seg {
                Segment::Literal(l) => out.push_str(l),
                Segment::Param(_) | Segment::CatchAll(_) => out.push(':'),
            }
        }
        out
    }

    /// Match an inbound pathname, returning the parameter map on success.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let trimmed = path.trim_matches('/');
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        let mut params = HashMap::new();
        let mut pi = 0usize;

        for (si, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Literal(lit) => {
                    if parts.get(pi)? != lit {
                        return None;
                    }
                    pi += 1;
                }
                Segment::Param(name) => {
                    let value = parts.get(pi)?;
                    params.insert(name.clone(), value.to_string());
                    pi += 1;
                }
                Segment::CatchAll(name) => {
                    debug_assert_eq!(si, self.segments.len() - 1);
                    if pi >= parts.len() {
                        return None; // catch-all requires >= 1 segment
                    }
                    let joined = parts[pi..].join("/");
                    params.insert(name.clone(), joined);
                    pi = parts.len();
                }
            }
        }

        if pi == parts.len() {
            Some(params)
        } else {
            None
        }
    }

    /// Declared parameter names, in template order.
    pub fn param_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(n) | Segment::CatchAll(n) => Some(n.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Build a pathname from a parameter map. Missing parameters are an
    /// error; excess keys are ignored (callers route them to the query
    /// string instead, see `build_url`).
    pub fn compile(&self, params: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::from("/");
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            match seg {
                Segment::Literal(l) => out.push_str(l),
                Segment::Param(name) | Segment::CatchAll(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError(format!("missing parameter `{}`", name)))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// A value bound for either a path parameter or a query key. Array values
/// produce repeated query keys (spec.md §4.A).
#[derive(Debug, Clone)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Single(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Single(s)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::Multi(v)
    }
}

/// Builds outbound URLs from a template plus a value map: keys matching a
/// declared path parameter fill the path, everything else becomes a query
/// parameter; an explicit query map is merged on top (spec.md §4.A).
pub struct UrlBuilder {
    pub base: Option<String>,
}

impl UrlBuilder {
    pub fn new(base: Option<String>) -> Self {
        UrlBuilder { base }
    }

    pub fn build(
        &self,
        template: &Template,
        params: &HashMap<String, ParamValue>,
        extra_query: &HashMap<String, ParamValue>,
    ) -> Result<String, TemplateError> {
        let declared = template.param_names();
        let mut path_params = HashMap::new();
        let mut query_pairs: Vec<(String, String)> = Vec::new();

        for (key, value) in params {
            if declared.contains(&key.as_str()) {
                match value {
                    ParamValue::Single(s) => {
                        path_params.insert(key.clone(), s.clone());
                    }
                    ParamValue::Multi(values) => {
                        // A path parameter can only take one value; last wins.
                        if let Some(last) = values.last() {
                            path_params.insert(key.clone(), last.clone());
                        }
                    }
                }
            } else {
                push_query(&mut query_pairs, key, value);
            }
        }

        for (key, value) in extra_query {
            push_query(&mut query_pairs, key, value);
        }

        let path = template.compile(&path_params)?;
        let mut url = match &self.base {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), path),
            None => path,
        };

        if !query_pairs.is_empty() {
            let qs = query_pairs
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&qs);
        }

        Ok(url)
    }
}

fn push_query(pairs: &mut Vec<(String, String)>, key: &str, value: &ParamValue) {
    match value {
        ParamValue::Single(s) => pairs.push((key.to_string(), s.clone())),
        ParamValue::Multi(values) => {
            for v in values {
                pairs.push((key.to_string(), v.clone()));
            }
        }
    }
}

/// Builds a URL for `template_raw` against the ambient context's configured
/// base URL (spec.md §3 "outbound URL table"). This is the replacement for
/// `url.self()` (spec.md §4.A, §9 design note: "handlers declare their
/// route at registration; `url.self()` becomes a lookup on the registration
/// record") — `kindling_macros`' `#[route]` expansion generates one
/// `<handler>_url(params, query)` function per registered handler that
/// closes over its own route's path literal and forwards here, so the
/// "lookup" is a macro-time literal rather than call-stack introspection.
/// Falls back to a relative URL if no ambient context is open or no base is
/// configured, matching spec.md §4.A's "otherwise pathname + query".
pub fn url_for(
    template_raw: &str,
    params: &HashMap<String, ParamValue>,
    query: &HashMap<String, ParamValue>,
) -> crate::error::Result<String> {
    let template = Template::parse(template_raw).map_err(|e| crate::error::Error::Handler(e.to_string()))?;
    let base = crate::context::urls().ok().and_then(|t| t.http);
    let builder = UrlBuilder::new(base);
    builder.build(&template, params, query).map_err(|e| crate::error::Error::Handler(e.to_string()))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_normalisation() {
        let t = Template::parse("/posts/[id]").unwrap();
        let params = t.match_path("/posts/42").unwrap();
        assert_eq!(params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn catch_all_must_be_last() {
        let err = Template::parse("/files/[...rest]/meta");
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_param_names_rejected() {
        assert!(Template::parse("/a/:x/:x").is_err());
    }

    #[test]
    fn shapes_collide_across_param_names() {
        let a = Template::parse("/a/:x").unwrap();
        let b = Template::parse("/a/:y").unwrap();
        assert_eq!(a.shape(), b.shape());
    }

    #[test]
    fn url_builder_splits_params_and_query() {
        let t = Template::parse("/bookmarks/:id").unwrap();
        let builder = UrlBuilder::new(Some("https://h".to_string()));
        let mut params = HashMap::new();
        params.insert("id".to_string(), ParamValue::from("9"));
        params.insert("q".to_string(), ParamValue::from("z"));
        let url = builder.build(&t, &params, &HashMap::new()).unwrap();
        assert_eq!(url, "https://h/bookmarks/9?q=z");
    }

    #[test]
    fn url_for_falls_back_to_relative_outside_any_context() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), ParamValue::from("9"));
        let url = url_for("/bookmarks/:id", &params, &HashMap::new()).unwrap();
        assert_eq!(url, "/bookmarks/9");
    }

    #[test]
    fn round_trips_matched_params() {
        let t = Template::parse("/posts/:id").unwrap();
        let params = t.match_path("/posts/7").unwrap();
        let mut as_param_values = HashMap::new();
        for (k, v) in &params {
            as_param_values.insert(k.clone(), ParamValue::from(v.clone()));
        }
        let builder = UrlBuilder::new(None);
        let url = builder.build(&t, &as_param_values, &HashMap::new()).unwrap();
        assert_eq!(url, "/posts/7");
    }
}
