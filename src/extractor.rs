use crate::schema::{ExtractionMethod, HttpResponse, VariableExtraction};
use crate::variables::{value_to_string, Variables};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Pull every resolvable rule out of `response`. Rules that miss, and bodies
/// that are not JSON, contribute nothing.
pub fn extract_variables(response: &HttpResponse, rules: &[VariableExtraction]) -> Variables {
    let mut extracted = Variables::new();
    // Parsed at most once per step, and only if some rule needs the body.
    let mut body: Option<Option<Value>> = None;

    for rule in rules {
        let value = match rule.method {
            ExtractionMethod::JsonPath => {
                let parsed = body.get_or_insert_with(|| parse_body(&response.body));
                parsed.as_ref().and_then(|json| select(json, &rule.path))
            }
            ExtractionMethod::Header => response.header(rule.path.trim()).map(str::to_string),
            ExtractionMethod::Unknown => {
                log::debug!(
                    "Skipping extraction of '{}': unsupported method",
                    rule.variable
                );
                None
            }
        };

        match value {
            Some(value) => {
                extracted.insert(rule.variable.clone(), value);
            }
            None => log::debug!("No value for '{}' at path '{}'", rule.variable, rule.path),
        }
    }

    extracted
}

fn parse_body(body: &str) -> Option<Value> {
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("Response body is not JSON: {}", e);
            None
        }
    }
}

/// Resolve `path` against `json` and stringify the result. A path naming no
/// segment at all (`""`, `$`) is a miss.
pub fn select(json: &Value, path: &str) -> Option<String> {
    match parse_path(path) {
        Some(segments) if segments.is_empty() => None,
        Some(segments) => traverse(json, &segments).map(value_to_string),
        None => select_jsonpath(json, path),
    }
}

fn traverse<'a>(mut current: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Full JSONPath expressions (`..`, wildcards, filters) go through
/// `jsonpath_lib`; the first match wins.
fn select_jsonpath(json: &Value, path: &str) -> Option<String> {
    let expr = if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{}", path)
    };

    match jsonpath_lib::select(json, &expr) {
        Ok(matches) => matches.first().map(|v| value_to_string(v)),
        Err(e) => {
            log::debug!("JSONPath '{}' evaluation failed: {}", expr, e);
            None
        }
    }
}

/// Split `a.b[0]['c.d']` into segments. Returns `None` for anything beyond
/// plain keys and indices.
fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);

    let mut segments = Vec::new();
    let mut key = String::new();
    let mut chars = path.chars().peekable();
    // After `]` a separator is optional, so an empty key there is fine.
    let mut after_bracket = false;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() && !after_bracket {
                    return None;
                }
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                after_bracket = false;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return None;
                }
                segments.push(parse_bracket(inner.trim())?);
                after_bracket = true;
            }
            '*' | '?' | '@' | ']' => return None,
            _ => {
                key.push(c);
                after_bracket = false;
            }
        }
    }

    if !key.is_empty() {
        segments.push(Segment::Key(key));
    } else if !after_bracket && !segments.is_empty() {
        // trailing dot
        return None;
    }

    Some(segments)
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    for quote in ['\'', '"'] {
        if let Some(key) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(Segment::Key(key.to_string()));
        }
    }
    inner.parse::<usize>().ok().map(Segment::Index)
}
