//! `{{path}}` interpolation against execution variables.
//!
//! - `{{A.output}}` resolves a dot path; array elements by index (`{{items.0}}`).
//! - `{{A.output | default: 0}}` falls back when the path is missing. The
//!   default is parsed as JSON, otherwise used as a plain string.
//! - A string that is exactly one placeholder yields the referenced value
//!   with its JSON type intact; anything else renders to a string.

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::workflow::transform::display_value;

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub path: String,
    pub default: Option<Value>,
}

fn parse(input: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unclosed placeholder in '{}'", input))?;
        segments.push(Segment::Placeholder(parse_placeholder(&after[..end])?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn parse_placeholder(inner: &str) -> Result<Placeholder, String> {
    let (path, default) = match inner.split_once('|') {
        Some((path, filter)) => {
            let filter = filter.trim();
            let literal = filter
                .strip_prefix("default:")
                .or_else(|| filter.strip_prefix("default :"))
                .ok_or_else(|| format!("unsupported filter '{}'", filter))?
                .trim();
            (path.trim(), Some(parse_literal(literal)))
        }
        None => (inner.trim(), None),
    };
    if !is_valid_path(path) {
        return Err(format!("invalid reference '{}'", path));
    }
    Ok(Placeholder {
        path: path.to_string(),
        default,
    })
}

fn parse_literal(literal: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(literal) {
        return value;
    }
    let unquoted = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(literal);
    Value::String(unquoted.to_string())
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Resolve a dot path against a variables map.
pub fn lookup_path<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve(placeholder: &Placeholder, vars: &Map<String, Value>) -> CoreResult<Value> {
    match lookup_path(vars, &placeholder.path) {
        Some(value) => Ok(value.clone()),
        None => placeholder
            .default
            .clone()
            .ok_or_else(|| CoreError::Interpolation {
                path: placeholder.path.clone(),
            }),
    }
}

/// Render one string. A lone placeholder keeps the value's JSON type.
pub fn render_str(input: &str, vars: &Map<String, Value>) -> CoreResult<Value> {
    let segments =
        parse(input).map_err(|e| CoreError::StepFatal(format!("template error: {}", e)))?;
    if let [Segment::Placeholder(p)] = segments.as_slice() {
        return resolve(p, vars);
    }
    let mut out = String::with_capacity(input.len());
    for segment in &segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(p) => out.push_str(&display_value(&resolve(p, vars)?)),
        }
    }
    Ok(Value::String(out))
}

/// Render to a string regardless of the referenced value's type.
pub fn render_string(input: &str, vars: &Map<String, Value>) -> CoreResult<String> {
    render_str(input, vars).map(|v| display_value(&v))
}

/// Render every string inside a JSON value, recursively.
pub fn render_value(value: &Value, vars: &Map<String, Value>) -> CoreResult<Value> {
    match value {
        Value::String(s) => render_str(s, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, vars))
            .collect::<CoreResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Placeholders in a string, for submission-time checks.
pub fn placeholders(input: &str) -> Result<Vec<Placeholder>, String> {
    Ok(parse(input)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Text(_) => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({
            "x": 1,
            "user": {"name": "ada", "tags": ["a", "b"]},
            "A": {"output": {"count": 3}},
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_lone_placeholder_keeps_type() {
        let v = vars();
        assert_eq!(render_str("{{x}}", &v).unwrap(), json!(1));
        assert_eq!(render_str("{{ A.output }}", &v).unwrap(), json!({"count": 3}));
        assert_eq!(render_str("{{user.tags.1}}", &v).unwrap(), json!("b"));
    }

    #[test]
    fn test_mixed_text_renders_string() {
        let v = vars();
        assert_eq!(
            render_str("hi {{user.name}}, count={{A.output.count}}", &v).unwrap(),
            json!("hi ada, count=3")
        );
        assert_eq!(render_string("{{x}}", &v).unwrap(), "1");
    }

    #[test]
    fn test_missing_path_without_default_fails() {
        let err = render_str("{{B.output}}", &vars()).unwrap_err();
        assert!(matches!(err, CoreError::Interpolation { ref path } if path == "B.output"));
    }

    #[test]
    fn test_default_literal() {
        let v = vars();
        assert_eq!(render_str("{{B.output | default: 0}}", &v).unwrap(), json!(0));
        assert_eq!(
            render_str("{{B.output | default: 'none'}}", &v).unwrap(),
            json!("none")
        );
        assert_eq!(render_str("{{x | default: 5}}", &v).unwrap(), json!(1));
    }

    #[test]
    fn test_render_nested_value() {
        let rendered = render_value(
            &json!({"who": "{{user.name}}", "list": ["{{x}}", 2], "flag": true}),
            &vars(),
        )
        .unwrap();
        assert_eq!(rendered, json!({"who": "ada", "list": [1, 2], "flag": true}));
    }

    #[test]
    fn test_placeholder_syntax_errors() {
        assert!(placeholders("{{x").is_err());
        assert!(placeholders("{{a..b}}").is_err());
        assert!(placeholders("{{x | upper}}").is_err());
        let found = placeholders("{{a.b}} and {{c}}").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, "a.b");
    }
}
