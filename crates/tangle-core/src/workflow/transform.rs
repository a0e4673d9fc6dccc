//! Named pure functions for `transform` steps.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::workflow::template::lookup_path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum TransformFn {
    Identity,
    Uppercase,
    Lowercase,
    Trim,
    JsonParse,
    JsonStringify,
    Length,
    Multiply { factor: f64 },
    Add { amount: f64 },
    Sum,
    Concat {
        #[serde(default)]
        separator: String,
    },
    Pick { path: String },
    Default { value: Value },
}

/// Accepts either a bare name (`uppercase`) or a map (`{name: multiply, factor: 2}`).
pub fn deserialize_fn<'de, D>(deserializer: D) -> Result<TransformFn, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let tagged = match raw {
        Value::String(name) => serde_json::json!({ "name": name }),
        other => other,
    };
    serde_json::from_value(tagged).map_err(serde::de::Error::custom)
}

impl TransformFn {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Uppercase => "uppercase",
            Self::Lowercase => "lowercase",
            Self::Trim => "trim",
            Self::JsonParse => "json_parse",
            Self::JsonStringify => "json_stringify",
            Self::Length => "length",
            Self::Multiply { .. } => "multiply",
            Self::Add { .. } => "add",
            Self::Sum => "sum",
            Self::Concat { .. } => "concat",
            Self::Pick { .. } => "pick",
            Self::Default { .. } => "default",
        }
    }

    /// Apply the function. Type mismatches are fatal: the same input
    /// always produces the same error.
    pub fn apply(&self, input: Value) -> CoreResult<Value> {
        match self {
            Self::Identity => Ok(input),
            Self::Uppercase => Ok(Value::String(self.expect_str(&input)?.to_uppercase())),
            Self::Lowercase => Ok(Value::String(self.expect_str(&input)?.to_lowercase())),
            Self::Trim => Ok(Value::String(self.expect_str(&input)?.trim().to_string())),
            Self::JsonParse => {
                let text = self.expect_str(&input)?;
                serde_json::from_str(text)
                    .map_err(|e| CoreError::StepFatal(format!("json_parse: {}", e)))
            }
            Self::JsonStringify => Ok(Value::String(input.to_string())),
            Self::Length => {
                let len = match &input {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    Value::Null => 0,
                    _ => return Err(self.mismatch("a string, list or map", &input)),
                };
                Ok(Value::from(len))
            }
            Self::Multiply { factor } => Ok(number_value(self.expect_f64(&input)? * factor)),
            Self::Add { amount } => Ok(number_value(self.expect_f64(&input)? + amount)),
            Self::Sum => {
                let items = input
                    .as_array()
                    .ok_or_else(|| self.mismatch("a list of numbers", &input))?;
                let mut total = 0.0;
                for item in items {
                    total += self.expect_f64(item)?;
                }
                Ok(number_value(total))
            }
            Self::Concat { separator } => {
                let items = input
                    .as_array()
                    .ok_or_else(|| self.mismatch("a list", &input))?;
                let parts: Vec<String> = items.iter().map(display_value).collect();
                Ok(Value::String(parts.join(separator)))
            }
            Self::Pick { path } => lookup_in(&input, path)
                .cloned()
                .ok_or_else(|| CoreError::StepFatal(format!("pick: path '{}' not found", path))),
            Self::Default { value } => Ok(if input.is_null() { value.clone() } else { input }),
        }
    }

    fn expect_str<'a>(&self, input: &'a Value) -> CoreResult<&'a str> {
        input.as_str().ok_or_else(|| self.mismatch("a string", input))
    }

    fn expect_f64(&self, input: &Value) -> CoreResult<f64> {
        match input {
            Value::Number(n) => n.as_f64().ok_or_else(|| self.mismatch("a number", input)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.mismatch("a number", input)),
            _ => Err(self.mismatch("a number", input)),
        }
    }

    fn mismatch(&self, expected: &str, got: &Value) -> CoreError {
        CoreError::StepFatal(format!(
            "{}: expected {}, got {}",
            self.name(),
            expected,
            type_name(got)
        ))
    }
}

/// Whole floats come back as integers so `2` stays `2`, not `2.0`.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Strings render raw; everything else as JSON text.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup_in<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => lookup_path(map, path),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
