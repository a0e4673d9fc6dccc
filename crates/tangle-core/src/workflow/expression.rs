//! Boolean expressions for `condition` steps and loop `until` guards.
//!
//! Expressions are Jinja expressions evaluated over the execution variables,
//! e.g. `A.output > 3 and not input.dry_run`.

use minijinja::Environment;
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Syntax check without evaluating.
pub fn check(expression: &str) -> Result<(), String> {
    Environment::new()
        .compile_expression(expression)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Evaluate to a truthiness value. Evaluation errors are fatal for the step.
pub fn evaluate(expression: &str, vars: &Map<String, Value>) -> CoreResult<bool> {
    let env = Environment::new();
    let compiled = env.compile_expression(expression).map_err(|e| {
        CoreError::StepFatal(format!("invalid expression '{}': {}", expression, e))
    })?;
    let result = compiled.eval(vars).map_err(|e| {
        CoreError::StepFatal(format!("expression '{}' failed: {}", expression, e))
    })?;
    Ok(result.is_true())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({"x": 2, "A": {"output": "urgent"}, "flags": {"dry_run": false}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_evaluate() {
        let v = vars();
        assert!(evaluate("x > 1", &v).unwrap());
        assert!(evaluate("A.output == 'urgent' and not flags.dry_run", &v).unwrap());
        assert!(!evaluate("x is even and x > 5", &v).unwrap());
    }

    #[test]
    fn test_undefined_is_falsy() {
        assert!(!evaluate("missing", &vars()).unwrap());
    }

    #[test]
    fn test_check_syntax() {
        assert!(check("a and (b or c)").is_ok());
        assert!(check("a and (").is_err());
    }
}
