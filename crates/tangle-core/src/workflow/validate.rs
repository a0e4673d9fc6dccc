//! Submission-time checks for workflow definitions.
//!
//! Everything that can be decided without running a step is decided here:
//! graph shape, typed config constraints, expression syntax, and whether a
//! `{{step.output}}` reference can possibly be bound when the step runs.
//! A workflow that passes never fails with a `Validation` error later.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::workflow::expression;
use crate::workflow::http::METHODS;
use crate::workflow::schema::{StepDef, StepKind, Workflow};
use crate::workflow::template;

/// Identifier bound inside loop bodies (`loop.index`, `loop.item`).
pub const LOOP_VAR: &str = "loop";

/// Key of the per-branch error map in best-effort parallel output.
pub const ERRORS_KEY: &str = "errors";

/// Validate a workflow; all problems are reported together.
pub fn validate_workflow(workflow: &Workflow) -> CoreResult<()> {
    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push("workflow name is required".to_string());
    }
    if workflow.steps.is_empty() {
        errors.push("workflow has no steps".to_string());
    }

    let mut seen = HashSet::new();
    collect_ids(&workflow.steps, &mut seen, &mut errors);
    let all_ids = seen;

    check_level(&workflow.steps, &HashSet::new(), &all_ids, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(errors.join("; ")))
    }
}

fn collect_ids(steps: &[StepDef], seen: &mut HashSet<String>, errors: &mut Vec<String>) {
    for step in steps {
        if step.id.is_empty() {
            errors.push("step id is required".to_string());
        } else if !step
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(format!(
                "step '{}': id may only contain letters, digits, '_' and '-'",
                step.id
            ));
        } else if step.id == LOOP_VAR {
            errors.push(format!("step id '{}' is reserved", LOOP_VAR));
        }
        if !seen.insert(step.id.clone()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        match &step.kind {
            StepKind::Loop(c) => collect_ids(&c.body, seen, errors),
            StepKind::Parallel(c) => collect_ids(&c.branches, seen, errors),
            _ => {}
        }
    }
}

/// Check one sibling group. `outer` holds the ids bound before this group
/// starts (ancestors of the enclosing step and their outputs).
fn check_level(
    steps: &[StepDef],
    outer: &HashSet<String>,
    all_ids: &HashSet<String>,
    errors: &mut Vec<String>,
) {
    let local: HashMap<&str, &StepDef> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            } else if !local.contains_key(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    if let Some(cycle) = find_cycle(steps) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        // Ancestor sets are meaningless on a cyclic graph.
        return;
    }

    for step in steps {
        check_config(step, &local, errors);

        let mut visible = outer.clone();
        for ancestor in ancestors(step, &local) {
            visible.insert(ancestor.to_string());
            if let Some(StepKind::Parallel(p)) = local.get(ancestor).map(|s| &s.kind) {
                visible.extend(p.branches.iter().map(|b| b.id.clone()));
            }
        }
        check_references(step, &visible, all_ids, errors);

        match &step.kind {
            StepKind::Loop(c) => check_level(&c.body, &visible, all_ids, errors),
            StepKind::Parallel(c) => {
                for branch in &c.branches {
                    if branch.id == ERRORS_KEY {
                        errors.push(format!(
                            "step '{}': branch id '{}' is reserved",
                            step.id, ERRORS_KEY
                        ));
                    }
                    if !branch.depends_on.is_empty() {
                        errors.push(format!(
                            "parallel branch '{}' may not declare depends_on",
                            branch.id
                        ));
                    }
                }
                check_level(&c.branches, &visible, all_ids, errors);
            }
            _ => {}
        }
    }
}

/// Depth-first search; returns the first cycle as a closed path.
fn find_cycle(steps: &[StepDef]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        deps: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        for dep in deps.get(id).into_iter().flatten() {
            if deps.contains_key(dep) {
                if let Some(cycle) = visit(dep, deps, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let deps: BTreeMap<&str, Vec<&str>> = steps
        .iter()
        .map(|s| {
            let d = s
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| *d != s.id)
                .collect();
            (s.id.as_str(), d)
        })
        .collect();
    let mut marks = HashMap::new();
    for step in steps {
        let mut path = Vec::new();
        if let Some(cycle) = visit(&step.id, &deps, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Transitive dependencies of `step` within its sibling group.
pub fn ancestors<'a>(step: &'a StepDef, local: &HashMap<&'a str, &'a StepDef>) -> HashSet<&'a str> {
    let mut out = HashSet::new();
    let mut stack: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if !out.insert(id) {
            continue;
        }
        if let Some(dep) = local.get(id) {
            stack.extend(dep.depends_on.iter().map(String::as_str));
        }
    }
    out
}

fn check_config(step: &StepDef, local: &HashMap<&str, &StepDef>, errors: &mut Vec<String>) {
    let id = &step.id;
    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            errors.push(format!("step '{}': retry.max_attempts must be at least 1", id));
        }
    }
    if step.timeout_secs == Some(0) {
        errors.push(format!("step '{}': timeout_secs must be positive", id));
    }

    match &step.kind {
        StepKind::AgentTask(c) => {
            match (&c.agent_id, &c.agent_type) {
                (Some(_), Some(_)) | (None, None) => errors.push(format!(
                    "step '{}': exactly one of agent_id or agent_type is required",
                    id
                )),
                _ => {}
            }
            if c.prompt.trim().is_empty() {
                errors.push(format!("step '{}': prompt is required", id));
            }
            if c.entanglement_id.is_some() && c.agent_id.is_none() {
                errors.push(format!(
                    "step '{}': entanglement_id requires an existing agent_id",
                    id
                ));
            }
        }
        StepKind::ApiCall(c) => {
            if c.url.trim().is_empty() {
                errors.push(format!("step '{}': url is required", id));
            }
            if !c.method.contains("{{") && !METHODS.contains(&c.method.to_uppercase().as_str()) {
                errors.push(format!("step '{}': unsupported HTTP method '{}'", id, c.method));
            }
        }
        StepKind::Condition(c) => {
            if let Err(e) = expression::check(&c.expression) {
                errors.push(format!("step '{}': invalid expression: {}", id, e));
            }
            for target in &c.else_steps {
                let depends = local
                    .get(target.as_str())
                    .is_some_and(|s| s.depends_on.iter().any(|d| d == id));
                if !depends {
                    errors.push(format!(
                        "step '{}': else step '{}' must depend on the condition",
                        id, target
                    ));
                }
            }
        }
        StepKind::Loop(c) => {
            if c.body.is_empty() {
                errors.push(format!("step '{}': loop body is empty", id));
            }
            if c.max_iterations == Some(0) {
                errors.push(format!("step '{}': max_iterations must be positive", id));
            }
            if c.item_var == LOOP_VAR || c.item_var.is_empty() {
                errors.push(format!("step '{}': invalid item_var '{}'", id, c.item_var));
            }
            if let Some(until) = &c.until {
                if let Err(e) = expression::check(until) {
                    errors.push(format!("step '{}': invalid until expression: {}", id, e));
                }
            }
        }
        StepKind::Parallel(c) => {
            if c.branches.is_empty() {
                errors.push(format!("step '{}': parallel step has no branches", id));
            }
        }
        StepKind::Wait(c) => {
            if c.duration_ms.is_none() && c.signal.is_none() {
                errors.push(format!("step '{}': wait needs duration_ms or signal", id));
            }
        }
        StepKind::Transform(_) => {}
        StepKind::Webhook(c) => {
            if c.event.trim().is_empty() {
                errors.push(format!("step '{}': webhook event is required", id));
            }
        }
        StepKind::Notification(c) => {
            if c.message.trim().is_empty() {
                errors.push(format!("step '{}': notification message is required", id));
            }
        }
    }
}

/// Every `{{ref}}` naming a step must name one whose output is bound
/// before `step` runs.
fn check_references(
    step: &StepDef,
    visible: &HashSet<String>,
    all_ids: &HashSet<String>,
    errors: &mut Vec<String>,
) {
    let mut strings = Vec::new();
    own_strings(&step.kind, &mut strings);
    for s in strings {
        let refs = match template::placeholders(&s) {
            Ok(refs) => refs,
            Err(e) => {
                errors.push(format!("step '{}': {}", step.id, e));
                continue;
            }
        };
        for r in refs {
            let root = r.path.split('.').next().unwrap_or_default();
            if all_ids.contains(root) && !visible.contains(root) {
                errors.push(format!(
                    "step '{}' references '{}' which is not one of its dependencies",
                    step.id, root
                ));
            }
        }
    }
}

/// Template strings belonging to this step only (nested steps are checked
/// at their own level).
fn own_strings(kind: &StepKind, out: &mut Vec<String>) {
    match kind {
        StepKind::AgentTask(c) => {
            out.push(c.prompt.clone());
            strings_in(&c.payload, out);
            strings_in(&c.agent_config, out);
            out.extend(c.agent_id.iter().cloned());
            out.extend(c.entanglement_id.iter().cloned());
        }
        StepKind::ApiCall(c) => {
            out.push(c.url.clone());
            out.push(c.method.clone());
            out.extend(c.headers.values().cloned());
            if let Some(body) = &c.body {
                strings_in(body, out);
            }
        }
        StepKind::Loop(c) => strings_in(&c.over, out),
        StepKind::Transform(c) => strings_in(&c.input, out),
        StepKind::Webhook(c) => {
            out.extend(c.url.iter().cloned());
            out.push(c.event.clone());
            strings_in(&c.payload, out);
        }
        StepKind::Notification(c) => {
            out.push(c.channel.clone());
            out.push(c.message.clone());
        }
        StepKind::Wait(c) => out.extend(c.signal.iter().cloned()),
        StepKind::Condition(_) | StepKind::Parallel(_) => {}
    }
}

fn strings_in(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| strings_in(v, out)),
        Value::Object(map) => map.values().for_each(|v| strings_in(v, out)),
        _ => {}
    }
}
