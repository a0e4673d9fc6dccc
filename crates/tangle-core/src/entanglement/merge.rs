//! Patch application for entanglement shared state.
//!
//! Every written leaf is stamped with the version and agent that wrote it.
//! In merge mode a scalar collision is a conflict when the stored value was
//! written by another agent at a version the writer has not seen.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::models::entanglement::CoordinationMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub version: u64,
    pub agent_id: String,
}

/// Path → last write. Segments are joined with `.`; a `.` or `\` inside a
/// key is escaped with `\`.
pub type Stamps = HashMap<String, Stamp>;

pub struct PatchContext<'a> {
    pub mode: CoordinationMode,
    pub writer: &'a str,
    /// Last version the writer has observed
    pub seen: u64,
    /// Version this patch will commit as
    pub version: u64,
}

/// Apply `patch` onto a copy of `state`. Returns the new state and stamps,
/// or every conflicting path; on conflict nothing is applied.
pub fn apply_patch(
    state: &Map<String, Value>,
    stamps: &Stamps,
    patch: &Map<String, Value>,
    ctx: &PatchContext<'_>,
) -> Result<(Map<String, Value>, Stamps), Vec<String>> {
    let mut next = state.clone();
    let mut next_stamps = stamps.clone();
    let mut conflicts = Vec::new();
    merge_into(&mut next, &mut next_stamps, patch, "", ctx, &mut conflicts);
    if conflicts.is_empty() {
        Ok((next, next_stamps))
    } else {
        conflicts.sort();
        Err(conflicts)
    }
}

fn join(prefix: &str, key: &str) -> String {
    let segment = key.replace('\\', "\\\\").replace('.', "\\.");
    if prefix.is_empty() {
        segment
    } else {
        format!("{}.{}", prefix, segment)
    }
}

fn merge_into(
    target: &mut Map<String, Value>,
    stamps: &mut Stamps,
    patch: &Map<String, Value>,
    prefix: &str,
    ctx: &PatchContext<'_>,
    conflicts: &mut Vec<String>,
) {
    for (key, incoming) in patch {
        let path = join(prefix, key);
        match (target.get_mut(key), incoming) {
            (None, _) => {
                target.insert(key.clone(), incoming.clone());
                stamp(stamps, &path, ctx);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, stamps, incoming, &path, ctx, conflicts);
            }
            (Some(Value::Array(existing)), Value::Array(incoming))
                if ctx.mode == CoordinationMode::Merge =>
            {
                existing.extend(incoming.iter().cloned());
                stamp(stamps, &path, ctx);
            }
            (Some(existing), incoming) => {
                if *existing == *incoming {
                    continue;
                }
                if ctx.mode == CoordinationMode::Merge && unseen_foreign_write(stamps, &path, ctx) {
                    conflicts.push(path);
                    continue;
                }
                *existing = incoming.clone();
                clear_below(stamps, &path);
                stamp(stamps, &path, ctx);
            }
        }
    }
}

fn stamp(stamps: &mut Stamps, path: &str, ctx: &PatchContext<'_>) {
    stamps.insert(
        path.to_string(),
        Stamp {
            version: ctx.version,
            agent_id: ctx.writer.to_string(),
        },
    );
}

fn covers(path: &str, other: &str) -> bool {
    other == path || other.starts_with(&format!("{}.", path))
}

/// A write to `path` or anything below it, by someone else, after `seen`.
fn unseen_foreign_write(stamps: &Stamps, path: &str, ctx: &PatchContext<'_>) -> bool {
    stamps.iter().any(|(p, s)| {
        covers(path, p) && s.agent_id != ctx.writer && s.version > ctx.seen
    })
}

fn clear_below(stamps: &mut Stamps, path: &str) {
    stamps.retain(|p, _| p == path || !covers(path, p));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn ctx<'a>(mode: CoordinationMode, writer: &'a str, seen: u64, version: u64) -> PatchContext<'a> {
        PatchContext {
            mode,
            writer,
            seen,
            version,
        }
    }

    #[test]
    fn test_merge_deep_merges_and_concatenates() {
        let state = obj(json!({"plan": {"steps": ["a"], "owner": "x"}}));
        let (next, stamps) = apply_patch(
            &state,
            &Stamps::new(),
            &obj(json!({"plan": {"steps": ["b"], "eta": 3}})),
            &ctx(CoordinationMode::Merge, "a1", 0, 1),
        )
        .unwrap();
        assert_eq!(
            Value::Object(next),
            json!({"plan": {"steps": ["a", "b"], "owner": "x", "eta": 3}})
        );
        assert_eq!(stamps["plan.eta"].agent_id, "a1");
    }

    #[test]
    fn test_merge_conflict_on_unseen_scalar() {
        let state = obj(json!({"owner": "a1"}));
        let mut stamps = Stamps::new();
        stamps.insert("owner".into(), Stamp { version: 1, agent_id: "a1".into() });

        let err = apply_patch(
            &state,
            &stamps,
            &obj(json!({"owner": "a2", "note": "hi"})),
            &ctx(CoordinationMode::Merge, "a2", 0, 2),
        )
        .unwrap_err();
        assert_eq!(err, vec!["owner".to_string()]);

        // Once a2 has seen version 1 the overwrite is deliberate.
        let (next, _) = apply_patch(
            &state,
            &stamps,
            &obj(json!({"owner": "a2"})),
            &ctx(CoordinationMode::Merge, "a2", 1, 2),
        )
        .unwrap();
        assert_eq!(next["owner"], json!("a2"));
    }

    #[test]
    fn test_dotted_key_is_distinct_from_nested_path() {
        let state = obj(json!({"a.b": 1, "a": {"b": 1}}));
        let mut stamps = Stamps::new();
        stamps.insert("a\\.b".into(), Stamp { version: 1, agent_id: "a1".into() });

        // a2 has not seen a1's write to "a.b", but "a" -> "b" is a different leaf
        let (next, _) = apply_patch(
            &state,
            &stamps,
            &obj(json!({"a": {"b": 2}})),
            &ctx(CoordinationMode::Merge, "a2", 0, 2),
        )
        .unwrap();
        assert_eq!(next["a"]["b"], json!(2));
        assert_eq!(next["a.b"], json!(1));

        let err = apply_patch(
            &state,
            &stamps,
            &obj(json!({"a.b": 3})),
            &ctx(CoordinationMode::Merge, "a2", 0, 2),
        )
        .unwrap_err();
        assert_eq!(err, vec!["a\\.b".to_string()]);
    }

    #[test]
    fn test_own_writes_never_conflict() {
        let state = obj(json!({"n": 1}));
        let mut stamps = Stamps::new();
        stamps.insert("n".into(), Stamp { version: 5, agent_id: "a1".into() });
        let (next, _) = apply_patch(
            &state,
            &stamps,
            &obj(json!({"n": 2})),
            &ctx(CoordinationMode::Merge, "a1", 0, 6),
        )
        .unwrap();
        assert_eq!(next["n"], json!(2));
    }

    #[test]
    fn test_last_writer_wins_replaces() {
        let state = obj(json!({"owner": "a1", "tags": ["x"]}));
        let mut stamps = Stamps::new();
        stamps.insert("owner".into(), Stamp { version: 1, agent_id: "a1".into() });
        let (next, _) = apply_patch(
            &state,
            &stamps,
            &obj(json!({"owner": "a2", "tags": ["y"]})),
            &ctx(CoordinationMode::LastWriterWins, "a2", 0, 2),
        )
        .unwrap();
        assert_eq!(Value::Object(next), json!({"owner": "a2", "tags": ["y"]}));
    }
}
