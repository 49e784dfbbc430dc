//! Structural diffs between two versions of a key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Version, VersionValue};

/// One change, addressed by a JSON pointer (`/db/port`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, from: Value, to: Value },

    /// A secret value changed. Contents are never exposed.
    SecretChanged { path: String },
}

/// Difference between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub from: u64,
    pub to: u64,
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Compute the patch turning `from` into `to`.
///
/// Tombstones compare as `null`. Anything involving a secret collapses to a
/// single redacted [`PatchOp::SecretChanged`] unless both sides carry the
/// identical ciphertext.
pub fn diff_versions(from: &Version, to: &Version) -> Patch {
    let mut ops = Vec::new();
    match (&from.value, &to.value) {
        (VersionValue::Secret(a), VersionValue::Secret(b)) if a == b => {}
        (VersionValue::Secret(_), _) | (_, VersionValue::Secret(_)) => {
            ops.push(PatchOp::SecretChanged {
                path: String::new(),
            });
        }
        (a, b) => diff_values("", &as_json(a), &as_json(b), &mut ops),
    }
    Patch {
        from: from.number,
        to: to.number,
        ops,
    }
}

fn as_json(value: &VersionValue) -> Value {
    match value {
        VersionValue::Plain(v) => v.clone(),
        VersionValue::Secret(_) | VersionValue::Tombstone => Value::Null,
    }
}

/// Escape a map key per RFC 6901.
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Recursive JSON diff.
pub fn diff_values(path: &str, from: &Value, to: &Value, ops: &mut Vec<PatchOp>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, va) in a {
                let child = format!("{path}/{}", escape(k));
                match b.get(k) {
                    Some(vb) => diff_values(&child, va, vb, ops),
                    None => ops.push(PatchOp::Remove { path: child }),
                }
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    ops.push(PatchOp::Add {
                        path: format!("{path}/{}", escape(k)),
                        value: vb.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                diff_values(&format!("{path}/{i}"), &a[i], &b[i], ops);
            }
            // Remove from the end so earlier indices stay valid.
            for i in (common..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: format!("{path}/{i}"),
                });
            }
            for (i, item) in b.iter().enumerate().skip(common) {
                ops.push(PatchOp::Add {
                    path: format!("{path}/{i}"),
                    value: item.clone(),
                });
            }
        }
        (Value::Null, to) => ops.push(PatchOp::Add {
            path: path.to_string(),
            value: to.clone(),
        }),
        (_, Value::Null) => ops.push(PatchOp::Remove {
            path: path.to_string(),
        }),
        (from, to) => ops.push(PatchOp::Replace {
            path: path.to_string(),
            from: from.clone(),
            to: to.clone(),
        }),
    }
}
