//! Typed candidate-change set applied to a shadow workload
//!
//! The recognized keys form a closed set; anything else is rejected before
//! it can reach the cluster.

use aegis_common::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// One recognized change operation
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    /// Replace the container image reference.
    Image(String),
    /// Scale the cloned workload.
    Replicas(i32),
    /// Set or overwrite environment variables.
    Env(BTreeMap<String, String>),
    /// Replace resource requests and limits.
    Resources(Value),
    /// Override the container command.
    Command(Vec<String>),
    /// Override the container args.
    Args(Vec<String>),
    /// Strategic-merge patch applied verbatim.
    Patch(Value),
}

/// Ordered set of change operations parsed from the raw change map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    ops: Vec<ChangeOp>,
}

impl ChangeSet {
    /// Parse a raw change map; unknown keys fail with `UnsupportedChange`.
    pub fn parse(changes: &BTreeMap<String, Value>) -> Result<Self> {
        let mut ops = Vec::new();
        for (key, value) in changes {
            let op = match key.as_str() {
                "image" => ChangeOp::Image(expect_string(key, value)?),
                "replicas" => ChangeOp::Replicas(
                    value
                        .as_i64()
                        .ok_or_else(|| bad_value(key, "an integer"))?
                        .try_into()
                        .map_err(|_| bad_value(key, "a small integer"))?,
                ),
                "env" => {
                    let map = value
                        .as_object()
                        .ok_or_else(|| bad_value(key, "a string map"))?;
                    let mut env = BTreeMap::new();
                    for (name, v) in map {
                        env.insert(
                            name.clone(),
                            v.as_str()
                                .map(String::from)
                                .unwrap_or_else(|| v.to_string()),
                        );
                    }
                    ChangeOp::Env(env)
                }
                "resources" => ChangeOp::Resources(value.clone()),
                "command" => ChangeOp::Command(expect_string_list(key, value)?),
                "args" => ChangeOp::Args(expect_string_list(key, value)?),
                "patch" => ChangeOp::Patch(value.clone()),
                other => return Err(Error::UnsupportedChange(other.to_string())),
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// New image reference, if the set carries one.
    pub fn image(&self) -> Option<&str> {
        self.ops.iter().find_map(|op| match op {
            ChangeOp::Image(image) => Some(image.as_str()),
            _ => None,
        })
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(String::from)
        .ok_or_else(|| bad_value(key, "a string"))
}

fn expect_string_list(key: &str, value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .filter(|list: &Vec<String>| !list.is_empty())
        .ok_or_else(|| bad_value(key, "a list of strings"))
}

fn bad_value(key: &str, expected: &str) -> Error {
    Error::Input(format!("change '{}' must be {}", key, expected))
}
