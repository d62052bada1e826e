//! Typed protocol node entries
//!
//! The protocol description is an ordered list of loosely-typed entries.
//! An entry with a `skip` key is a [`SkipConfig`]; anything else must be a
//! [`SectionConfig`]. Both are decoded with unknown fields rejected so a
//! misspelled key fails the build instead of being ignored.
//!
//! Keys are accepted in lowercase or capitalized form (`size` / `Size`,
//! `next` / `Next`, ...).

use crate::protocol::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One routing rule: jump to `target` when `condition` is true
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NextRuleConfig {
    #[serde(alias = "cond", alias = "Cond", alias = "Condition")]
    pub condition: String,

    /// `DEFAULT`, `END` or a label name
    #[serde(alias = "Target")]
    pub target: String,
}

/// A node consuming `size` bytes and running its expressions over them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionConfig {
    #[serde(default, alias = "Desc")]
    pub desc: String,

    #[serde(alias = "Size")]
    pub size: i64,

    /// Field name -> expression
    #[serde(default, alias = "Fields", alias = "Field")]
    pub fields: BTreeMap<String, String>,

    /// Variable name -> expression
    #[serde(default, alias = "Vars", alias = "Var")]
    pub vars: BTreeMap<String, String>,

    /// Tag name -> expression
    #[serde(default, alias = "Tags", alias = "Tag")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, alias = "Label", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, alias = "Next", skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextRuleConfig>,
}

/// A node consuming bytes without decoding them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkipConfig {
    /// Raw amount, coerced by [`coerce_skip`]
    #[serde(alias = "Skip")]
    pub skip: serde_json::Value,

    #[serde(default, alias = "Desc")]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Section(SectionConfig),
    Skip(SkipConfig),
}

impl NodeConfig {
    /// Decode one raw entry at position `index`
    pub fn from_value(index: usize, value: &serde_json::Value) -> Result<Self, BuildError> {
        let object = value.as_object().ok_or_else(|| BuildError::Malformed {
            index,
            message: format!("expected a table, got {}", value),
        })?;

        let malformed = |e: serde_json::Error| BuildError::Malformed {
            index,
            message: e.to_string(),
        };

        if object.contains_key("skip") || object.contains_key("Skip") {
            serde_json::from_value(value.clone())
                .map(NodeConfig::Skip)
                .map_err(malformed)
        } else {
            serde_json::from_value(value.clone())
                .map(NodeConfig::Section)
                .map_err(malformed)
        }
    }

    pub fn desc(&self) -> &str {
        match self {
            NodeConfig::Section(s) => &s.desc,
            NodeConfig::Skip(s) => &s.desc,
        }
    }
}

/// Coerce a skip amount to a positive byte count.
///
/// Accepts an integer, a float with no fractional part, or a string holding
/// either. Zero and negative amounts are rejected.
pub fn coerce_skip(value: &serde_json::Value) -> Option<usize> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                positive(u)
            } else if n.is_i64() {
                None
            } else {
                n.as_f64().and_then(whole_float)
            }
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                u64::try_from(i).ok().and_then(positive)
            } else {
                s.parse::<f64>().ok().and_then(whole_float)
            }
        }
        _ => None,
    }
}

fn positive(u: u64) -> Option<usize> {
    if u == 0 {
        None
    } else {
        usize::try_from(u).ok()
    }
}

fn whole_float(f: f64) -> Option<usize> {
    if f.is_finite() && f.fract() == 0.0 && f >= 1.0 && f <= u32::MAX as f64 {
        Some(f as usize)
    } else {
        None
    }
}
