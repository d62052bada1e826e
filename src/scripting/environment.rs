//! Evaluation environments
//!
//! An [`Environment`] owns the Rhai scope a decode walk runs against plus
//! the points emitted so far. One environment serves one frame at a time;
//! it is reset between frames and never shared between threads while in use.
//!
//! `Global` (and `Tag` in a filter) are [`ReadOnlyMap`]s: scripts can index
//! them but no registered function takes one mutably, and the scope entry
//! itself is a constant.

use super::ExprError;
use crate::pool::Pool;
use crate::types::{Point, TagMap, Value};
use chrono::{DateTime, Utc};
use rhai::{Blob, Dynamic, ImmutableString, Map, Scope};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const BYTES: &str = "Bytes";
pub(crate) const VARS: &str = "Vars";
pub(crate) const GLOBAL: &str = "Global";
pub(crate) const TAG: &str = "Tag";
pub(crate) const FIELD: &str = "Field";

/// Run `f` against the map stored in scope variable `name`.
///
/// Returns `None` if the variable is missing, constant, or no longer a map.
fn with_map<R>(scope: &mut Scope<'static>, name: &str, f: impl FnOnce(&mut Map) -> R) -> Option<R> {
    let slot = scope.get_mut(name)?;
    let mut map = slot.write_lock::<Map>()?;
    Some(f(&mut map))
}

fn to_map(values: &BTreeMap<String, Value>) -> Map {
    values
        .iter()
        .map(|(k, v)| (k.as_str().into(), v.to_dynamic()))
        .collect()
}

/// A map scripts can read but not modify
#[derive(Debug, Clone, Default)]
pub(crate) struct ReadOnlyMap(Arc<Map>);

impl ReadOnlyMap {
    pub(crate) fn new(map: Map) -> Self {
        Self(Arc::new(map))
    }

    /// Indexer and property access; missing keys read as `()`
    pub(crate) fn get(&mut self, key: ImmutableString) -> Dynamic {
        self.0.get(key.as_str()).cloned().unwrap_or(Dynamic::UNIT)
    }

    /// Backs the `in` operator
    pub(crate) fn contains(&mut self, key: ImmutableString) -> bool {
        self.0.contains_key(key.as_str())
    }
}

fn convert_map(
    which: &'static str,
    src: &Map,
    dst: &mut BTreeMap<String, Value>,
) -> Result<(), ExprError> {
    for (key, value) in src {
        let converted = Value::from_dynamic(value).ok_or_else(|| ExprError::Unsupported {
            map: which,
            key: key.to_string(),
            found: value.type_name().to_string(),
        })?;
        dst.insert(key.to_string(), converted);
    }
    Ok(())
}

/// Per-frame decode state: current bytes, variables, globals, tags and the
/// point accumulator
pub struct Environment {
    scope: Scope<'static>,
    globals: ReadOnlyMap,
    points: Vec<Point>,
    pool: Option<Arc<Pool<Point>>>,
}

impl Environment {
    pub fn new(globals: &BTreeMap<String, Value>) -> Self {
        let mut env = Self {
            scope: Scope::new(),
            globals: ReadOnlyMap::new(to_map(globals)),
            points: Vec::new(),
            pool: None,
        };
        env.rebuild_scope();
        env
    }

    /// Fresh scope variables; the byte buffer's allocation is kept
    fn rebuild_scope(&mut self) {
        let mut bytes = self
            .scope
            .get_mut(BYTES)
            .map(std::mem::take)
            .and_then(|value| value.try_cast::<Blob>())
            .unwrap_or_default();
        bytes.clear();

        self.scope.clear();
        self.scope.push(BYTES, bytes);
        self.scope.push(VARS, Map::new());
        self.scope.push_constant(GLOBAL, self.globals.clone());
        self.scope.push(TAG, Map::new());
        self.scope.push(FIELD, Map::new());
    }

    /// Draw emitted points from `pool` instead of allocating
    pub fn with_pool(mut self, pool: Arc<Pool<Point>>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }

    /// Clear all per-frame state; accumulated points go back to the pool
    pub fn reset(&mut self) {
        self.rebuild_scope();
        self.recycle_points();
    }

    /// Replace the byte view with the current node's slice
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        let reused = self
            .scope
            .get_mut(BYTES)
            .and_then(|slot| {
                slot.write_lock::<Blob>().map(|mut blob| {
                    blob.clear();
                    blob.extend_from_slice(bytes);
                })
            })
            .is_some();

        if !reused {
            self.scope.set_value(BYTES, bytes.to_vec());
        }
    }

    /// Emit a point from the current tags and fields.
    ///
    /// Fields are consumed; tags stay in place for later sections of the frame.
    pub fn emit_point(&mut self, timestamp: DateTime<Utc>) -> Result<(), ExprError> {
        let mut point = match &self.pool {
            Some(pool) => pool.get(),
            None => Point::new(),
        };

        let filled = with_map(&mut self.scope, TAG, |m| convert_map(TAG, m, &mut point.tags))
            .unwrap_or(Ok(()))
            .and_then(|_| {
                with_map(&mut self.scope, FIELD, |m| {
                    let converted = convert_map(FIELD, m, &mut point.fields);
                    m.clear();
                    converted
                })
                .unwrap_or(Ok(()))
            });

        match filled {
            Ok(()) => {
                point.timestamp = timestamp;
                self.points.push(point);
                Ok(())
            }
            Err(e) => {
                if let Some(pool) = &self.pool {
                    pool.put(point);
                }
                Err(e)
            }
        }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Take the points emitted for the current frame
    pub fn take_points(&mut self) -> Vec<Point> {
        std::mem::take(&mut self.points)
    }

    /// Return any accumulated points to the pool
    pub fn recycle_points(&mut self) {
        match &self.pool {
            Some(pool) => self.points.drain(..).for_each(|p| pool.put(p)),
            None => self.points.clear(),
        }
    }

    /// A frame variable by name
    pub fn var(&self, name: &str) -> Option<Dynamic> {
        self.scope
            .get_value::<Map>(VARS)
            .and_then(|vars| vars.get(name).cloned())
    }

    /// `name=value` listing of frame variables for diagnostics
    pub fn vars_snapshot(&self) -> String {
        match self.scope.get_value::<Map>(VARS) {
            Some(vars) if !vars.is_empty() => vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "(none)".to_string(),
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("vars", &self.vars_snapshot())
            .field("points", &self.points.len())
            .finish()
    }
}

/// Filter evaluation state: the tags of one point, read-only
pub struct FilterEnvironment {
    scope: Scope<'static>,
}

impl FilterEnvironment {
    pub fn new() -> Self {
        let mut env = Self { scope: Scope::new() };
        env.load_tags(&TagMap::new());
        env
    }

    /// Expose `tags` as a constant `Tag` shared by every filter of the point
    pub fn load_tags(&mut self, tags: &TagMap) {
        self.scope.clear();
        self.scope.push_constant(TAG, ReadOnlyMap::new(to_map(tags)));
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }
}

impl Default for FilterEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
