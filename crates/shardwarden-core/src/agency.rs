//! Agency abstraction: linearizable reads of Plan and Current plus
//! precondition-checked transactional writes.
//!
//! The agency holds two trees. `Plan` is the desired cluster state written
//! by the coordinators; `Current` is the observed state each DBServer reports
//! into. Both carry a monotonically increasing index that changes on every
//! write to that tree.
//!
//! Writes are expressed as an [`AgencyTransaction`]: a list of
//! [`Precondition`]s and a list of [`AgencyOperation`]s. Either every
//! precondition holds and every operation is applied, or nothing is.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The two agency trees this component reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgencyRoot {
    /// The desired state.
    Plan,
    /// The observed state.
    Current,
}

impl fmt::Display for AgencyRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => f.write_str("Plan"),
            Self::Current => f.write_str("Current"),
        }
    }
}

/// A path inside one of the agency trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgencyPath {
    root: AgencyRoot,
    segments: Vec<String>,
}

impl AgencyPath {
    /// Builds a path below `Plan`.
    #[must_use]
    pub fn plan<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: AgencyRoot::Plan,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a path below `Current`.
    #[must_use]
    pub fn current<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: AgencyRoot::Current,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the tree this path points into.
    #[must_use]
    pub const fn root(&self) -> AgencyRoot {
        self.root
    }

    /// Returns the path segments below the root.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for AgencyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// A consistent read of one agency tree.
#[derive(Debug, Clone, PartialEq)]
pub struct AgencySnapshot {
    /// The tree contents.
    pub tree: Value,
    /// The tree's index at the time of the read.
    pub index: u64,
}

/// A condition that must hold for a transaction to be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Precondition {
    /// The Current tree's index still equals the given value.
    CurrentIndex(u64),
    /// The value at `path` equals `expected` (`null` matches a missing value).
    ValueEquals {
        /// Where to look.
        path: AgencyPath,
        /// What must be there.
        expected: Value,
    },
}

/// A mutation applied by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AgencyOperation {
    /// Sets the value at `path`, creating intermediate objects.
    Set {
        /// Target path.
        path: AgencyPath,
        /// New value.
        value: Value,
    },
    /// Removes the value at `path`; a missing value is not an error.
    Delete {
        /// Target path.
        path: AgencyPath,
    },
}

impl AgencyOperation {
    /// Returns the path this operation mutates.
    #[must_use]
    pub fn path(&self) -> &AgencyPath {
        match self {
            Self::Set { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// An atomic, precondition-checked agency write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgencyTransaction {
    /// All of these must hold.
    pub preconditions: Vec<Precondition>,
    /// Applied in order when every precondition holds.
    pub operations: Vec<AgencyOperation>,
}

impl AgencyTransaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a precondition.
    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    /// Appends a set operation.
    pub fn set(&mut self, path: AgencyPath, value: Value) {
        self.operations.push(AgencyOperation::Set { path, value });
    }

    /// Appends a delete operation.
    pub fn delete(&mut self, path: AgencyPath) {
        self.operations.push(AgencyOperation::Delete { path });
    }

    /// Returns `true` if the transaction would not mutate anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Result of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Every operation was applied.
    Success {
        /// The Current index after the write.
        current_index: u64,
    },
    /// A precondition did not hold; nothing was applied.
    PreconditionFailed {
        /// The Current index observed while checking.
        current_index: u64,
        /// Human-readable description of the failed precondition.
        failed: String,
    },
}

/// Reads and writes the agency.
///
/// Implementations must make each read a consistent snapshot and each
/// write all-or-nothing.
#[async_trait]
pub trait AgencyBackend: Send + Sync {
    /// Reads the Plan tree and its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the agency is unreachable.
    async fn read_plan(&self) -> Result<AgencySnapshot>;

    /// Reads the Current tree and its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the agency is unreachable.
    async fn read_current(&self) -> Result<AgencySnapshot>;

    /// Applies a transaction atomically.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure. A failed precondition is
    /// reported as [`WriteResult::PreconditionFailed`], not as an error.
    async fn write(&self, transaction: AgencyTransaction) -> Result<WriteResult>;
}

/// Looks up the value at `segments` below `tree`.
#[must_use]
pub fn lookup<'a>(tree: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(tree, |node, segment| node.as_object()?.get(segment))
}

fn set_at(tree: &mut Value, segments: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        *tree = value;
        return Ok(());
    };
    let mut node = tree;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let object = node
            .as_object_mut()
            .ok_or_else(|| Error::agency("agency node is not an object"))?;
        node = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let object = node
        .as_object_mut()
        .ok_or_else(|| Error::agency("agency node is not an object"))?;
    object.insert(last.clone(), value);
    Ok(())
}

fn delete_at(tree: &mut Value, segments: &[String]) {
    let Some((last, parents)) = segments.split_last() else {
        *tree = Value::Object(Map::new());
        return;
    };
    let mut node = tree;
    for segment in parents {
        match node.as_object_mut().and_then(|o| o.get_mut(segment)) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(object) = node.as_object_mut() {
        object.remove(last);
    }
}

#[derive(Debug, Default)]
struct AgencyState {
    plan: Value,
    plan_index: u64,
    current: Value,
    current_index: u64,
    writes: u64,
}

impl AgencyState {
    fn tree(&self, root: AgencyRoot) -> &Value {
        match root {
            AgencyRoot::Plan => &self.plan,
            AgencyRoot::Current => &self.current,
        }
    }

    fn check(&self, precondition: &Precondition) -> Option<String> {
        match precondition {
            Precondition::CurrentIndex(expected) => (*expected != self.current_index).then(|| {
                format!(
                    "Current index is {} (expected {expected})",
                    self.current_index
                )
            }),
            Precondition::ValueEquals { path, expected } => {
                let matches = match lookup(self.tree(path.root()), path.segments()) {
                    Some(actual) => actual == expected,
                    None => expected.is_null(),
                };
                (!matches).then(|| format!("value at {path} changed"))
            }
        }
    }
}

/// In-memory agency for tests and embedders.
///
/// Thread-safe via `RwLock`. Indexes start at 1 and increase by one for
/// each write that touches the respective tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryAgency {
    state: Arc<RwLock<AgencyState>>,
}

fn poison_err<T>(_: T) -> Error {
    Error::agency("agency state lock poisoned")
}

impl MemoryAgency {
    /// Creates an agency holding the given trees.
    #[must_use]
    pub fn new(plan: Value, current: Value) -> Self {
        Self {
            state: Arc::new(RwLock::new(AgencyState {
                plan,
                plan_index: 1,
                current,
                current_index: 1,
                writes: 0,
            })),
        }
    }

    /// Replaces the whole Plan tree, bumping the plan index.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn replace_plan(&self, plan: Value) -> Result<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.plan = plan;
        state.plan_index += 1;
        Ok(state.plan_index)
    }

    /// Returns the number of transactions applied so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn applied_writes(&self) -> Result<u64> {
        Ok(self.state.read().map_err(poison_err)?.writes)
    }

    /// Returns the value at `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get(&self, path: &AgencyPath) -> Result<Option<Value>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(lookup(state.tree(path.root()), path.segments()).cloned())
    }
}

#[async_trait]
impl AgencyBackend for MemoryAgency {
    async fn read_plan(&self) -> Result<AgencySnapshot> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(AgencySnapshot {
            tree: state.plan.clone(),
            index: state.plan_index,
        })
    }

    async fn read_current(&self) -> Result<AgencySnapshot> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(AgencySnapshot {
            tree: state.current.clone(),
            index: state.current_index,
        })
    }

    async fn write(&self, transaction: AgencyTransaction) -> Result<WriteResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        for precondition in &transaction.preconditions {
            if let Some(failed) = state.check(precondition) {
                return Ok(WriteResult::PreconditionFailed {
                    current_index: state.current_index,
                    failed,
                });
            }
        }

        // Apply to copies so a failing operation leaves both trees untouched.
        let mut plan = state.plan.clone();
        let mut current = state.current.clone();
        let mut touched_plan = false;
        let mut touched_current = false;
        for operation in &transaction.operations {
            let path = operation.path();
            let tree = match path.root() {
                AgencyRoot::Plan => {
                    touched_plan = true;
                    &mut plan
                }
                AgencyRoot::Current => {
                    touched_current = true;
                    &mut current
                }
            };
            match operation {
                AgencyOperation::Set { value, .. } => set_at(tree, path.segments(), value.clone())?,
                AgencyOperation::Delete { .. } => delete_at(tree, path.segments()),
            }
        }

        state.plan = plan;
        state.current = current;
        if touched_plan {
            state.plan_index += 1;
        }
        if touched_current {
            state.current_index += 1;
        }
        state.writes += 1;

        Ok(WriteResult::Success {
            current_index: state.current_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_sets_nested_values_and_bumps_index() {
        let agency = MemoryAgency::new(json!({}), json!({}));
        let mut txn = AgencyTransaction::new().with_precondition(Precondition::CurrentIndex(1));
        txn.set(
            AgencyPath::current(["db", "collections", "c1", "s1"]),
            json!({"servers": ["A"]}),
        );

        let result = agency.write(txn).await.unwrap();
        assert_eq!(result, WriteResult::Success { current_index: 2 });

        let current = agency.read_current().await.unwrap();
        assert_eq!(current.index, 2);
        assert_eq!(
            current.tree["db"]["collections"]["c1"]["s1"]["servers"],
            json!(["A"])
        );
    }

    #[tokio::test]
    async fn stale_index_rejects_whole_transaction() {
        let agency = MemoryAgency::new(json!({}), json!({"db": {"x": 1}}));
        let mut txn = AgencyTransaction::new().with_precondition(Precondition::CurrentIndex(7));
        txn.set(AgencyPath::current(["db", "y"]), json!(2));
        txn.delete(AgencyPath::current(["db", "x"]));

        let result = agency.write(txn).await.unwrap();
        assert!(matches!(
            result,
            WriteResult::PreconditionFailed { current_index: 1, .. }
        ));

        let current = agency.read_current().await.unwrap();
        assert_eq!(current.tree, json!({"db": {"x": 1}}));
        assert_eq!(current.index, 1);
        assert_eq!(agency.applied_writes().unwrap(), 0);
    }

    #[tokio::test]
    async fn value_equals_treats_missing_as_null() {
        let agency = MemoryAgency::new(json!({}), json!({}));
        let mut txn = AgencyTransaction::new().with_precondition(Precondition::ValueEquals {
            path: AgencyPath::current(["db", "servers", "A"]),
            expected: Value::Null,
        });
        txn.set(AgencyPath::current(["db", "servers", "A"]), json!({"error": false}));
        assert!(matches!(
            agency.write(txn.clone()).await.unwrap(),
            WriteResult::Success { .. }
        ));
        assert!(matches!(
            agency.write(txn).await.unwrap(),
            WriteResult::PreconditionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn delete_of_missing_path_is_noop() {
        let agency = MemoryAgency::new(json!({}), json!({"a": {}}));
        let mut txn = AgencyTransaction::new();
        txn.delete(AgencyPath::current(["a", "b", "c"]));
        assert!(matches!(
            agency.write(txn).await.unwrap(),
            WriteResult::Success { .. }
        ));
        assert_eq!(agency.read_current().await.unwrap().tree, json!({"a": {}}));
    }

    #[tokio::test]
    async fn replace_plan_bumps_plan_index_only() {
        let agency = MemoryAgency::new(json!({}), json!({}));
        assert_eq!(agency.replace_plan(json!({"db": {}})).unwrap(), 2);
        assert_eq!(agency.read_plan().await.unwrap().index, 2);
        assert_eq!(agency.read_current().await.unwrap().index, 1);
    }

    #[test]
    fn paths_display_with_root() {
        let path = AgencyPath::current(["db", "servers", "A"]);
        assert_eq!(path.to_string(), "Current/db/servers/A");
        assert_eq!(
            lookup(&json!({"db": {"servers": {"A": 1}}}), path.segments()),
            Some(&json!(1))
        );
    }
}
