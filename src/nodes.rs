// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The plan node model the memo operates on. Plan nodes are dynamically typed
//! over a [`NodeType`] and logically immutable: a rewrite never mutates a node
//! in place but builds a sibling with substituted children. Children are
//! either materialized nodes or symbolic references to memo groups.

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MemoError;
use crate::iterative::GroupId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerializableOrderedF64(pub OrderedFloat<f64>);

impl Serialize for SerializableOrderedF64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0 .0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializableOrderedF64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let float = f64::deserialize(deserializer)?;
        Ok(SerializableOrderedF64(OrderedFloat(float)))
    }
}

/// A literal payload carried by a predicate node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float(SerializableOrderedF64),
    String(Arc<str>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(x) => write!(f, "{x}"),
            Self::Int32(x) => write!(f, "{x}(i32)"),
            Self::Int64(x) => write!(f, "{x}(i64)"),
            Self::UInt64(x) => write!(f, "{x}(u64)"),
            Self::Float(x) => write!(f, "{}(float)", x.0),
            Self::String(x) => write!(f, "\"{x}\""),
        }
    }
}

/// The `as_*()` accessors do not convert; they panic when the variant does
/// not match.
impl Value {
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            _ => panic!("Value is not a bool"),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Value::Int32(v) => *v,
            _ => panic!("Value is not an i32"),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int64(v) => *v,
            _ => panic!("Value is not an i64"),
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            Value::UInt64(v) => *v,
            _ => panic!("Value is not a u64"),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(v) => *v.0,
            _ => panic!("Value is not an f64"),
        }
    }

    pub fn as_str(&self) -> Arc<str> {
        match self {
            Value::String(v) => v.clone(),
            _ => panic!("Value is not a string"),
        }
    }
}

/// A column produced by a plan node, identified by symbol name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnId(pub Arc<str>);

impl ColumnId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ColumnId(name.into())
    }
}

impl Display for ColumnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unordered set of columns a plan node produces.
pub type ColumnSet = BTreeSet<ColumnId>;

/// Uniquely identifies a plan node within one planning session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
pub struct PlanNodeId(pub usize);

impl Display for PlanNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out monotonically increasing [`PlanNodeId`]s. The allocator is
/// shared between the memo and the surrounding planner so that ids minted for
/// group references never collide with ids already present in the plan under
/// optimization.
pub struct PlanNodeIdAllocator {
    next: AtomicUsize,
}

impl PlanNodeIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Starts allocation above ids already taken by an existing plan.
    pub fn starting_at(next: usize) -> Self {
        PlanNodeIdAllocator {
            next: AtomicUsize::new(next),
        }
    }

    pub fn next_id(&self) -> PlanNodeId {
        PlanNodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync + Sized
{
    type PredType: PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync;

    /// Derives the set of columns a node of this type produces from its
    /// predicates and the output sets of its children.
    fn derive_output_columns(
        &self,
        predicates: &[ArcPredNode<Self>],
        children: &[&ColumnSet],
    ) -> ColumnSet;
}

/// A pointer to a plan node
pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

/// A pointer to a predicate node
pub type ArcPredNode<T> = Arc<PredNode<T>>;

/// A symbolic reference to a memo group, standing in for whatever subtree the
/// group currently holds. Carries a snapshot of the referenced group's output
/// columns taken when the reference was minted; member substitution preserves
/// output sets, so the snapshot never goes stale.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct GroupRef {
    pub id: PlanNodeId,
    pub group_id: GroupId,
    pub outputs: ColumnSet,
}

impl Display for GroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.group_id)
    }
}

/// A child position in a plan tree: either a materialized plan node or a
/// reference to a memo group. Members installed in the memo use the reference
/// form for every child; plans handed in from outside use the materialized
/// form.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PlanNodeOrRef<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Ref(GroupRef),
}

impl<T: NodeType> PlanNodeOrRef<T> {
    pub fn is_materialized(&self) -> bool {
        match self {
            PlanNodeOrRef::PlanNode(_) => true,
            PlanNodeOrRef::Ref(_) => false,
        }
    }

    pub fn unwrap_plan_node(&self) -> ArcPlanNode<T> {
        match self {
            PlanNodeOrRef::PlanNode(node) => node.clone(),
            PlanNodeOrRef::Ref(_) => panic!("Expected PlanNode, found Ref"),
        }
    }

    pub fn unwrap_ref(&self) -> &GroupRef {
        match self {
            PlanNodeOrRef::PlanNode(_) => panic!("Expected Ref, found PlanNode"),
            PlanNodeOrRef::Ref(reference) => reference,
        }
    }

    /// The columns this child produces: derived for a materialized node,
    /// read from the snapshot for a group reference.
    pub fn output_columns(&self) -> ColumnSet {
        match self {
            PlanNodeOrRef::PlanNode(node) => node.output_columns(),
            PlanNodeOrRef::Ref(reference) => reference.outputs.clone(),
        }
    }
}

impl<T: NodeType> std::fmt::Display for PlanNodeOrRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanNodeOrRef::PlanNode(node) => write!(f, "{}", node),
            PlanNodeOrRef::Ref(reference) => write!(f, "{}", reference),
        }
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrRef<T> {
    fn from(value: PlanNode<T>) -> Self {
        Self::PlanNode(value.into())
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrRef<T> {
    fn from(value: ArcPlanNode<T>) -> Self {
        Self::PlanNode(value)
    }
}

impl<T: NodeType> From<GroupRef> for PlanNodeOrRef<T> {
    fn from(value: GroupRef) -> Self {
        Self::Ref(value)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PlanNode<T: NodeType> {
    /// A generic plan node type
    pub typ: T,
    /// Child plan nodes, materialized or symbolic depending on how this node
    /// was built
    pub children: Vec<PlanNodeOrRef<T>>,
    /// Predicate nodes, always materialized
    pub predicates: Vec<ArcPredNode<T>>,
}

impl<T: NodeType> std::fmt::Display for PlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        for pred in &self.predicates {
            write!(f, " {}", pred)?;
        }
        write!(f, ")")
    }
}

impl<T: NodeType> PlanNode<T> {
    pub fn child(&self, idx: usize) -> PlanNodeOrRef<T> {
        self.children[idx].clone()
    }

    pub fn predicate(&self, idx: usize) -> ArcPredNode<T> {
        self.predicates[idx].clone()
    }

    /// The set of columns this node produces, derived bottom-up through
    /// materialized children and read from snapshots at group references.
    pub fn output_columns(&self) -> ColumnSet {
        let child_outputs: Vec<ColumnSet> =
            self.children.iter().map(|c| c.output_columns()).collect();
        let child_outputs: Vec<&ColumnSet> = child_outputs.iter().collect();
        self.typ
            .derive_output_columns(&self.predicates, &child_outputs)
    }

    /// Builds a node of the same type with its children substituted
    /// positionally. The replacement list must match the current arity.
    pub fn replace_children(
        &self,
        children: Vec<PlanNodeOrRef<T>>,
    ) -> Result<PlanNode<T>, MemoError> {
        if children.len() != self.children.len() {
            return Err(MemoError::invariant(format!(
                "{}: replacement children arity mismatch, expected {} but got {}",
                self.typ,
                self.children.len(),
                children.len()
            )));
        }
        Ok(PlanNode {
            typ: self.typ.clone(),
            children,
            predicates: self.predicates.clone(),
        })
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PredNode<T: NodeType> {
    /// A generic predicate node type
    pub typ: T::PredType,
    /// Child predicate nodes, always materialized
    pub children: Vec<ArcPredNode<T>>,
    /// Data associated with the predicate, if any
    pub data: Option<Value>,
}

impl<T: NodeType> std::fmt::Display for PredNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        if let Some(data) = &self.data {
            write!(f, " {}", data)?;
        }
        write!(f, ")")
    }
}

impl<T: NodeType> PredNode<T> {
    pub fn child(&self, idx: usize) -> ArcPredNode<T> {
        self.children[idx].clone()
    }

    pub fn unwrap_data(&self) -> Value {
        self.data.clone().unwrap()
    }
}
