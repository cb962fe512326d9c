// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;

use crate::iterative::{GroupId, Memo};
use crate::nodes::{
    ArcPlanNode, ArcPredNode, ColumnId, ColumnSet, NodeType, PlanNode, PlanNodeIdAllocator,
    PlanNodeOrRef, PredNode, Value,
};
use crate::stats::Statistics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemoTestRelTyp {
    Join,
    Project,
    Filter,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemoTestPredTyp {
    List,
    Expr,
    TableName,
    ColumnRef,
}

impl std::fmt::Display for MemoTestRelTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for MemoTestPredTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl NodeType for MemoTestRelTyp {
    type PredType = MemoTestPredTyp;

    fn derive_output_columns(
        &self,
        predicates: &[ArcPredNode<Self>],
        children: &[&ColumnSet],
    ) -> ColumnSet {
        match self {
            MemoTestRelTyp::Scan => columns_of(&predicates[1]),
            MemoTestRelTyp::Project => columns_of(&predicates[0]),
            MemoTestRelTyp::Filter => children[0].clone(),
            MemoTestRelTyp::Join => children.iter().flat_map(|c| c.iter().cloned()).collect(),
        }
    }
}

fn columns_of(list: &ArcPredNode<MemoTestRelTyp>) -> ColumnSet {
    list.children
        .iter()
        .map(|column| ColumnId::new(column.unwrap_data().as_str()))
        .collect()
}

pub(crate) fn columns(names: &[&str]) -> ColumnSet {
    names.iter().map(|name| ColumnId::new(*name)).collect()
}

pub(crate) fn join(
    left: impl Into<PlanNodeOrRef<MemoTestRelTyp>>,
    right: impl Into<PlanNodeOrRef<MemoTestRelTyp>>,
    cond: ArcPredNode<MemoTestRelTyp>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Join,
        children: vec![left.into(), right.into()],
        predicates: vec![cond],
    })
}

pub(crate) fn project(
    input: impl Into<PlanNodeOrRef<MemoTestRelTyp>>,
    outputs: &[&str],
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Project,
        children: vec![input.into()],
        predicates: vec![column_list(outputs)],
    })
}

pub(crate) fn filter(
    input: impl Into<PlanNodeOrRef<MemoTestRelTyp>>,
    cond: ArcPredNode<MemoTestRelTyp>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Filter,
        children: vec![input.into()],
        predicates: vec![cond],
    })
}

pub(crate) fn scan(table: &str, outputs: &[&str]) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Scan,
        children: vec![],
        predicates: vec![table_name(table), column_list(outputs)],
    })
}

pub(crate) fn table_name(table: &str) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::TableName,
        children: vec![],
        data: Some(Value::String(table.to_string().into())),
    })
}

pub(crate) fn column_ref(name: &str) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::ColumnRef,
        children: vec![],
        data: Some(Value::String(name.to_string().into())),
    })
}

pub(crate) fn column_list(names: &[&str]) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::List,
        children: names.iter().copied().map(column_ref).collect(),
        data: None,
    })
}

pub(crate) fn expr(data: Value) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::Expr,
        children: vec![],
        data: Some(data),
    })
}

/// Concrete estimate payload stored behind [`Statistics`] in tests.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TestEstimate {
    pub row_count: f64,
}

pub(crate) fn estimate(row_count: f64) -> Statistics {
    Statistics::new(TestEstimate { row_count })
}

/// `Join(Join(Scan t1, Scan t2), Project(Scan t3))`, producing columns
/// {a, b, c}. Interning numbers the groups 1 through 6 in preorder.
pub(crate) fn sample_plan() -> ArcPlanNode<MemoTestRelTyp> {
    join(
        join(scan("t1", &["a"]), scan("t2", &["b"]), expr(Value::Bool(true))),
        project(scan("t3", &["c"]), &["c"]),
        expr(Value::Bool(true)),
    )
}

pub(crate) fn new_memo(plan: ArcPlanNode<MemoTestRelTyp>) -> Memo<MemoTestRelTyp> {
    Memo::new(Arc::new(PlanNodeIdAllocator::new()), plan).expect("interning a fresh plan")
}

/// The group referenced by the `idx`-th child of `group`'s member.
pub(crate) fn child_group(memo: &Memo<MemoTestRelTyp>, group: GroupId, idx: usize) -> GroupId {
    memo.get_node(group)
        .expect("group must exist")
        .child(idx)
        .unwrap_ref()
        .group_id
}
