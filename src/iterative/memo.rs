use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use tracing::trace;

use crate::error::MemoError;
use crate::nodes::{
    ArcPlanNode, GroupRef, NodeType, PlanNode, PlanNodeIdAllocator, PlanNodeOrRef,
};
use crate::stats::Statistics;

/// Uniquely identifies a memo group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct GroupId(pub(crate) usize);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Synthetic parent id standing for the outside world. It pins the root group
/// against collection and never names a real group.
const ROOT_GROUP_REF: GroupId = GroupId(0);

/// Multiset of parent group ids holding references into a group. Duplicates
/// matter: while a member substitution is in flight, the same parent briefly
/// holds two back-edges to a child shared by the old and the new member.
#[derive(Default, Debug)]
struct IncomingRefs {
    counts: HashMap<GroupId, usize>,
    len: usize,
}

impl IncomingRefs {
    fn add(&mut self, parent: GroupId) {
        *self.counts.entry(parent).or_insert(0) += 1;
        self.len += 1;
    }

    /// Removes one occurrence of `parent`. Returns `false` if none is held.
    fn remove(&mut self, parent: GroupId) -> bool {
        match self.counts.get_mut(&parent) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&parent);
                }
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn count(&self, parent: GroupId) -> usize {
        self.counts.get(&parent).copied().unwrap_or(0)
    }

    /// Distinct parents, ignoring multiplicity.
    fn distinct(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.counts.keys().copied()
    }
}

/// An internment cell holding the current member node of one group, the
/// multiset of parents referencing it, and an optional cached estimate.
struct Group<T: NodeType> {
    member: ArcPlanNode<T>,
    incoming: IncomingRefs,
    stats: Option<Statistics>,
}

impl<T: NodeType> Group<T> {
    fn with_member(member: ArcPlanNode<T>) -> Self {
        Group {
            member,
            incoming: IncomingRefs::default(),
            stats: None,
        }
    }
}

/// Stores a plan in a form that is cheap to mutate locally, i.e. without
/// rewriting ancestor chains every time a rule rewrites a subtree of the
/// logically immutable plan.
///
/// Every node of the plan is interned into a numbered group and its children
/// are replaced with symbolic references to the corresponding groups. A plan
/// like:
///
/// ```text
/// A -> B -> C -> D
///        \> E -> F
/// ```
///
/// is stored as:
///
/// ```text
/// root: G1
/// G1: { A -> [G2] }
/// G2: { B -> [G3, G5] }
/// G3: { C -> [G4] }
/// G4: { D }
/// G5: { E -> [G6] }
/// G6: { F }
/// ```
///
/// Groups are reference-counted; groups that become unreachable from the root
/// after a member substitution are collected eagerly.
pub struct Memo<T: NodeType> {
    id_allocator: Arc<PlanNodeIdAllocator>,
    groups: HashMap<GroupId, Group<T>>,
    root_group: GroupId,
    next_group_id: usize,
}

impl<T: NodeType> Memo<T> {
    /// Interns the given plan and pins the resulting root group.
    pub fn new(
        id_allocator: Arc<PlanNodeIdAllocator>,
        plan: ArcPlanNode<T>,
    ) -> Result<Self, MemoError> {
        let mut memo = Memo {
            id_allocator,
            groups: HashMap::new(),
            root_group: ROOT_GROUP_REF,
            next_group_id: ROOT_GROUP_REF.0 + 1,
        };
        memo.root_group = memo.insert_recursive(&PlanNodeOrRef::PlanNode(plan))?;
        memo.group_mut(memo.root_group)?.incoming.add(ROOT_GROUP_REF);
        memo.verify_integrity();
        Ok(memo)
    }

    /// The group holding the root of the plan.
    pub fn root_group(&self) -> GroupId {
        self.root_group
    }

    /// Number of live groups in the store.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// All live group ids, sorted.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().sorted().collect_vec()
    }

    /// Returns the current member of the given group.
    pub fn get_node(&self, group: GroupId) -> Result<ArcPlanNode<T>, MemoError> {
        Ok(self.group(group)?.member.clone())
    }

    /// Returns the current member of the group a reference points to.
    pub fn resolve(&self, reference: &GroupRef) -> Result<ArcPlanNode<T>, MemoError> {
        self.get_node(reference.group_id)
    }

    /// Materializes the current logical plan into a self-contained tree with
    /// every group reference resolved to the referenced group's member.
    /// Terminates because the child graph is acyclic.
    pub fn extract(&self) -> Result<ArcPlanNode<T>, MemoError> {
        let root = self.get_node(self.root_group)?;
        self.extract_node(root)
    }

    fn extract_node(&self, node: ArcPlanNode<T>) -> Result<ArcPlanNode<T>, MemoError> {
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            let resolved = match child {
                PlanNodeOrRef::Ref(reference) => self.resolve(reference)?,
                PlanNodeOrRef::PlanNode(node) => node.clone(),
            };
            children.push(PlanNodeOrRef::PlanNode(self.extract_node(resolved)?));
        }
        Ok(Arc::new(node.replace_children(children)?))
    }

    /// Substitutes the member of `group` with a rewritten form of `node`.
    /// The rewrite must preserve the group's output columns; `reason` tags
    /// the rule that produced it for diagnostics. Returns the installed
    /// member, whose children are all group references.
    ///
    /// New back-edges are established before the old member's are retired so
    /// that a child group shared by both members never transits through zero
    /// incoming references mid-substitution.
    pub fn replace(
        &mut self,
        group: GroupId,
        node: PlanNodeOrRef<T>,
        reason: &str,
    ) -> Result<ArcPlanNode<T>, MemoError> {
        let old = self.group(group)?.member.clone();

        let old_outputs = old.output_columns();
        let new_outputs = node.output_columns();
        if old_outputs != new_outputs {
            return Err(MemoError::OutputColumnsChanged {
                reason: reason.to_string(),
                old: old_outputs,
                new: new_outputs,
            });
        }

        let rewritten = match node {
            // Collapsing onto an existing group: the rewrite installs that
            // group's current member, while accounting still targets `group`.
            PlanNodeOrRef::Ref(reference) => self.resolve(&reference)?,
            PlanNodeOrRef::PlanNode(node) => {
                Arc::new(self.insert_children_and_rewrite(&node)?)
            }
        };

        trace!(event = "replace", group = %group, reason, old = %old, new = %rewritten);
        self.increment_references(&rewritten, group)?;
        self.group_mut(group)?.member = rewritten.clone();
        self.decrement_references(&old, group)?;
        self.evict_statistics(group)?;
        self.verify_integrity();

        Ok(rewritten)
    }

    /// Returns the cached statistics estimate for `group`, if any.
    pub fn get_stats(&self, group: GroupId) -> Result<Option<&Statistics>, MemoError> {
        Ok(self.group(group)?.stats.as_ref())
    }

    /// Caches a statistics estimate for `group`. Overwriting an existing
    /// estimate first evicts the group and its ancestors, so a stored
    /// estimate always reflects one consistent snapshot of its descendants.
    pub fn store_stats(&mut self, group: GroupId, stats: Statistics) -> Result<(), MemoError> {
        if self.group(group)?.stats.is_some() {
            self.evict_statistics(group)?;
        }
        self.group_mut(group)?.stats = Some(stats);
        Ok(())
    }

    /// Drops the cached estimate of `group` and, transitively, of every
    /// ancestor. The visited set bounds the walk to one visit per group even
    /// when diamonds make a group reachable through several parents.
    fn evict_statistics(&mut self, group: GroupId) -> Result<(), MemoError> {
        let mut visited = HashSet::new();
        self.evict_statistics_inner(group, &mut visited)
    }

    fn evict_statistics_inner(
        &mut self,
        group: GroupId,
        visited: &mut HashSet<GroupId>,
    ) -> Result<(), MemoError> {
        if !visited.insert(group) {
            return Ok(());
        }
        trace!(event = "evict_statistics", group = %group);
        self.group_mut(group)?.stats = None;
        let parents = self.group(group)?.incoming.distinct().collect_vec();
        for parent in parents {
            if parent != ROOT_GROUP_REF {
                self.evict_statistics_inner(parent, visited)?;
            }
        }
        Ok(())
    }

    /// Renders the store one group per line, sorted by id.
    pub fn dump(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&format!("root: {}\n", self.root_group));
        for group_id in self.group_ids() {
            let member = &self.groups[&group_id].member;
            let children = member.children.iter().map(|child| child.to_string()).join(", ");
            if children.is_empty() {
                buf.push_str(&format!("{}: {{ {} }}\n", group_id, member.typ));
            } else {
                buf.push_str(&format!(
                    "{}: {{ {} -> [{}] }}\n",
                    group_id, member.typ, children
                ));
            }
        }
        buf
    }

    fn group(&self, group: GroupId) -> Result<&Group<T>, MemoError> {
        self.groups
            .get(&group)
            .ok_or(MemoError::InvalidGroup { group })
    }

    fn group_mut(&mut self, group: GroupId) -> Result<&mut Group<T>, MemoError> {
        self.groups
            .get_mut(&group)
            .ok_or(MemoError::InvalidGroup { group })
    }

    fn allocate_group_id(&mut self) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        GroupId(id)
    }

    /// Materializes an externally supplied subtree into the store and returns
    /// its group. A subtree that is already a group reference resolves to its
    /// group without creating anything; the caller owns the accounting for
    /// the edge it is about to form.
    fn insert_recursive(&mut self, node: &PlanNodeOrRef<T>) -> Result<GroupId, MemoError> {
        let node = match node {
            PlanNodeOrRef::Ref(reference) => return Ok(reference.group_id),
            PlanNodeOrRef::PlanNode(node) => node,
        };

        let group = self.allocate_group_id();
        let rewritten = Arc::new(self.insert_children_and_rewrite(node)?);
        trace!(event = "insert_group", group = %group, member = %rewritten);
        self.groups.insert(group, Group::with_member(rewritten.clone()));
        self.increment_references(&rewritten, group)?;

        Ok(group)
    }

    /// Interns every child of `node` and rebuilds the node with each child
    /// replaced by a freshly minted reference to its group.
    fn insert_children_and_rewrite(
        &mut self,
        node: &PlanNode<T>,
    ) -> Result<PlanNode<T>, MemoError> {
        let mut references = Vec::with_capacity(node.children.len());
        for child in &node.children {
            let outputs = child.output_columns();
            let group_id = self.insert_recursive(child)?;
            references.push(PlanNodeOrRef::Ref(GroupRef {
                id: self.id_allocator.next_id(),
                group_id,
                outputs,
            }));
        }
        node.replace_children(references)
    }

    /// Adds one back-edge from `from` to every distinct group referenced by
    /// the children of `node`.
    fn increment_references(
        &mut self,
        node: &ArcPlanNode<T>,
        from: GroupId,
    ) -> Result<(), MemoError> {
        for child in Self::referenced_groups(node) {
            self.group_mut(child)?.incoming.add(from);
        }
        Ok(())
    }

    /// Removes one back-edge from `from` to every distinct group referenced
    /// by the children of `node`, collecting any group whose incoming
    /// multiset drains.
    fn decrement_references(
        &mut self,
        node: &ArcPlanNode<T>,
        from: GroupId,
    ) -> Result<(), MemoError> {
        for child in Self::referenced_groups(node) {
            let record = self.group_mut(child)?;
            if !record.incoming.remove(from) {
                return Err(MemoError::invariant(format!(
                    "no back-edge from {from} to {child} to remove"
                )));
            }
            if record.incoming.is_empty() {
                self.delete_group(child)?;
            }
        }
        Ok(())
    }

    /// The distinct groups referenced by the children of `node`. Two
    /// references to the same child group contribute one element, and the
    /// accounting primitives apply the same collapse symmetrically on both
    /// the increment and the decrement side.
    fn referenced_groups(node: &ArcPlanNode<T>) -> Vec<GroupId> {
        node.children
            .iter()
            .filter_map(|child| match child {
                PlanNodeOrRef::Ref(reference) => Some(reference.group_id),
                PlanNodeOrRef::PlanNode(_) => None,
            })
            .unique()
            .collect_vec()
    }

    fn delete_group(&mut self, group: GroupId) -> Result<(), MemoError> {
        if !self.group(group)?.incoming.is_empty() {
            return Err(MemoError::DeleteWithReferences { group });
        }
        trace!(event = "delete_group", group = %group);
        let deleted = self
            .groups
            .remove(&group)
            .ok_or(MemoError::InvalidGroup { group })?;
        self.decrement_references(&deleted.member, group)
    }

    /// Structural self-check run after every public mutation in debug builds.
    fn verify_integrity(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        // Recount back-edges from the members and compare them with the
        // stored incoming multisets, including the synthetic root back-edge.
        let mut expected: HashMap<(GroupId, GroupId), usize> = HashMap::new();
        expected.insert((self.root_group, ROOT_GROUP_REF), 1);
        for (&parent, record) in &self.groups {
            for child in Self::referenced_groups(&record.member) {
                assert!(
                    self.groups.contains_key(&child),
                    "member of {parent} references missing group {child}"
                );
                *expected.entry((child, parent)).or_insert(0) += 1;
            }
        }
        let mut total_edges = 0;
        for (&group, record) in &self.groups {
            for parent in record.incoming.distinct() {
                let count = record.incoming.count(parent);
                assert_eq!(
                    count,
                    expected.get(&(group, parent)).copied().unwrap_or(0),
                    "back-edge count mismatch for {parent} -> {group}"
                );
                total_edges += count;
            }
        }
        assert_eq!(
            total_edges,
            expected.values().sum::<usize>(),
            "members hold references not covered by back-edges"
        );

        // Every group is reachable from the root and the child graph is a DAG.
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        self.check_reachable_acyclic(self.root_group, &mut visiting, &mut done);
        assert_eq!(done.len(), self.groups.len(), "unreachable groups in the store");
    }

    fn check_reachable_acyclic(
        &self,
        group: GroupId,
        visiting: &mut HashSet<GroupId>,
        done: &mut HashSet<GroupId>,
    ) {
        if done.contains(&group) {
            return;
        }
        assert!(visiting.insert(group), "cycle through {group}");
        for child in Self::referenced_groups(&self.groups[&group].member) {
            self.check_reachable_acyclic(child, visiting, done);
        }
        visiting.remove(&group);
        done.insert(group);
    }
}
