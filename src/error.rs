// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Error types raised by the memo.

use itertools::Itertools;
use thiserror::Error;

use crate::iterative::GroupId;
use crate::nodes::ColumnSet;

/// A contract violation observed by the memo. Every variant is fatal and
/// non-retriable: either an operation succeeds and the structural invariants
/// hold, or it fails before any partial mutation becomes observable.
#[derive(Debug, Error)]
pub enum MemoError {
    /// Lookup of a group id that is not (or no longer) in the store.
    #[error("invalid group: {group}")]
    InvalidGroup { group: GroupId },

    /// A rewrite would change the set of columns a group produces.
    #[error(
        "{reason}: transformed plan does not produce the same outputs: [{}] vs [{}]",
        format_columns(.old),
        format_columns(.new)
    )]
    OutputColumnsChanged {
        reason: String,
        old: ColumnSet,
        new: ColumnSet,
    },

    /// Internal accounting mismatch, e.g. a back-edge missing during
    /// decrement or a child arity mismatch while rebuilding a node. Indicates
    /// a bug in the memo or in a collaborator.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Deletion was requested for a group that still has incoming references.
    #[error("cannot delete group {group} that has incoming references")]
    DeleteWithReferences { group: GroupId },
}

impl MemoError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        MemoError::InvariantViolation(message.into())
    }
}

fn format_columns(columns: &ColumnSet) -> String {
    columns.iter().join(", ")
}
