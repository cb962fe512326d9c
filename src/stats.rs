// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Statistics estimates cached on memo groups.

use std::any::Any;

/// An estimate of the data produced by a group's subtree. The memo treats the
/// payload as opaque: it stores one estimate per group and evicts it whenever
/// the group or any descendant changes. The statistics engine that computes
/// estimates owns the concrete type behind the `Any`.
pub struct Statistics(pub Box<dyn Any + Send + Sync + 'static>);

impl Statistics {
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Statistics(Box::new(value))
    }

    pub fn downcast_ref<V: 'static>(&self) -> Option<&V> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statistics").finish_non_exhaustive()
    }
}
