//! Two-phase mutation of an allocator.
//!
//! A mutation first builds replacement bytes for every touched substream
//! and checks they fit ([`PackedDispatcher::prepare`]); nothing is modified
//! at that point. Committing the prepared value then applies every change
//! at once and cannot fail. The prepared value borrows the allocator, so
//! no other change can slip in between the two phases.
//!
//! [`PackedDispatcher::prepare`]: crate::PackedDispatcher::prepare

use std::fmt;

use tessera_common::Result;
use tracing::trace;

use crate::allocator::{AllocationPlan, ElementUpdate, PackedAllocator};

/// Outcome of an update that may run out of space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Success,
    Failure,
}

impl UpdateStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateStatus::Success)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::Success => f.write_str("success"),
            UpdateStatus::Failure => f.write_str("failure"),
        }
    }
}

/// Validated replacement state for one allocator.
#[must_use = "a prepared mutation does nothing until committed"]
pub struct PreparedMutation<'a> {
    allocator: &'a mut PackedAllocator,
    plan: AllocationPlan,
}

impl<'a> PreparedMutation<'a> {
    /// Validates `updates` against `allocator` without modifying it.
    ///
    /// Fails with `OutOfSpace` when the result would not fit.
    pub(crate) fn prepare(allocator: &'a mut PackedAllocator, updates: Vec<ElementUpdate>) -> Result<Self> {
        let plan = allocator.plan(updates)?;
        Ok(Self { allocator, plan })
    }

    /// Free-space change the commit will cause.
    pub fn free_space_delta(&self) -> isize {
        self.plan.free_space_delta()
    }

    /// Free space once committed.
    pub fn free_space_after(&self) -> usize {
        self.allocator.client_area() - self.plan.data_end()
    }

    /// Applies the prepared state.
    pub fn commit(self) {
        trace!(
            delta = self.plan.free_space_delta(),
            "committing prepared mutation"
        );
        self.allocator.apply(self.plan);
    }
}

impl fmt::Debug for PreparedMutation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedMutation")
            .field("free_space_delta", &self.plan.free_space_delta())
            .finish()
    }
}
