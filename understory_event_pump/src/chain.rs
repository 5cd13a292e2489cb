// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The filter chain owned by a [`Dispatcher`](crate::dispatch::Dispatcher).
//!
//! ## Ordering
//!
//! The chain is stored as two consecutive runs:
//!
//! ```text
//! [ generic/hierarchy filters, oldest → newest | modal filters, least → most specific ]
//! ```
//!
//! and is evaluated back to front. So:
//!
//! - modal filters are asked before any non-modal filter;
//! - among modal filters, the most specific (see [`ModalFilter::specificity`]) is asked
//!   first; equally specific filters are asked newest first;
//! - among non-modal filters, the most recently added is asked first.
//!
//! A filter handle already in the chain is never added twice, and removing a filter that is
//! not in the chain does nothing.
//!
//! ## Locking
//!
//! Mutation takes the chain lock and may happen from any thread. Evaluation snapshots the
//! chain under the lock and classifies with the lock released, so filters (and the code they
//! call) are free to add or remove filters while an event is being classified.

use core::cmp::Ordering;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::event::Event;
use crate::filter::{Filter, FilterAction};
use crate::modal::ModalFilter;
use crate::window::WindowKey;

/// Snapshot of the chain in evaluation order.
pub type ChainSnapshot<W> = SmallVec<[Filter<W>; 4]>;

/// Ordered, lock-protected collection of filters.
#[derive(Debug)]
pub struct FilterChain<W> {
    filters: Mutex<Vec<Filter<W>>>,
}

impl<W: WindowKey> Default for FilterChain<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: WindowKey> FilterChain<W> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Add `filter`. Returns `false` if this handle was already in the chain.
    pub fn add(&self, filter: Filter<W>) -> bool {
        let mut filters = self.filters.lock();
        if filters.iter().any(|f| f.same(&filter)) {
            return false;
        }
        let first_modal = filters
            .iter()
            .position(|f| f.as_modal().is_some())
            .unwrap_or(filters.len());
        let at = match filter.as_modal() {
            Some(new) => modal_slot(&filters[first_modal..], new) + first_modal,
            None => first_modal,
        };
        filters.insert(at, filter);
        true
    }

    /// Remove `filter`. Returns `false` (and does nothing) if it was not in the chain.
    pub fn remove(&self, filter: &Filter<W>) -> bool {
        let mut filters = self.filters.lock();
        match filters.iter().position(|f| f.same(filter)) {
            Some(i) => {
                filters.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether this handle is in the chain.
    pub fn contains(&self, filter: &Filter<W>) -> bool {
        self.filters.lock().iter().any(|f| f.same(filter))
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.lock().len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.filters.lock().is_empty()
    }

    /// The filters in evaluation order (first asked first).
    pub fn snapshot(&self) -> ChainSnapshot<W> {
        self.filters.lock().iter().rev().cloned().collect()
    }

    /// Run `event` through the chain.
    ///
    /// Returns [`FilterAction::Reject`] if any filter asked rejects it,
    /// [`FilterAction::AcceptImmediately`] if a filter short-circuited, and
    /// [`FilterAction::Accept`] if every filter accepted.
    pub fn evaluate(&self, event: &Event<W>) -> FilterAction {
        for filter in self.snapshot() {
            match filter.classify(event) {
                FilterAction::Accept => {}
                verdict => return verdict,
            }
        }
        FilterAction::Accept
    }
}

/// Index within the modal run at which `new` keeps the run sorted by specificity.
fn modal_slot<W: WindowKey>(modal_run: &[Filter<W>], new: &ModalFilter<W>) -> usize {
    modal_run
        .iter()
        .position(|f| {
            f.as_modal()
                .is_some_and(|m| m.specificity(new) == Ordering::Greater)
        })
        .unwrap_or(modal_run.len())
}
