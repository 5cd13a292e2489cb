// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event filters: classify one event as accept, reject, or accept immediately.
//!
//! ## Overview
//!
//! A [`Filter`] is one of a small closed set of variants:
//!
//! - [`Filter::Generic`]: any application-supplied [`EventFilter`] (closures work too);
//! - [`Filter::Hierarchy`]: a [`HierarchyFilter`] that restricts input to one node's subtree;
//! - [`Filter::Modal`]: a [`ModalFilter`](crate::modal::ModalFilter) scoped to one modal window.
//!
//! Filters are compared by identity: two [`Filter`] values are the same filter when they
//! share the same allocation. Cloning a [`Filter`] clones the handle, not the filter.
//!
//! ## Semantics
//!
//! The [`FilterChain`](crate::chain::FilterChain) asks each filter in turn:
//!
//! - [`FilterAction::Reject`] drops the event; no later filter is asked.
//! - [`FilterAction::AcceptImmediately`] dispatches the event; no later filter is asked.
//! - [`FilterAction::Accept`] passes the event on to the next filter.
//!
//! ```
//! use std::sync::Arc;
//! use understory_event_pump::event::{Event, EventKind};
//! use understory_event_pump::filter::{Filter, FilterAction};
//!
//! let no_keys = Filter::generic(|ev: &Event<u32>| {
//!     if ev.kind() == EventKind::Key { FilterAction::Reject } else { FilterAction::Accept }
//! });
//! assert_eq!(no_keys.classify(&Event::new(EventKind::Key, Some(1))), FilterAction::Reject);
//! assert_eq!(no_keys.classify(&Event::mouse(1)), FilterAction::Accept);
//! assert!(no_keys.same(&no_keys.clone()));
//! ```

use core::fmt;
use std::sync::Arc;

use crate::event::Event;
use crate::modal::ModalFilter;
use crate::window::{ModalExclusion, WindowKey, WindowTree};

/// Verdict of a filter for one event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterAction {
    /// Let the next filter decide.
    Accept,
    /// Drop the event.
    Reject,
    /// Dispatch the event without asking any further filter.
    AcceptImmediately,
}

/// Application-supplied filter.
///
/// Called on the dispatch thread; must not block.
pub trait EventFilter<W>: Send + Sync {
    /// Classify one event.
    fn classify(&self, event: &Event<W>) -> FilterAction;
}

impl<W, F: Fn(&Event<W>) -> FilterAction + Send + Sync> EventFilter<W> for F {
    fn classify(&self, event: &Event<W>) -> FilterAction {
        self(event)
    }
}

/// A filter handle held by the chain.
pub enum Filter<W> {
    /// Application-supplied filter.
    Generic(Arc<dyn EventFilter<W>>),
    /// Restricts modal-relevant input to a subtree.
    Hierarchy(Arc<HierarchyFilter<W>>),
    /// Blocks input according to one modal window.
    Modal(Arc<ModalFilter<W>>),
}

impl<W> Clone for Filter<W> {
    fn clone(&self) -> Self {
        match self {
            Self::Generic(f) => Self::Generic(Arc::clone(f)),
            Self::Hierarchy(f) => Self::Hierarchy(Arc::clone(f)),
            Self::Modal(f) => Self::Modal(Arc::clone(f)),
        }
    }
}

impl<W> fmt::Debug for Filter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (variant, ptr) = match self {
            Self::Generic(x) => ("Generic", Arc::as_ptr(x).cast::<()>()),
            Self::Hierarchy(x) => ("Hierarchy", Arc::as_ptr(x).cast::<()>()),
            Self::Modal(x) => ("Modal", Arc::as_ptr(x).cast::<()>()),
        };
        f.debug_tuple(variant).field(&ptr).finish()
    }
}

impl<W: 'static> Filter<W> {
    /// Wrap an application filter.
    pub fn generic(filter: impl EventFilter<W> + 'static) -> Self {
        Self::Generic(Arc::new(filter))
    }
}

impl<W: WindowKey> Filter<W> {
    /// Classify one event.
    pub fn classify(&self, event: &Event<W>) -> FilterAction {
        match self {
            Self::Generic(f) => f.classify(event),
            Self::Hierarchy(f) => f.classify(event),
            Self::Modal(f) => f.classify(event),
        }
    }
}

impl<W> Filter<W> {
    /// Whether `self` and `other` are handles to the same filter.
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Generic(a), Self::Generic(b)) => {
                core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Self::Hierarchy(a), Self::Hierarchy(b)) => Arc::ptr_eq(a, b),
            (Self::Modal(a), Self::Modal(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The modal filter behind this handle, if it is one.
    pub fn as_modal(&self) -> Option<&Arc<ModalFilter<W>>> {
        match self {
            Self::Modal(f) => Some(f),
            _ => None,
        }
    }
}

/// Restricts modal-relevant input to the subtree of one node.
///
/// Events whose source is contained in (or owned by) `target` pass, as do events for
/// exempt nodes and for windows excluded from application modality on the way up.
/// Everything else that is modal-relevant is rejected. With no target, every event passes.
pub struct HierarchyFilter<W> {
    target: Option<W>,
    tree: Arc<dyn WindowTree<W>>,
}

impl<W: fmt::Debug> fmt::Debug for HierarchyFilter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyFilter")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl<W: WindowKey> HierarchyFilter<W> {
    /// Create a filter scoped to `target`'s subtree.
    pub fn new(target: Option<W>, tree: Arc<dyn WindowTree<W>>) -> Self {
        Self { target, tree }
    }

    /// The node whose subtree stays interactive.
    pub fn target(&self) -> Option<W> {
        self.target
    }

    /// Classify one event.
    pub fn classify(&self, event: &Event<W>) -> FilterAction {
        let Some(target) = self.target else {
            return FilterAction::Accept;
        };
        if !event.kind().is_modal_relevant() {
            return FilterAction::Accept;
        }
        let Some(source) = event.source() else {
            return FilterAction::Accept;
        };
        if self.tree.is_modal_exempt(source) {
            return FilterAction::Accept;
        }
        let tree = &*self.tree;
        let mut cur = Some(source);
        while let Some(node) = cur {
            if node == target {
                return FilterAction::Accept;
            }
            if tree.is_window(node) {
                if tree.is_modal_excluded(node, ModalExclusion::Application) {
                    return FilterAction::Accept;
                }
                cur = tree.parent(node).or_else(|| tree.owner(node));
            } else {
                cur = tree.parent(node);
            }
        }
        FilterAction::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::window::{WindowProps, WindowRegistry};

    fn tree() -> Arc<WindowRegistry<u32>> {
        let reg = WindowRegistry::new();
        reg.add_window(
            1,
            WindowProps {
                visible: true,
                ..WindowProps::default()
            },
        );
        reg.add_component(10, 1);
        reg.add_component(11, 10);
        reg.add_component(12, 1);
        reg.add_window(
            2,
            WindowProps {
                owner: Some(1),
                visible: true,
                ..WindowProps::default()
            },
        );
        reg.add_component(20, 2);
        Arc::new(reg)
    }

    #[test]
    fn hierarchy_keeps_subtree_interactive() {
        let filter = HierarchyFilter::<u32>::new(Some(10), tree());
        assert_eq!(filter.classify(&Event::mouse(11)), FilterAction::Accept);
        assert_eq!(filter.classify(&Event::mouse(10)), FilterAction::Accept);
        assert_eq!(filter.classify(&Event::mouse(12)), FilterAction::Reject);
        assert_eq!(filter.classify(&Event::action(20)), FilterAction::Reject);
    }

    #[test]
    fn hierarchy_walks_owners_past_windows() {
        // Window 2 is owned by 1, so a filter on 1 keeps 2 interactive.
        let filter = HierarchyFilter::<u32>::new(Some(1), tree());
        assert_eq!(filter.classify(&Event::mouse(20)), FilterAction::Accept);
    }

    #[test]
    fn hierarchy_ignores_non_modal_kinds_and_sourceless_events() {
        let filter = HierarchyFilter::<u32>::new(Some(10), tree());
        assert_eq!(
            filter.classify(&Event::new(EventKind::Key, Some(12))),
            FilterAction::Accept
        );
        assert_eq!(
            filter.classify(&Event::new(EventKind::Mouse, None)),
            FilterAction::Accept
        );
    }

    #[test]
    fn hierarchy_without_target_accepts_everything() {
        let filter = HierarchyFilter::<u32>::new(None, tree());
        assert_eq!(filter.classify(&Event::mouse(12)), FilterAction::Accept);
    }

    #[test]
    fn hierarchy_respects_exemptions() {
        let reg = tree();
        reg.set_exempt(12, true);
        reg.set_exclusion(2, ModalExclusion::Application);
        let filter = HierarchyFilter::<u32>::new(Some(10), reg);
        assert_eq!(filter.classify(&Event::mouse(12)), FilterAction::Accept);
        assert_eq!(filter.classify(&Event::mouse(20)), FilterAction::Accept);
    }

    #[test]
    fn identity_is_per_allocation() {
        let a: Filter<u32> = Filter::generic(|_: &Event<u32>| FilterAction::Accept);
        let b: Filter<u32> = Filter::generic(|_: &Event<u32>| FilterAction::Accept);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert!(a.as_modal().is_none());
    }
}
