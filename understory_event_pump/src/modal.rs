// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Modal filters: keep a blocked part of the window hierarchy from receiving input.
//!
//! ## Overview
//!
//! A [`ModalFilter`] is created for one modal window (the "dialog") when it is shown, and
//! scopes its blocking by the dialog's [`Modality`]:
//!
//! | Modality | Window in the dialog's ownership chain | Window elsewhere |
//! |---|---|---|
//! | [`Document`](Modality::Document) | accept immediately | reject up to the dialog's document root; accept past it |
//! | [`Application`](Modality::Application) | accept immediately | reject in the dialog's scope; accept in other scopes |
//! | [`Toolkit`](Modality::Toolkit) | accept immediately | reject, including other scopes |
//!
//! Windows excluded from modality (see [`ModalExclusion`]) are always accepted: application
//! exclusion is enough for document- and application-modal dialogs, toolkit-modal dialogs
//! require toolkit exclusion.
//!
//! Only pointer, action and close events are filtered; everything else passes. Events are
//! resolved to the top-level window that contains their source before the table applies.
//!
//! ## Failing open
//!
//! A filter accepts everything once it is [disabled](ModalFilter::disable) or once its dialog
//! is no longer visible. The pump may still hold the filter for a moment after the dialog is
//! hidden, and a stale filter must never keep blocking input.
//!
//! ## Ordering
//!
//! When several dialogs are modal at once, the chain asks the most specific filter first.
//! [`ModalFilter::specificity`] orders two filters:
//!
//! 1. a dialog owned (transitively) by the other dialog is more specific;
//! 2. otherwise a dialog that blocks (transitively) the other dialog is more specific;
//! 3. otherwise the stronger modality is more specific.
//!
//! Unrelated dialogs of equal modality compare equal; the chain then asks the most recently
//! added one first.

use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::PumpError;
use crate::event::Event;
use crate::filter::FilterAction;
use crate::window::{ModalExclusion, Modality, ScopeId, WindowKey, WindowTree, is_owned_by};

// Guards blocker walks against cycles in a misbehaving tree.
const MAX_BLOCKER_CHAIN: usize = 64;

/// Filter for one modal dialog.
pub struct ModalFilter<W> {
    dialog: W,
    modality: Modality,
    document_root: W,
    scope: ScopeId,
    disabled: AtomicBool,
    tree: Arc<dyn WindowTree<W>>,
}

impl<W: fmt::Debug> fmt::Debug for ModalFilter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModalFilter")
            .field("dialog", &self.dialog)
            .field("modality", &self.modality)
            .field("document_root", &self.document_root)
            .field("scope", &self.scope)
            .field("disabled", &self.disabled.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<W: WindowKey> ModalFilter<W> {
    /// Create the filter for `dialog`.
    ///
    /// The dialog's modality, document root and scope are captured now. Fails with
    /// [`PumpError::NotModal`] if `dialog` has no modality.
    pub fn new(dialog: W, tree: Arc<dyn WindowTree<W>>) -> Result<Self, PumpError> {
        let modality = tree
            .modality(dialog)
            .ok_or_else(|| PumpError::NotModal(format!("{dialog:?}")))?;
        Ok(Self {
            dialog,
            modality,
            document_root: tree.document_root(dialog),
            scope: tree.app_scope(dialog),
            disabled: AtomicBool::new(false),
            tree,
        })
    }

    /// The modal dialog this filter serves.
    pub fn dialog(&self) -> W {
        self.dialog
    }

    /// The dialog's modality, as captured at creation.
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Stop blocking. Used when the dialog is hidden before its pump has removed the filter.
    pub fn disable(&self) {
        self.disabled.store(true, AtomicOrdering::Release);
    }

    /// Whether [`disable`](Self::disable) has been called.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(AtomicOrdering::Acquire)
    }

    /// Whether this filter currently blocks anything.
    pub fn is_active(&self) -> bool {
        !self.is_disabled() && self.tree.is_visible(self.dialog)
    }

    /// Classify one event.
    pub fn classify(&self, event: &Event<W>) -> FilterAction {
        if !self.is_active() || !event.kind().is_modal_relevant() {
            return FilterAction::Accept;
        }
        let Some(source) = event.source() else {
            return FilterAction::Accept;
        };
        if self.tree.is_modal_exempt(source) {
            return FilterAction::Accept;
        }
        match self.tree.window_of(source) {
            Some(window) => self.accept_window(window),
            None => FilterAction::Accept,
        }
    }

    /// Classify input for the top-level `window`, ignoring event kind and filter state.
    pub fn accept_window(&self, window: W) -> FilterAction {
        decide_with(
            &*self.tree,
            self.dialog,
            self.modality,
            self.document_root,
            self.scope,
            window,
        )
    }

    /// Compare specificity with `other`; [`Ordering::Greater`] means `self` is asked first.
    pub fn specificity(&self, other: &Self) -> Ordering {
        let tree = &*self.tree;
        let (a, b) = (self.dialog, other.dialog);
        if a == b {
            return self.modality.cmp(&other.modality);
        }
        if is_owned_by(tree, a, b) {
            return Ordering::Greater;
        }
        if is_owned_by(tree, b, a) {
            return Ordering::Less;
        }
        if blocked_by(tree, a, b) {
            return Ordering::Less;
        }
        if blocked_by(tree, b, a) {
            return Ordering::Greater;
        }
        self.modality.cmp(&other.modality)
    }
}

/// Whether `window` is (transitively) blocked by `dialog`.
fn blocked_by<W: WindowKey>(tree: &dyn WindowTree<W>, window: W, dialog: W) -> bool {
    let mut cur = tree.current_blocker(window);
    for _ in 0..MAX_BLOCKER_CHAIN {
        match cur {
            Some(b) if b == dialog => return true,
            Some(b) => cur = tree.current_blocker(b),
            None => return false,
        }
    }
    false
}

/// Decide how `dialog` with `modality` treats input for `window`, using live tree state.
pub(crate) fn decide<W: WindowKey, T: WindowTree<W> + ?Sized>(
    tree: &T,
    dialog: W,
    modality: Modality,
    window: W,
) -> FilterAction {
    let root = tree.document_root(dialog);
    let scope = tree.app_scope(dialog);
    decide_with(tree, dialog, modality, root, scope, window)
}

fn decide_with<W: WindowKey, T: WindowTree<W> + ?Sized>(
    tree: &T,
    dialog: W,
    modality: Modality,
    root: W,
    scope: ScopeId,
    window: W,
) -> FilterAction {
    match modality {
        Modality::Document => {
            if tree.is_modal_excluded(window, ModalExclusion::Application) {
                return FilterAction::Accept;
            }
            let mut cur = Some(window);
            while let Some(w) = cur {
                if w == dialog {
                    return FilterAction::AcceptImmediately;
                }
                if w == root {
                    return FilterAction::Reject;
                }
                cur = tree.owner(w);
            }
            FilterAction::Accept
        }
        Modality::Application => {
            if tree.is_modal_excluded(window, ModalExclusion::Application) {
                return FilterAction::Accept;
            }
            if tree.app_scope(window) != scope {
                return FilterAction::Accept;
            }
            owned_or_reject(tree, window, dialog)
        }
        Modality::Toolkit => {
            if tree.is_modal_excluded(window, ModalExclusion::Toolkit) {
                return FilterAction::Accept;
            }
            if tree.app_scope(window) != scope {
                return FilterAction::Reject;
            }
            owned_or_reject(tree, window, dialog)
        }
    }
}

fn owned_or_reject<W: WindowKey, T: WindowTree<W> + ?Sized>(
    tree: &T,
    window: W,
    dialog: W,
) -> FilterAction {
    if is_owned_by(tree, window, dialog) {
        FilterAction::AcceptImmediately
    } else {
        FilterAction::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::window::{WindowProps, WindowRegistry};

    // 1: frame (scope 0)
    //   2: dialog owned by 1
    //     3: dialog owned by 2
    // 4: unrelated frame (scope 0)
    // 5: frame in scope 7
    fn registry() -> Arc<WindowRegistry<u32>> {
        let reg = WindowRegistry::new();
        let visible = WindowProps {
            visible: true,
            ..WindowProps::default()
        };
        reg.add_window(1, visible.clone());
        reg.add_window(
            2,
            WindowProps {
                owner: Some(1),
                ..visible.clone()
            },
        );
        reg.add_window(
            3,
            WindowProps {
                owner: Some(2),
                ..visible.clone()
            },
        );
        reg.add_window(4, visible.clone());
        reg.add_window(
            5,
            WindowProps {
                scope: ScopeId(7),
                ..visible
            },
        );
        reg.add_component(10, 1);
        reg.add_component(40, 4);
        Arc::new(reg)
    }

    fn filter(reg: &Arc<WindowRegistry<u32>>, dialog: u32, modality: Modality) -> ModalFilter<u32> {
        reg.set_modality(dialog, Some(modality));
        ModalFilter::new(dialog, reg.clone()).unwrap()
    }

    #[test]
    fn modeless_window_has_no_filter() {
        let reg = registry();
        assert!(matches!(
            ModalFilter::<u32>::new(1, reg),
            Err(PumpError::NotModal(_))
        ));
    }

    #[test]
    fn document_modal_blocks_up_to_root() {
        let reg = registry();
        let f = filter(&reg, 2, Modality::Document);
        assert_eq!(f.accept_window(1), FilterAction::Reject);
        assert_eq!(f.accept_window(2), FilterAction::AcceptImmediately);
        assert_eq!(f.accept_window(3), FilterAction::AcceptImmediately);
        assert_eq!(f.accept_window(4), FilterAction::Accept);
        assert_eq!(f.accept_window(5), FilterAction::Accept);
    }

    #[test]
    fn application_modal_blocks_its_scope() {
        let reg = registry();
        let f = filter(&reg, 2, Modality::Application);
        assert_eq!(f.accept_window(1), FilterAction::Reject);
        assert_eq!(f.accept_window(4), FilterAction::Reject);
        assert_eq!(f.accept_window(3), FilterAction::AcceptImmediately);
        assert_eq!(f.accept_window(5), FilterAction::Accept);
    }

    #[test]
    fn toolkit_modal_blocks_other_scopes_too() {
        let reg = registry();
        let f = filter(&reg, 2, Modality::Toolkit);
        assert_eq!(f.accept_window(4), FilterAction::Reject);
        assert_eq!(f.accept_window(5), FilterAction::Reject);
        assert_eq!(f.accept_window(3), FilterAction::AcceptImmediately);
    }

    #[test]
    fn exclusions_are_accepted() {
        let reg = registry();
        reg.set_exclusion(4, ModalExclusion::Application);
        reg.set_exclusion(5, ModalExclusion::Toolkit);
        let app = filter(&reg, 2, Modality::Application);
        assert_eq!(app.accept_window(4), FilterAction::Accept);
        let doc = filter(&reg, 3, Modality::Document);
        reg.set_exclusion(1, ModalExclusion::Application);
        assert_eq!(doc.accept_window(1), FilterAction::Accept);
        let tk = filter(&reg, 2, Modality::Toolkit);
        // Application exclusion is not enough against a toolkit-modal dialog.
        assert_eq!(tk.accept_window(4), FilterAction::Reject);
        assert_eq!(tk.accept_window(5), FilterAction::Accept);
    }

    #[test]
    fn classify_resolves_components_and_kinds() {
        let reg = registry();
        let f = filter(&reg, 2, Modality::Application);
        assert_eq!(f.classify(&Event::mouse(10)), FilterAction::Reject);
        assert_eq!(f.classify(&Event::action(40)), FilterAction::Reject);
        assert_eq!(f.classify(&Event::window_closing(1)), FilterAction::Reject);
        assert_eq!(
            f.classify(&Event::new(EventKind::Key, Some(10))),
            FilterAction::Accept
        );
        assert_eq!(
            f.classify(&Event::new(EventKind::Mouse, None)),
            FilterAction::Accept
        );
        reg.set_exempt(10, true);
        assert_eq!(f.classify(&Event::mouse(10)), FilterAction::Accept);
    }

    #[test]
    fn fails_open_when_disabled_or_hidden() {
        let reg = registry();
        let f = filter(&reg, 2, Modality::Application);
        assert!(f.is_active());
        reg.set_visible(2, false);
        assert_eq!(f.classify(&Event::mouse(10)), FilterAction::Accept);
        reg.set_visible(2, true);
        assert_eq!(f.classify(&Event::mouse(10)), FilterAction::Reject);
        f.disable();
        assert!(f.is_disabled());
        assert_eq!(f.classify(&Event::mouse(10)), FilterAction::Accept);
    }

    #[test]
    fn owned_dialog_is_more_specific() {
        let reg = registry();
        let outer = filter(&reg, 2, Modality::Application);
        let inner = filter(&reg, 3, Modality::Document);
        assert_eq!(inner.specificity(&outer), Ordering::Greater);
        assert_eq!(outer.specificity(&inner), Ordering::Less);
    }

    #[test]
    fn blocker_is_more_specific() {
        let reg = registry();
        let top = filter(&reg, 2, Modality::Toolkit);
        // 6 is an application-modal dialog owned by the unrelated frame 4, shown after 2.
        reg.add_window(
            6,
            WindowProps {
                owner: Some(4),
                modality: Some(Modality::Application),
                visible: true,
                ..WindowProps::default()
            },
        );
        let under = ModalFilter::new(6, reg.clone() as Arc<dyn WindowTree<u32>>).unwrap();
        assert_eq!(reg.current_blocker(6), Some(2));
        assert_eq!(reg.current_blocker(2), None);
        assert_eq!(top.specificity(&under), Ordering::Greater);
        assert_eq!(under.specificity(&top), Ordering::Less);
    }

    #[test]
    fn unrelated_dialogs_order_by_strength() {
        let reg = registry();
        reg.add_window(
            6,
            WindowProps {
                owner: Some(5),
                modality: Some(Modality::Document),
                scope: ScopeId(7),
                visible: true,
                ..WindowProps::default()
            },
        );
        let doc = ModalFilter::new(6, reg.clone() as Arc<dyn WindowTree<u32>>).unwrap();
        let app = filter(&reg, 2, Modality::Application);
        // Different scopes: neither dialog blocks the other.
        assert_eq!(reg.current_blocker(6), None);
        assert_eq!(app.specificity(&doc), Ordering::Greater);
        assert_eq!(doc.specificity(&app), Ordering::Less);
    }
}
