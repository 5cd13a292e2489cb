// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Window ownership: the view of the UI hierarchy that modality needs.
//!
//! ## Overview
//!
//! The pump never owns widgets or windows. It consults a [`WindowTree`] to answer the
//! handful of structural questions that modality and hierarchy filtering depend on:
//!
//! - containment: which node contains an event's source, up to its top-level window;
//! - ownership: which window owns a window (dialogs are owned by frames or other dialogs);
//! - state: visibility, [`Modality`], [`ModalExclusion`], application scope;
//! - blocking: which visible modal dialog currently blocks a window.
//!
//! Ownership chains must be acyclic. [`WindowTree::document_root`] and friends walk them.
//!
//! [`WindowRegistry`] is a thread-safe, in-memory implementation suitable for toolkits that
//! do not already keep such a structure, and for tests.

use core::fmt::Debug;
use core::hash::Hash;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::filter::FilterAction;
use crate::modal;

/// Node handle accepted by the pump: small, copyable and shareable across threads.
pub trait WindowKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> WindowKey for T {}

/// Strength of a modal window.
///
/// Ordered from weakest to strongest; a stronger modal filter is more specific than a
/// weaker one when neither dialog owns or blocks the other.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modality {
    /// Blocks the windows of its document: everything up to its document root.
    Document,
    /// Blocks every window of its application scope.
    Application,
    /// Blocks every window of the toolkit, and events for other scopes.
    Toolkit,
}

/// How far a window is exempt from modal blocking.
///
/// Ordered: a toolkit-excluded window is also application-excluded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModalExclusion {
    /// Subject to every modal dialog.
    #[default]
    None,
    /// Not blocked by document- or application-modal dialogs.
    Application,
    /// Not blocked by any modal dialog.
    Toolkit,
}

/// Logical application scope a window belongs to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Read-only view of the window hierarchy.
///
/// Called from the dispatch thread while classifying events and from any thread that
/// builds or orders modal filters.
pub trait WindowTree<W>: Send + Sync {
    /// Containment parent of `node`; `None` for top-level windows.
    fn parent(&self, node: W) -> Option<W>;

    /// Whether `node` is a window (as opposed to a component inside one).
    fn is_window(&self, node: W) -> bool;

    /// Owner of `window`, if it is an owned window.
    fn owner(&self, window: W) -> Option<W>;

    /// Whether `window` is currently shown.
    fn is_visible(&self, window: W) -> bool;

    /// Modality of `window`, or `None` for modeless windows.
    fn modality(&self, window: W) -> Option<Modality>;

    /// Exclusion level of `window`.
    fn modal_exclusion(&self, window: W) -> ModalExclusion;

    /// Application scope of `window`.
    fn app_scope(&self, window: W) -> ScopeId;

    /// The visible modal dialog currently blocking `window`, if any.
    fn current_blocker(&self, window: W) -> Option<W>;

    /// Whether `node` opts out of modality entirely (popups, tooltips).
    fn is_modal_exempt(&self, _node: W) -> bool {
        false
    }

    /// Whether `window` is excluded from modality at `level` or above.
    fn is_modal_excluded(&self, window: W, level: ModalExclusion) -> bool {
        level != ModalExclusion::None && self.modal_exclusion(window) >= level
    }

    /// The nearest owner of `window` that is not itself owned; `window` if unowned.
    fn document_root(&self, window: W) -> W
    where
        W: Copy,
    {
        let mut root = window;
        while let Some(owner) = self.owner(root) {
            root = owner;
        }
        root
    }

    /// The top-level window containing `node`; `node` itself if it is a window.
    fn window_of(&self, node: W) -> Option<W>
    where
        W: Copy,
    {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.is_window(n) {
                return Some(n);
            }
            cur = self.parent(n);
        }
        None
    }
}

/// Whether `ancestor` is `window` or one of its (transitive) owners.
pub(crate) fn is_owned_by<W: Copy + PartialEq, T: WindowTree<W> + ?Sized>(
    tree: &T,
    window: W,
    ancestor: W,
) -> bool {
    let mut cur = Some(window);
    while let Some(w) = cur {
        if w == ancestor {
            return true;
        }
        cur = tree.owner(w);
    }
    false
}

/// Properties of a window registered with [`WindowRegistry::add_window`].
#[derive(Clone, Debug)]
pub struct WindowProps<W> {
    /// Owning window.
    pub owner: Option<W>,
    /// Modality; `None` for modeless windows.
    pub modality: Option<Modality>,
    /// Exclusion level.
    pub exclusion: ModalExclusion,
    /// Application scope.
    pub scope: ScopeId,
    /// Initial visibility.
    pub visible: bool,
}

impl<W> Default for WindowProps<W> {
    fn default() -> Self {
        Self {
            owner: None,
            modality: None,
            exclusion: ModalExclusion::None,
            scope: ScopeId::default(),
            visible: false,
        }
    }
}

#[derive(Clone, Debug)]
struct NodeInfo<W> {
    parent: Option<W>,
    window: Option<WindowProps<W>>,
    exempt: bool,
}

#[derive(Debug)]
struct RegistryState<W> {
    nodes: HashMap<W, NodeInfo<W>>,
    // Visible modal dialogs, oldest first.
    shown: Vec<W>,
}

/// Thread-safe, in-memory [`WindowTree`].
///
/// ## Usage
///
/// - Register windows with [`WindowRegistry::add_window`] and components with
///   [`WindowRegistry::add_component`].
/// - Toggle visibility with [`WindowRegistry::set_visible`]; the registry remembers the
///   order in which modal dialogs were shown and uses it for
///   [`WindowTree::current_blocker`]: the most recently shown blocker wins, and a modal
///   dialog is only ever blocked by dialogs shown before it.
///
/// Unknown nodes answer as invisible, unowned, modeless, non-window nodes.
///
/// ```
/// use understory_event_pump::window::{Modality, WindowProps, WindowRegistry, WindowTree};
///
/// let reg = WindowRegistry::new();
/// reg.add_window(1_u32, WindowProps { visible: true, ..WindowProps::default() });
/// reg.add_window(2, WindowProps {
///     owner: Some(1),
///     modality: Some(Modality::Application),
///     ..WindowProps::default()
/// });
/// reg.add_component(10, 1);
/// reg.set_visible(2, true);
///
/// assert_eq!(reg.window_of(10), Some(1));
/// assert_eq!(reg.document_root(2), 1);
/// assert_eq!(reg.current_blocker(1), Some(2));
/// assert_eq!(reg.current_blocker(2), None);
/// ```
#[derive(Debug)]
pub struct WindowRegistry<W> {
    state: RwLock<RegistryState<W>>,
}

impl<W: WindowKey> Default for WindowRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: WindowKey> WindowRegistry<W> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                nodes: HashMap::new(),
                shown: Vec::new(),
            }),
        }
    }

    /// Register (or replace) a window.
    pub fn add_window(&self, window: W, props: WindowProps<W>) {
        let mut state = self.state.write();
        let visible_modal = props.visible && props.modality.is_some();
        state.shown.retain(|w| *w != window);
        if visible_modal {
            state.shown.push(window);
        }
        state.nodes.insert(
            window,
            NodeInfo {
                parent: None,
                window: Some(props),
                exempt: false,
            },
        );
    }

    /// Register (or replace) a component contained in `parent`.
    pub fn add_component(&self, node: W, parent: W) {
        let mut state = self.state.write();
        state.shown.retain(|w| *w != node);
        state.nodes.insert(
            node,
            NodeInfo {
                parent: Some(parent),
                window: None,
                exempt: false,
            },
        );
    }

    /// Remove a node. Children keep pointing at it and resolve as orphans.
    pub fn remove(&self, node: W) {
        let mut state = self.state.write();
        state.nodes.remove(&node);
        state.shown.retain(|w| *w != node);
    }

    /// Show or hide a window. Returns `false` if `window` is not a registered window.
    pub fn set_visible(&self, window: W, visible: bool) -> bool {
        let mut state = self.state.write();
        let Some(props) = state.nodes.get_mut(&window).and_then(|n| n.window.as_mut()) else {
            return false;
        };
        props.visible = visible;
        let modal = props.modality.is_some();
        state.shown.retain(|w| *w != window);
        if visible && modal {
            state.shown.push(window);
        }
        true
    }

    /// Change the modality of a window. Takes effect for filters created afterwards.
    pub fn set_modality(&self, window: W, modality: Option<Modality>) -> bool {
        let mut state = self.state.write();
        let Some(props) = state.nodes.get_mut(&window).and_then(|n| n.window.as_mut()) else {
            return false;
        };
        props.modality = modality;
        let visible_modal = props.visible && modality.is_some();
        state.shown.retain(|w| *w != window);
        if visible_modal {
            state.shown.push(window);
        }
        true
    }

    /// Change the exclusion level of a window.
    pub fn set_exclusion(&self, window: W, exclusion: ModalExclusion) -> bool {
        let mut state = self.state.write();
        match state.nodes.get_mut(&window).and_then(|n| n.window.as_mut()) {
            Some(props) => {
                props.exclusion = exclusion;
                true
            }
            None => false,
        }
    }

    /// Mark a node as exempt from modality (popups, tooltips).
    pub fn set_exempt(&self, node: W, exempt: bool) -> bool {
        let mut state = self.state.write();
        match state.nodes.get_mut(&node) {
            Some(info) => {
                info.exempt = exempt;
                true
            }
            None => false,
        }
    }

    /// Visible modal dialogs in the order they were shown, oldest first.
    pub fn shown_modals(&self) -> Vec<W> {
        self.state.read().shown.clone()
    }

    fn window_props<R>(&self, window: W, f: impl FnOnce(&WindowProps<W>) -> R) -> Option<R> {
        let state = self.state.read();
        state
            .nodes
            .get(&window)
            .and_then(|n| n.window.as_ref())
            .map(f)
    }
}

impl<W: WindowKey> WindowTree<W> for WindowRegistry<W> {
    fn parent(&self, node: W) -> Option<W> {
        self.state.read().nodes.get(&node).and_then(|n| n.parent)
    }

    fn is_window(&self, node: W) -> bool {
        self.state
            .read()
            .nodes
            .get(&node)
            .is_some_and(|n| n.window.is_some())
    }

    fn owner(&self, window: W) -> Option<W> {
        self.window_props(window, |p| p.owner).flatten()
    }

    fn is_visible(&self, window: W) -> bool {
        self.window_props(window, |p| p.visible).unwrap_or(false)
    }

    fn modality(&self, window: W) -> Option<Modality> {
        self.window_props(window, |p| p.modality).flatten()
    }

    fn modal_exclusion(&self, window: W) -> ModalExclusion {
        self.window_props(window, |p| p.exclusion).unwrap_or_default()
    }

    fn app_scope(&self, window: W) -> ScopeId {
        self.window_props(window, |p| p.scope).unwrap_or_default()
    }

    fn current_blocker(&self, window: W) -> Option<W> {
        // Snapshot first: the decision below calls back into the registry.
        let candidates: Vec<(W, Modality)> = {
            let state = self.state.read();
            // A shown modal dialog can only be blocked by dialogs shown before it.
            let end = state
                .shown
                .iter()
                .position(|d| *d == window)
                .unwrap_or(state.shown.len());
            state.shown[..end]
                .iter()
                .rev()
                .filter_map(|d| {
                    let props = state.nodes.get(d)?.window.as_ref()?;
                    Some((*d, props.modality?))
                })
                .collect()
        };
        candidates.into_iter().find_map(|(dialog, modality)| {
            let verdict = modal::decide(self, dialog, modality, window);
            (verdict == FilterAction::Reject).then_some(dialog)
        })
    }

    fn is_modal_exempt(&self, node: W) -> bool {
        self.state.read().nodes.get(&node).is_some_and(|n| n.exempt)
    }
}
