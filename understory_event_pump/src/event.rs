// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Events flowing through the pump.
//!
//! ## Overview
//!
//! An [`Event`] is an opaque value produced by an [`EventSource`](crate::source::EventSource)
//! and consumed or dispatched exactly once by the [`Dispatcher`](crate::dispatch::Dispatcher).
//! The pump only looks at three things on an event:
//!
//! - its [`EventKind`] (and the numeric [`Event::id`] derived from it), used by
//!   [`EventMask`] when a pump fetches only some kinds, and by modal filters
//!   to decide which events are subject to modality;
//! - its `source`, the node (component or window) the event is addressed to;
//! - its consumed flag, set when the filter chain rejects the event.
//!
//! Two kinds are owned by the pump itself. [`EventKind::Invocation`] events carry a
//! one-shot task that runs on the dispatch thread when the event is dispatched, and
//! [`EventKind::Wakeup`] events carry nothing: they exist so that a pump blocked in
//! a fetch wakes up and re-evaluates its condition.

use core::fmt;

use bitflags::bitflags;

use crate::error::DispatchError;

/// A one-shot task carried by an [`EventKind::Invocation`] event.
pub type Task = Box<dyn FnOnce() -> Result<(), DispatchError> + Send + 'static>;

/// Broad classification of an [`Event`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Pointer input (press, release, move, wheel).
    Mouse,
    /// Keyboard input.
    Key,
    /// Command / action performed (button activation, menu item, accelerator).
    Action,
    /// A request to close a window.
    WindowClosing,
    /// Any other window lifecycle notification (opened, activated, iconified).
    Window,
    /// Focus transfer.
    Focus,
    /// A task to run on the dispatch thread.
    Invocation,
    /// Carries nothing; wakes a blocked pump.
    Wakeup,
    /// Application-defined event, tagged with an application code.
    Custom(u32),
}

impl EventKind {
    /// First id reserved for [`EventKind::Custom`] events.
    pub const CUSTOM_FIRST: u32 = 2000;

    /// Stable numeric identifier for this kind.
    ///
    /// Custom codes are offset by [`EventKind::CUSTOM_FIRST`] and saturate.
    pub const fn id(self) -> u32 {
        match self {
            Self::Mouse => 500,
            Self::Key => 400,
            Self::Action => 1001,
            Self::WindowClosing => 201,
            Self::Window => 200,
            Self::Focus => 1004,
            Self::Invocation => 1200,
            Self::Wakeup => 1201,
            Self::Custom(code) => Self::CUSTOM_FIRST.saturating_add(code),
        }
    }

    /// The single mask bit matching this kind.
    pub const fn mask(self) -> EventMask {
        match self {
            Self::Mouse => EventMask::MOUSE,
            Self::Key => EventMask::KEY,
            Self::Action => EventMask::ACTION,
            Self::WindowClosing => EventMask::WINDOW_CLOSING,
            Self::Window => EventMask::WINDOW,
            Self::Focus => EventMask::FOCUS,
            Self::Invocation => EventMask::INVOCATION,
            Self::Wakeup => EventMask::WAKEUP,
            Self::Custom(_) => EventMask::CUSTOM,
        }
    }

    /// Whether modal filters apply to this kind.
    ///
    /// Only pointer input, actions and close requests can be blocked by a modal
    /// window; everything else always passes.
    pub const fn is_modal_relevant(self) -> bool {
        matches!(self, Self::Mouse | Self::Action | Self::WindowClosing)
    }
}

bitflags! {
    /// Selects which event kinds a pump fetches from its source.
    ///
    /// [`EventMask::all`] is "any event". Events that do not match the mask of the
    /// running pump stay queued in arrival order until a pump that accepts them runs.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EventMask: u16 {
        /// [`EventKind::Mouse`].
        const MOUSE = 1 << 0;
        /// [`EventKind::Key`].
        const KEY = 1 << 1;
        /// [`EventKind::Action`].
        const ACTION = 1 << 2;
        /// [`EventKind::WindowClosing`].
        const WINDOW_CLOSING = 1 << 3;
        /// [`EventKind::Window`].
        const WINDOW = 1 << 4;
        /// [`EventKind::Focus`].
        const FOCUS = 1 << 5;
        /// [`EventKind::Invocation`].
        const INVOCATION = 1 << 6;
        /// [`EventKind::Wakeup`].
        const WAKEUP = 1 << 7;
        /// [`EventKind::Custom`], any code.
        const CUSTOM = 1 << 8;
        /// Kinds that modal filters look at.
        const MODAL_RELEVANT = Self::MOUSE.bits() | Self::ACTION.bits() | Self::WINDOW_CLOSING.bits();
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::all()
    }
}

/// A single event.
///
/// `W` is the caller's node handle (component or window key). Events are not
/// `Clone`: each is fetched, classified and then either retired as consumed or
/// dispatched, exactly once.
pub struct Event<W> {
    kind: EventKind,
    source: Option<W>,
    consumed: bool,
    task: Option<Task>,
}

impl<W> Event<W> {
    /// Create an event of `kind` addressed to `source`.
    pub fn new(kind: EventKind, source: Option<W>) -> Self {
        Self {
            kind,
            source,
            consumed: false,
            task: None,
        }
    }

    /// Pointer input addressed to `source`.
    pub fn mouse(source: W) -> Self {
        Self::new(EventKind::Mouse, Some(source))
    }

    /// An action performed on `source`.
    pub fn action(source: W) -> Self {
        Self::new(EventKind::Action, Some(source))
    }

    /// A close request for `window`.
    pub fn window_closing(window: W) -> Self {
        Self::new(EventKind::WindowClosing, Some(window))
    }

    /// An application event with `code`, optionally addressed to `source`.
    pub fn custom(code: u32, source: Option<W>) -> Self {
        Self::new(EventKind::Custom(code), source)
    }

    /// An event that runs `task` on the dispatch thread when dispatched.
    pub fn invocation(task: impl FnOnce() -> Result<(), DispatchError> + Send + 'static) -> Self {
        Self {
            kind: EventKind::Invocation,
            source: None,
            consumed: false,
            task: Some(Box::new(task)),
        }
    }

    /// An empty event whose only purpose is to wake a blocked pump.
    pub fn wakeup() -> Self {
        Self::new(EventKind::Wakeup, None)
    }

    /// The numeric identifier of this event's kind.
    pub fn id(&self) -> u32 {
        self.kind.id()
    }

    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether this event matches `mask`.
    pub fn matches(&self, mask: EventMask) -> bool {
        mask.contains(self.kind.mask())
    }

    /// Whether a filter or handler consumed this event.
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Mark this event as consumed.
    pub fn consume(&mut self) {
        self.consumed = true;
    }

    /// Take the task carried by an invocation event.
    ///
    /// Returns `None` for other kinds, and after the task has been taken once.
    pub fn take_task(&mut self) -> Option<Task> {
        self.task.take()
    }
}

impl<W: Copy> Event<W> {
    /// The node this event is addressed to, if any.
    pub fn source(&self) -> Option<W> {
        self.source
    }
}

impl<W: fmt::Debug> fmt::Debug for Event<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("consumed", &self.consumed)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_per_kind() {
        assert_eq!(EventKind::Mouse.id(), 500);
        assert_eq!(EventKind::WindowClosing.id(), 201);
        assert_eq!(EventKind::Custom(7).id(), 2007);
        assert_eq!(EventKind::Custom(u32::MAX).id(), u32::MAX);
    }

    #[test]
    fn mask_matching() {
        let ev: Event<u32> = Event::mouse(1);
        assert!(ev.matches(EventMask::all()));
        assert!(ev.matches(EventMask::MOUSE | EventMask::KEY));
        assert!(!ev.matches(EventMask::KEY));
        assert!(ev.matches(EventMask::MODAL_RELEVANT));
        let custom: Event<u32> = Event::custom(3, None);
        assert!(custom.matches(EventMask::CUSTOM));
        assert!(!custom.matches(EventMask::MODAL_RELEVANT));
    }

    #[test]
    fn modal_relevance() {
        assert!(EventKind::Mouse.is_modal_relevant());
        assert!(EventKind::Action.is_modal_relevant());
        assert!(EventKind::WindowClosing.is_modal_relevant());
        assert!(!EventKind::Window.is_modal_relevant());
        assert!(!EventKind::Key.is_modal_relevant());
        assert!(!EventKind::Wakeup.is_modal_relevant());
    }

    #[test]
    fn invocation_task_is_taken_once() {
        let mut ev: Event<u32> = Event::invocation(|| Ok(()));
        assert_eq!(ev.kind(), EventKind::Invocation);
        assert!(ev.take_task().is_some());
        assert!(ev.take_task().is_none());
    }

    #[test]
    fn consume_sets_flag() {
        let mut ev: Event<u32> = Event::action(4);
        assert!(!ev.is_consumed());
        ev.consume();
        assert!(ev.is_consumed());
        assert_eq!(ev.source(), Some(4));
    }
}
