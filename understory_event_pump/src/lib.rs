// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=understory_event_pump --heading-base-level=0

//! Understory Event Pump: a single-threaded, reentrant event pump with modal filtering.
//!
//! ## Overview
//!
//! One logical thread, the dispatch thread, pulls events from an
//! [`EventSource`](crate::source::EventSource) and dispatches them. Along the way:
//!
//! - each event passes through a [`FilterChain`](crate::chain::FilterChain) that may reject
//!   it, short-circuit it through, or pass it on;
//! - pumps nest: a handler may start another pump on the same thread, for example to run a
//!   modal dialog, and the outer pump resumes when it returns;
//! - [`ModalFilter`](crate::modal::ModalFilter)s keep blocked windows from receiving input
//!   while a modal dialog is shown, scoped by the dialog's
//!   [`Modality`](crate::window::Modality);
//! - any thread can block on a [`SecondaryLoop`](crate::secondary::SecondaryLoop) while the
//!   dispatch thread keeps servicing events.
//!
//! ## Modules
//!
//! - [`event`]: events, kinds and masks.
//! - [`source`]: the event source seam and [`EventQueue`](crate::source::EventQueue), a
//!   ready-made source.
//! - [`window`]: the window hierarchy seam ([`WindowTree`](crate::window::WindowTree)) and
//!   [`WindowRegistry`](crate::window::WindowRegistry), a ready-made hierarchy.
//! - [`filter`], [`modal`], [`chain`]: filters and their ordering.
//! - [`dispatch`]: the [`Dispatcher`](crate::dispatch::Dispatcher) itself.
//! - [`secondary`]: secondary loops.
//! - [`error`]: the failure taxonomy and [`FailureHandler`](crate::error::FailureHandler).
//!
//! ## Failure isolation
//!
//! A handler that fails or panics is reported to the dispatcher's failure handler and the
//! pump moves on. Only [`stop`](crate::dispatch::Dispatcher::stop), an interruption from the
//! source, or a [fatal](crate::error::DispatchError::Fatal) failure ends a pump early.
//!
//! ## Example
//!
//! A modal dialog blocks its owner frame until it is hidden:
//!
//! ```
//! use std::sync::Arc;
//! use understory_event_pump::dispatch::Dispatcher;
//! use understory_event_pump::event::{Event, EventKind};
//! use understory_event_pump::source::EventQueue;
//! use understory_event_pump::window::{Modality, WindowProps, WindowRegistry};
//!
//! let windows = Arc::new(WindowRegistry::<u32>::new());
//! windows.add_window(1, WindowProps { visible: true, ..WindowProps::default() });
//! windows.add_window(
//!     2,
//!     WindowProps {
//!         owner: Some(1),
//!         modality: Some(Modality::Application),
//!         visible: true,
//!         ..WindowProps::default()
//!     },
//! );
//!
//! let queue = Arc::new(EventQueue::new());
//! let w = windows.clone();
//! queue.set_handler(move |ev: &mut Event<u32>| {
//!     // A click on the dialog's close button hides it.
//!     if ev.kind() == EventKind::Action && ev.source() == Some(2) {
//!         w.set_visible(2, false);
//!     }
//!     Ok(())
//! });
//!
//! let dispatcher = Dispatcher::new(queue.clone(), windows);
//! queue.post(Event::mouse(1)); // blocked: the frame is behind the dialog
//! queue.post(Event::action(2)); // closes the dialog
//! dispatcher.run_modal(2).unwrap();
//!
//! assert_eq!(queue.consumed_count(), 1);
//! assert_eq!(queue.dispatched_count(), 1);
//! ```
//!
//! Logging goes through [`tracing`]: pump entry and exit at `debug`, per-event decisions at
//! `trace`, and failures at `warn` and `error`.

pub mod chain;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod modal;
pub mod secondary;
pub mod source;
pub mod window;
