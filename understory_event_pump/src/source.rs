// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event sources: where the pump fetches events from and dispatches them to.
//!
//! ## Overview
//!
//! [`EventSource`] is the pump's only view of the event queue. It is shared between the
//! dispatch thread (which fetches and dispatches) and any number of posting threads, so
//! implementations must be thread-safe.
//!
//! [`EventQueue`] is the bundled implementation: a blocking FIFO with an urgent lane for
//! pump-internal markers, mask-aware fetching, interruption, and a pluggable handler.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use understory_event_pump::event::{Event, EventMask};
//! use understory_event_pump::source::{EventQueue, EventSource};
//!
//! let queue: EventQueue<u32> = EventQueue::new();
//! let seen = Arc::new(AtomicU32::new(0));
//! let sink = seen.clone();
//! queue.set_handler(move |ev: &mut Event<u32>| {
//!     sink.fetch_add(ev.source().unwrap_or(0), Ordering::SeqCst);
//!     Ok(())
//! });
//!
//! queue.post(Event::mouse(5));
//! let mut ev = queue.next_event(EventMask::all()).unwrap();
//! queue.dispatch(&mut ev).unwrap();
//! assert_eq!(seen.load(Ordering::SeqCst), 5);
//! assert_eq!(queue.dispatched_count(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{DispatchError, FetchError};
use crate::event::{Event, EventKind, EventMask};

/// Thread-safe queue of events consumed by a [`Dispatcher`](crate::dispatch::Dispatcher).
///
/// Only the dispatch thread calls [`next_event`](Self::next_event),
/// [`dispatch`](Self::dispatch), [`retire`](Self::retire) and the intercept hooks.
/// Any thread may call [`post`](Self::post) and [`post_urgent`](Self::post_urgent).
pub trait EventSource<W>: Send + Sync {
    /// Block until an event matching `mask` is available and remove it.
    ///
    /// Events that do not match `mask` stay queued in arrival order.
    fn next_event(&self, mask: EventMask) -> Result<Event<W>, FetchError>;

    /// Deliver one event to its handlers.
    fn dispatch(&self, event: &mut Event<W>) -> Result<(), DispatchError>;

    /// Append an event.
    fn post(&self, event: Event<W>);

    /// Queue a pump-internal marker ahead of ordinary events.
    fn post_urgent(&self, event: Event<W>) {
        self.post(event);
    }

    /// Take back an event the filter chain rejected; it has already been consumed.
    fn retire(&self, _event: Event<W>) {}

    /// Called before each fetch.
    fn before_fetch(&self) {}

    /// Called before each dispatch.
    fn before_dispatch(&self, _event: &Event<W>) {}

    /// Called after each dispatch, whether or not it failed.
    fn after_dispatch(&self, _event: &Event<W>) {}

    /// Drop any in-flight cross-window synchronization the source is holding for the
    /// current dispatch, so a nested loop started from it cannot deadlock on it.
    fn discard_in_flight_sequence(&self) {}
}

/// Handler invoked by [`EventQueue`] for ordinary events.
pub type Handler<W> = Arc<dyn Fn(&mut Event<W>) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Debug)]
struct Lanes<W> {
    urgent: VecDeque<Event<W>>,
    normal: VecDeque<Event<W>>,
    interrupted: bool,
}

impl<W> Lanes<W> {
    fn take(&mut self, mask: EventMask) -> Option<Event<W>> {
        if let Some(i) = self.urgent.iter().position(|e| e.matches(mask)) {
            return self.urgent.remove(i);
        }
        let i = self.normal.iter().position(|e| e.matches(mask))?;
        self.normal.remove(i)
    }
}

/// Blocking FIFO [`EventSource`].
///
/// ## Semantics
///
/// - Ordinary events are fetched in arrival order among those matching the fetch mask.
/// - Urgent events (see [`EventSource::post_urgent`]) are fetched before ordinary ones,
///   in arrival order among themselves.
/// - [`EventQueue::interrupt`] makes the current or next fetch return
///   [`FetchError::Interrupted`] once, even if events are pending.
/// - [`EventKind::Invocation`] events run their task when dispatched;
///   [`EventKind::Wakeup`] events do nothing; every other event goes to the handler set
///   with [`EventQueue::set_handler`] (and is dropped if none is set).
/// - The handler is called without any queue lock held, so it may post events or run a
///   nested pump on the same queue.
pub struct EventQueue<W> {
    lanes: Mutex<Lanes<W>>,
    ready: Condvar,
    handler: RwLock<Option<Handler<W>>>,
    dispatched: AtomicU64,
    consumed: AtomicU64,
}

impl<W> core::fmt::Debug for EventQueue<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let lanes = self.lanes.lock();
        f.debug_struct("EventQueue")
            .field("urgent", &lanes.urgent.len())
            .field("normal", &lanes.normal.len())
            .field("interrupted", &lanes.interrupted)
            .field("dispatched", &self.dispatched.load(Ordering::Relaxed))
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<W> Default for EventQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> EventQueue<W> {
    /// Create an empty queue with no handler.
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                interrupted: false,
            }),
            ready: Condvar::new(),
            handler: RwLock::new(None),
            dispatched: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// Install the handler for ordinary events, replacing any previous one.
    pub fn set_handler(
        &self,
        handler: impl Fn(&mut Event<W>) -> Result<(), DispatchError> + Send + Sync + 'static,
    ) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Interrupt the dispatch thread's current or next fetch.
    pub fn interrupt(&self) {
        self.lanes.lock().interrupted = true;
        self.ready.notify_all();
    }

    /// Number of queued events, both lanes.
    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.urgent.len() + lanes.normal.len()
    }

    /// Whether no event is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events handed to [`EventSource::dispatch`] so far.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Events rejected by the filter chain and retired so far.
    pub fn consumed_count(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Append an event to the normal lane. Callable from any thread.
    pub fn post(&self, event: Event<W>) {
        self.push(event, false);
    }

    /// Append an event to the urgent lane, ahead of every normal event.
    pub fn post_urgent(&self, event: Event<W>) {
        self.push(event, true);
    }

    fn push(&self, event: Event<W>, urgent: bool) {
        let mut lanes = self.lanes.lock();
        if urgent {
            lanes.urgent.push_back(event);
        } else {
            lanes.normal.push_back(event);
        }
        drop(lanes);
        self.ready.notify_all();
    }
}

impl<W: Send + Sync> EventSource<W> for EventQueue<W> {
    fn next_event(&self, mask: EventMask) -> Result<Event<W>, FetchError> {
        let mut lanes = self.lanes.lock();
        loop {
            if lanes.interrupted {
                lanes.interrupted = false;
                return Err(FetchError::Interrupted);
            }
            if let Some(event) = lanes.take(mask) {
                return Ok(event);
            }
            self.ready.wait(&mut lanes);
        }
    }

    fn dispatch(&self, event: &mut Event<W>) -> Result<(), DispatchError> {
        self.dispatched.fetch_add(1, Ordering::AcqRel);
        match event.kind() {
            EventKind::Invocation => match event.take_task() {
                Some(task) => task(),
                None => Ok(()),
            },
            EventKind::Wakeup => Ok(()),
            _ => {
                let handler = self.handler.read().clone();
                match handler {
                    Some(handler) => handler(event),
                    None => Ok(()),
                }
            }
        }
    }

    fn post(&self, event: Event<W>) {
        Self::post(self, event);
    }

    fn post_urgent(&self, event: Event<W>) {
        Self::post_urgent(self, event);
    }

    fn retire(&self, event: Event<W>) {
        debug_assert!(event.is_consumed(), "retired events are consumed");
        self.consumed.fetch_add(1, Ordering::AcqRel);
    }
}
