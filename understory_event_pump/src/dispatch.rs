// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The dispatch core: a reentrant, filtered event pump.
//!
//! ## Overview
//!
//! A [`Dispatcher`] pulls events from an [`EventSource`], runs each through its
//! [`FilterChain`], and dispatches the ones that pass, for as long as the pump's condition
//! holds. Pumps nest: a handler may start another pump (to run a modal dialog, say), which
//! services events on the same thread until its own condition turns false, and then returns
//! to the handler.
//!
//! Exactly one thread, the dispatch thread, runs pumps. An outermost pump binds the calling
//! thread and releases it when it returns; while bound, pumps from any other thread fail
//! with [`PumpError::NotDispatchThread`]. A thread started with [`Dispatcher::spawn`] stays
//! bound until it exits.
//!
//! ## One cycle
//!
//! 1. Fetch the next event matching the pump's [`EventMask`] (blocking).
//! 2. Ask the filter chain. A rejected event is consumed, handed back to the source with
//!    [`EventSource::retire`], and the cycle fetches again.
//! 3. Ask the veto hook, if any; a veto is treated like a rejection.
//! 4. Dispatch the event, surrounded by the source's intercept hooks.
//!
//! ## Ending a pump
//!
//! A pump runs until its condition is false, [`Dispatcher::stop`] is observed, the source
//! reports an interruption, or a handler raises [`DispatchError::Fatal`]. Stops and
//! interruptions are observed between cycles, never in the middle of one, and end every
//! pump on the thread: each enclosing pump sees the cleared flag at its next boundary, and
//! a pump nested after the stop returns without dispatching. Only an outermost pump clears
//! a pending stop when it starts.
//! A fatal failure is returned to the caller of each pump it unwinds through.
//!
//! Any other failure (an error returned by a handler, or a panic in a filter or handler)
//! is reported to the [`FailureHandler`] and the pump moves on to the next event.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use understory_event_pump::dispatch::Dispatcher;
//! use understory_event_pump::event::Event;
//! use understory_event_pump::source::EventQueue;
//! use understory_event_pump::window::WindowRegistry;
//!
//! let queue = Arc::new(EventQueue::<u32>::new());
//! let windows = Arc::new(WindowRegistry::<u32>::new());
//! let dispatcher = Dispatcher::new(queue.clone(), windows);
//!
//! let handled = Arc::new(AtomicUsize::new(0));
//! let counter = handled.clone();
//! queue.set_handler(move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! });
//!
//! for n in 0..3 {
//!     queue.post(Event::mouse(n));
//! }
//! dispatcher.pump(|| handled.load(Ordering::SeqCst) < 3).unwrap();
//! assert_eq!(queue.dispatched_count(), 3);
//! assert!(!dispatcher.is_pumping());
//! ```

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::chain::FilterChain;
use crate::error::{
    DispatchError, EventFailure, FailureCause, FailureHandler, FetchError, LogFailures, PumpError,
    panic_message,
};
use crate::event::{Event, EventKind, EventMask};
use crate::filter::{Filter, FilterAction, HierarchyFilter};
use crate::modal::ModalFilter;
use crate::source::EventSource;
use crate::window::{WindowKey, WindowTree};

/// Hook that may veto an event the filter chain accepted; return `true` to drop it.
pub type Veto<W> = Box<dyn Fn(&Event<W>) -> bool + Send + Sync>;

/// One active pump invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PumpFrame<W> {
    /// Nesting depth; the outermost pump is `1`.
    pub depth: usize,
    /// Kinds this pump fetches.
    pub mask: EventMask,
    /// Subtree the pump is scoped to, for [`Dispatcher::pump_for_hierarchy`].
    pub target: Option<W>,
    /// Dialog the pump serves, for [`Dispatcher::run_modal`].
    pub modal: Option<W>,
}

#[derive(Debug)]
struct Frames<W> {
    owner: Option<ThreadId>,
    // Bound by `Dispatcher::spawn` for the lifetime of the thread.
    pinned: bool,
    stack: Vec<PumpFrame<W>>,
}

impl<W> Frames<W> {
    fn release_if_idle(&mut self) {
        if self.stack.is_empty() && !self.pinned {
            self.owner = None;
        }
    }
}

/// Condition shared by every secondary loop of one dispatcher.
#[derive(Debug, Default)]
pub(crate) struct WakeSignal {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,
}

/// Reentrant, filtered event pump. See the [module docs](self).
pub struct Dispatcher<W> {
    source: Arc<dyn EventSource<W>>,
    windows: Arc<dyn WindowTree<W>>,
    chain: FilterChain<W>,
    do_dispatch: AtomicBool,
    frames: Mutex<Frames<W>>,
    modals: Mutex<HashMap<W, Arc<ModalFilter<W>>>>,
    failures: Arc<dyn FailureHandler>,
    veto: Option<Veto<W>>,
    wake: WakeSignal,
}

impl<W: WindowKey> fmt::Debug for Dispatcher<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("chain", &self.chain)
            .field("do_dispatch", &self.do_dispatch.load(Ordering::Relaxed))
            .field("frames", &*self.frames.lock())
            .field("has_veto", &self.veto.is_some())
            .finish_non_exhaustive()
    }
}

/// Configures a [`Dispatcher`].
pub struct DispatcherBuilder<W> {
    source: Arc<dyn EventSource<W>>,
    windows: Arc<dyn WindowTree<W>>,
    failures: Arc<dyn FailureHandler>,
    veto: Option<Veto<W>>,
}

impl<W> fmt::Debug for DispatcherBuilder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("has_veto", &self.veto.is_some())
            .finish_non_exhaustive()
    }
}

impl<W: WindowKey> DispatcherBuilder<W> {
    /// Where per-event failures go. Defaults to [`LogFailures`].
    pub fn failure_handler(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.failures = Arc::new(handler);
        self
    }

    /// A last check after the filter chain; return `true` to drop the event.
    pub fn veto(mut self, veto: impl Fn(&Event<W>) -> bool + Send + Sync + 'static) -> Self {
        self.veto = Some(Box::new(veto));
        self
    }

    /// Build the dispatcher.
    pub fn build(self) -> Dispatcher<W> {
        Dispatcher {
            source: self.source,
            windows: self.windows,
            chain: FilterChain::new(),
            do_dispatch: AtomicBool::new(true),
            frames: Mutex::new(Frames {
                owner: None,
                pinned: false,
                stack: Vec::new(),
            }),
            modals: Mutex::new(HashMap::new()),
            failures: self.failures,
            veto: self.veto,
            wake: WakeSignal::default(),
        }
    }
}

impl<W: WindowKey> Dispatcher<W> {
    /// Start configuring a dispatcher over `source`, consulting `windows` for modality.
    pub fn builder<S, T>(source: Arc<S>, windows: Arc<T>) -> DispatcherBuilder<W>
    where
        S: EventSource<W> + 'static,
        T: WindowTree<W> + 'static,
    {
        DispatcherBuilder {
            source,
            windows,
            failures: Arc::new(LogFailures),
            veto: None,
        }
    }

    /// A dispatcher with default configuration.
    pub fn new<S, T>(source: Arc<S>, windows: Arc<T>) -> Self
    where
        S: EventSource<W> + 'static,
        T: WindowTree<W> + 'static,
    {
        Self::builder(source, windows).build()
    }

    /// The event source.
    pub fn source(&self) -> &Arc<dyn EventSource<W>> {
        &self.source
    }

    /// The window tree.
    pub fn windows(&self) -> &Arc<dyn WindowTree<W>> {
        &self.windows
    }

    /// The filter chain.
    pub fn filters(&self) -> &FilterChain<W> {
        &self.chain
    }

    /// Post an event to the source. Callable from any thread.
    pub fn post(&self, event: Event<W>) {
        self.source.post(event);
    }

    /// Post a wakeup so a pump blocked in a fetch re-evaluates its condition.
    pub fn wake(&self) {
        self.source.post_urgent(Event::wakeup());
    }

    /// Add a filter to the chain. Callable from any thread.
    ///
    /// Returns `false` if the filter was already in the chain.
    pub fn add_filter(&self, filter: Filter<W>) -> bool {
        self.chain.add(filter)
    }

    /// Remove a filter from the chain. Callable from any thread; a no-op if absent.
    pub fn remove_filter(&self, filter: &Filter<W>) -> bool {
        self.chain.remove(filter)
    }

    /// Ask every running pump to return at its next cycle boundary.
    ///
    /// The event being classified or dispatched, if any, completes first. A new outermost
    /// pump started after this call runs normally; a pump nested inside a stopping one
    /// returns at once.
    pub fn stop(&self) {
        self.do_dispatch.store(false, Ordering::Release);
    }

    /// Whether pumps keep going (no stop or interruption since the last outermost pump
    /// started).
    pub fn is_dispatching(&self) -> bool {
        self.do_dispatch.load(Ordering::Acquire)
    }

    /// Number of active pump frames.
    pub fn depth(&self) -> usize {
        self.frames.lock().stack.len()
    }

    /// Whether any pump frame is active.
    pub fn is_pumping(&self) -> bool {
        self.depth() > 0
    }

    /// The innermost active pump frame.
    pub fn current_frame(&self) -> Option<PumpFrame<W>> {
        self.frames.lock().stack.last().copied()
    }

    /// Whether the calling thread is the bound dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        self.frames.lock().owner == Some(thread::current().id())
    }

    /// Pump every event until `condition` is false.
    pub fn pump(&self, condition: impl FnMut() -> bool) -> Result<(), PumpError> {
        self.pump_for_filter(EventMask::all(), condition, None)
    }

    /// Pump until `condition` is false, keeping modal-relevant input outside `target`'s
    /// subtree from being dispatched. With no target, nothing is filtered.
    pub fn pump_for_hierarchy(
        &self,
        condition: impl FnMut() -> bool,
        target: Option<W>,
    ) -> Result<(), PumpError> {
        let filter = Filter::Hierarchy(Arc::new(HierarchyFilter::new(
            target,
            Arc::clone(&self.windows),
        )));
        self.run_frame(EventMask::all(), condition, Some(filter), target, None)
    }

    /// Pump events matching `mask` until `condition` is false, with `filter` installed in
    /// the chain for the duration of the pump.
    pub fn pump_for_filter(
        &self,
        mask: EventMask,
        condition: impl FnMut() -> bool,
        filter: Option<Filter<W>>,
    ) -> Result<(), PumpError> {
        self.run_frame(mask, condition, filter, None, None)
    }

    /// Run a modal session for `dialog`: install its [`ModalFilter`] and pump until the
    /// dialog is hidden or the session is ended with [`Dispatcher::end_modal`].
    ///
    /// The dialog should already be visible; if it is not, this returns immediately.
    /// Fails with [`PumpError::NotModal`] for modeless windows and with
    /// [`PumpError::AlreadyModal`] if the dialog already has an active session.
    pub fn run_modal(&self, dialog: W) -> Result<(), PumpError> {
        let filter = Arc::new(ModalFilter::new(dialog, Arc::clone(&self.windows))?);
        {
            let mut modals = self.modals.lock();
            if modals.get(&dialog).is_some_and(|f| !f.is_disabled()) {
                return Err(PumpError::AlreadyModal(format!("{dialog:?}")));
            }
            modals.insert(dialog, Arc::clone(&filter));
        }
        let _session = ModalSession {
            modals: &self.modals,
            filter: Arc::clone(&filter),
        };
        debug!(?dialog, modality = ?filter.modality(), "modal session started");
        let active = Arc::clone(&filter);
        let result = self.run_frame(
            EventMask::all(),
            move || active.is_active(),
            Some(Filter::Modal(filter)),
            None,
            Some(dialog),
        );
        debug!(?dialog, "modal session ended");
        result
    }

    /// End the modal session of `dialog`, if one is active. Callable from any thread.
    ///
    /// The filter stops blocking immediately; the session's pump returns at its next
    /// cycle boundary.
    pub fn end_modal(&self, dialog: W) -> bool {
        let filter = self.modals.lock().get(&dialog).cloned();
        match filter {
            Some(filter) => {
                filter.disable();
                self.wake();
                true
            }
            None => false,
        }
    }

    /// The filter of `dialog`'s active modal session.
    pub fn modal_filter(&self, dialog: W) -> Option<Arc<ModalFilter<W>>> {
        self.modals.lock().get(&dialog).cloned()
    }

    /// Start a named dispatch thread running an outermost pump.
    ///
    /// The new thread is bound as the dispatch thread before this returns and stays bound
    /// until it exits. Fails with [`PumpError::NotDispatchThread`] if some thread is
    /// already bound.
    pub fn spawn(
        self: &Arc<Self>,
        name: impl Into<String>,
    ) -> Result<DispatchThread<W>, PumpError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher = Arc::clone(self);
        let flag = Arc::clone(&shutdown);
        let mut frames = self.frames.lock();
        if frames.owner.is_some() {
            return Err(PumpError::NotDispatchThread);
        }
        // The new thread blocks on the frame lock until it is bound.
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let _pinned = Pinned {
                frames: &dispatcher.frames,
            };
            dispatcher.pump(|| !flag.load(Ordering::Acquire))
        })?;
        frames.owner = Some(handle.thread().id());
        frames.pinned = true;
        drop(frames);
        debug!(thread = ?handle.thread().name(), "dispatch thread started");
        Ok(DispatchThread {
            dispatcher: Arc::clone(self),
            shutdown,
            handle,
        })
    }

    pub(crate) fn wake_signal(&self) -> &WakeSignal {
        &self.wake
    }

    /// Bind the calling thread as the dispatch thread, unless another thread is bound.
    ///
    /// The binding holds until the claim is dropped, so no other thread can take over
    /// between the claim and the pumps the caller runs under it.
    pub(crate) fn claim_dispatch_thread(&self) -> Option<ThreadClaim<'_, W>> {
        let me = thread::current().id();
        let mut frames = self.frames.lock();
        match frames.owner {
            Some(owner) if owner != me => None,
            _ => {
                frames.owner = Some(me);
                Some(ThreadClaim {
                    frames: &self.frames,
                })
            }
        }
    }

    fn run_frame(
        &self,
        mask: EventMask,
        mut condition: impl FnMut() -> bool,
        filter: Option<Filter<W>>,
        target: Option<W>,
        modal: Option<W>,
    ) -> Result<(), PumpError> {
        let frame = self.push_frame(mask, target, modal)?;
        let _installed = filter.map(|filter| InstalledFilter::new(&self.chain, filter));
        if frame.depth == 1 {
            self.do_dispatch.store(true, Ordering::Release);
        }
        debug!(depth = frame.depth, ?mask, ?target, ?modal, "pump entered");

        while self.do_dispatch.load(Ordering::Acquire) && condition() {
            match self.pump_one(mask) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    debug!(depth = frame.depth, "pump unwinding after fatal failure");
                    return Err(err);
                }
            }
        }
        if !self.do_dispatch.load(Ordering::Acquire) {
            debug!(depth = frame.depth, "pump stopped");
        }
        debug!(depth = frame.depth, "pump exited");
        Ok(())
    }

    fn push_frame(
        &self,
        mask: EventMask,
        target: Option<W>,
        modal: Option<W>,
    ) -> Result<FrameGuard<'_, W>, PumpError> {
        let me = thread::current().id();
        let mut frames = self.frames.lock();
        match frames.owner {
            Some(owner) if owner != me => return Err(PumpError::NotDispatchThread),
            Some(_) => {}
            None => frames.owner = Some(me),
        }
        let depth = frames.stack.len() + 1;
        frames.stack.push(PumpFrame {
            depth,
            mask,
            target,
            modal,
        });
        Ok(FrameGuard {
            frames: &self.frames,
            depth,
        })
    }

    /// Run one cycle, isolating per-event failures. `Ok(false)` means interrupted.
    fn pump_one(&self, mask: EventMask) -> Result<bool, PumpError> {
        let current = Cell::new(None);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.cycle(mask, &current)));
        let cause = match outcome {
            Ok(Ok(proceed)) => return Ok(proceed),
            Ok(Err(DispatchError::Fatal(msg))) => {
                self.do_dispatch.store(false, Ordering::Release);
                error!(%msg, "fatal dispatch failure, stopping");
                return Err(PumpError::Fatal(msg));
            }
            Ok(Err(DispatchError::Handler(err))) => FailureCause::Error(err),
            Err(payload) => FailureCause::Panic(panic_message(payload.as_ref())),
        };
        let (event_id, kind) = match current.get() {
            Some((id, kind)) => (Some(id), Some(kind)),
            None => (None, None),
        };
        let failure = EventFailure {
            event_id,
            kind,
            cause,
        };
        let reported = panic::catch_unwind(AssertUnwindSafe(|| self.failures.handle(&failure)));
        if let Err(payload) = reported {
            error!(
                panic = %panic_message(payload.as_ref()),
                %failure,
                "failure handler panicked"
            );
        }
        Ok(true)
    }

    fn cycle(
        &self,
        mask: EventMask,
        current: &Cell<Option<(u32, EventKind)>>,
    ) -> Result<bool, DispatchError> {
        let mut event = loop {
            self.source.before_fetch();
            let mut event = match self.source.next_event(mask) {
                Ok(event) => event,
                Err(FetchError::Interrupted) => {
                    self.do_dispatch.store(false, Ordering::Release);
                    warn!("dispatch thread interrupted, stopping");
                    return Ok(false);
                }
            };
            current.set(Some((event.id(), event.kind())));
            if self.accepts(&event) {
                break event;
            }
            event.consume();
            trace!(kind = ?event.kind(), source = ?event.source(), "event rejected");
            self.source.retire(event);
        };
        trace!(kind = ?event.kind(), source = ?event.source(), "dispatching");
        self.source.before_dispatch(&event);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.source.dispatch(&mut event)));
        self.source.after_dispatch(&event);
        match result {
            Ok(result) => result.map(|()| true),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn accepts(&self, event: &Event<W>) -> bool {
        if self.chain.evaluate(event) == FilterAction::Reject {
            return false;
        }
        self.veto.as_ref().is_none_or(|veto| !veto(event))
    }
}

/// Pops its frame when the pump returns or unwinds.
struct FrameGuard<'a, W> {
    frames: &'a Mutex<Frames<W>>,
    depth: usize,
}

impl<W> Drop for FrameGuard<'_, W> {
    fn drop(&mut self) {
        let mut frames = self.frames.lock();
        frames.stack.truncate(self.depth - 1);
        frames.release_if_idle();
    }
}

/// Holds the dispatch-thread binding for a caller about to pump.
pub(crate) struct ThreadClaim<'a, W> {
    frames: &'a Mutex<Frames<W>>,
}

impl<W> Drop for ThreadClaim<'_, W> {
    fn drop(&mut self) {
        self.frames.lock().release_if_idle();
    }
}

/// Unbinds a spawned dispatch thread when it exits.
struct Pinned<'a, W> {
    frames: &'a Mutex<Frames<W>>,
}

impl<W> Drop for Pinned<'_, W> {
    fn drop(&mut self) {
        let mut frames = self.frames.lock();
        frames.pinned = false;
        frames.release_if_idle();
    }
}

/// Removes a pump's filter when the pump returns or unwinds, if the pump added it.
struct InstalledFilter<'a, W: WindowKey> {
    chain: &'a FilterChain<W>,
    filter: Filter<W>,
    added: bool,
}

impl<'a, W: WindowKey> InstalledFilter<'a, W> {
    fn new(chain: &'a FilterChain<W>, filter: Filter<W>) -> Self {
        let added = chain.add(filter.clone());
        Self {
            chain,
            filter,
            added,
        }
    }
}

impl<W: WindowKey> Drop for InstalledFilter<'_, W> {
    fn drop(&mut self) {
        if self.added {
            self.chain.remove(&self.filter);
        }
    }
}

/// Deregisters a modal session; leaves a newer session for the same dialog alone.
struct ModalSession<'a, W: WindowKey> {
    modals: &'a Mutex<HashMap<W, Arc<ModalFilter<W>>>>,
    filter: Arc<ModalFilter<W>>,
}

impl<W: WindowKey> Drop for ModalSession<'_, W> {
    fn drop(&mut self) {
        self.filter.disable();
        let mut modals = self.modals.lock();
        let dialog = self.filter.dialog();
        if modals
            .get(&dialog)
            .is_some_and(|f| Arc::ptr_eq(f, &self.filter))
        {
            modals.remove(&dialog);
        }
    }
}

/// Handle to a thread started with [`Dispatcher::spawn`].
pub struct DispatchThread<W> {
    dispatcher: Arc<Dispatcher<W>>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<(), PumpError>>,
}

impl<W: WindowKey> fmt::Debug for DispatchThread<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchThread")
            .field("thread", &self.handle.thread().name())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<W: WindowKey> DispatchThread<W> {
    /// The dispatcher this thread pumps.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<W>> {
        &self.dispatcher
    }

    /// Stop every pump on the thread and wait for it to finish.
    pub fn shutdown(self) -> Result<(), PumpError> {
        self.shutdown.store(true, Ordering::Release);
        self.dispatcher.stop();
        self.dispatcher.wake();
        self.join()
    }

    /// Wait for the thread to finish on its own (after a stop or an interruption).
    pub fn join(self) -> Result<(), PumpError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => Err(PumpError::Fatal(panic_message(payload.as_ref()))),
        }
    }
}
