// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Secondary loops: block the calling thread while the dispatcher keeps servicing events.
//!
//! ## Overview
//!
//! A [`SecondaryLoop`] is a reusable handle. [`enter`](SecondaryLoop::enter) blocks until the
//! loop is [exited](SecondaryLoop::exit), its optional condition turns false, or its optional
//! timeout elapses; meanwhile events keep being dispatched.
//!
//! - On the dispatch thread, or on any thread while no thread is bound as the dispatch
//!   thread, `enter` binds the caller and runs a nested pump directly. A timer thread
//!   enforces the timeout.
//! - On any other thread, `enter` installs the loop's filter, posts an urgent marker that
//!   starts the nested pump once it reaches the dispatch thread, and waits on the
//!   dispatcher's wake condition.
//!
//! Only one `enter` may be outstanding per handle; a concurrent second call returns
//! `Ok(false)` at once and leaves the running loop alone.
//!
//! Two flags track a running loop: one keeps the nested pump going, the other keeps a
//! foreign caller waiting. [`exit`](SecondaryLoop::exit) and the timeout both clear them with
//! an atomic swap, so whichever comes first performs the wake and the other is a no-op.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use understory_event_pump::dispatch::Dispatcher;
//! use understory_event_pump::secondary::SecondaryLoop;
//! use understory_event_pump::source::EventQueue;
//! use understory_event_pump::window::WindowRegistry;
//!
//! let queue = Arc::new(EventQueue::<u32>::new());
//! let dispatcher = Arc::new(Dispatcher::new(queue, Arc::new(WindowRegistry::new())));
//! let runner = dispatcher.spawn("dispatch").unwrap();
//!
//! let secondary = SecondaryLoop::builder(dispatcher.clone())
//!     .timeout(Duration::from_millis(20))
//!     .build();
//! // Nobody calls `exit`; the timeout ends the loop.
//! assert!(secondary.enter().unwrap());
//! assert!(!secondary.exit());
//! runner.shutdown().unwrap();
//! ```

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::dispatch::{Dispatcher, WakeSignal};
use crate::error::{DispatchError, PumpError};
use crate::event::{Event, EventMask};
use crate::filter::Filter;
use crate::window::WindowKey;

/// External condition of a secondary loop; the loop keeps blocking while it holds.
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct LoopState {
    entered: AtomicBool,
    blocking_dispatch: AtomicBool,
    blocking_caller: AtomicBool,
    generation: AtomicU64,
}

impl LoopState {
    fn keep_blocking(&self, condition: Option<&(dyn Fn() -> bool + Send + Sync)>) -> bool {
        self.blocking_dispatch.load(Ordering::Acquire) && condition.is_none_or(|holds| holds())
    }
}

/// Handle for entering and exiting a nested dispatch loop. See the [module docs](self).
pub struct SecondaryLoop<W> {
    dispatcher: Arc<Dispatcher<W>>,
    condition: Option<Condition>,
    filter: Option<Filter<W>>,
    timeout: Option<Duration>,
    state: Arc<LoopState>,
}

impl<W: WindowKey> fmt::Debug for SecondaryLoop<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryLoop")
            .field("filter", &self.filter)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Configures a [`SecondaryLoop`].
pub struct SecondaryLoopBuilder<W> {
    dispatcher: Arc<Dispatcher<W>>,
    condition: Option<Condition>,
    filter: Option<Filter<W>>,
    timeout: Option<Duration>,
}

impl<W: WindowKey> fmt::Debug for SecondaryLoopBuilder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryLoopBuilder")
            .field("filter", &self.filter)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<W: WindowKey> SecondaryLoopBuilder<W> {
    /// Keep blocking only while `condition` holds. Evaluated on the dispatch thread before
    /// each cycle, and by a waiting foreign caller whenever it wakes.
    pub fn condition(mut self, condition: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Install `filter` while the loop runs.
    pub fn filter(mut self, filter: Filter<W>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Exit on its own after `timeout`. A zero duration means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Build the handle.
    pub fn build(self) -> SecondaryLoop<W> {
        SecondaryLoop {
            dispatcher: self.dispatcher,
            condition: self.condition,
            filter: self.filter,
            timeout: self.timeout,
            state: Arc::new(LoopState::default()),
        }
    }
}

impl<W: WindowKey> SecondaryLoop<W> {
    /// Start configuring a loop on `dispatcher`.
    pub fn builder(dispatcher: Arc<Dispatcher<W>>) -> SecondaryLoopBuilder<W> {
        SecondaryLoopBuilder {
            dispatcher,
            condition: None,
            filter: None,
            timeout: None,
        }
    }

    /// A loop with no condition, filter or timeout; it runs until [`exit`](Self::exit).
    pub fn new(dispatcher: Arc<Dispatcher<W>>) -> Self {
        Self::builder(dispatcher).build()
    }

    /// Block until the loop ends, dispatching events meanwhile.
    ///
    /// Returns `Ok(true)` once the loop has ended, `Ok(false)` without blocking if another
    /// `enter` on this handle is outstanding. Errors come from the nested pump when it runs
    /// on the calling thread, or from failing to start the timeout timer.
    pub fn enter(&self) -> Result<bool, PumpError> {
        if self
            .state
            .entered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("secondary loop already entered");
            return Ok(false);
        }
        let signal = self.dispatcher.wake_signal();
        let generation = {
            let _guard = signal.lock.lock();
            self.state.blocking_dispatch.store(true, Ordering::Release);
            self.state.blocking_caller.store(true, Ordering::Release);
            self.state.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        let _entered = Entered {
            state: &self.state,
            signal,
        };
        match self.dispatcher.claim_dispatch_thread() {
            Some(_claim) => {
                debug!(generation, timeout = ?self.timeout, "entering secondary loop on dispatch thread");
                self.enter_on_dispatch_thread(generation)?;
            }
            None => {
                debug!(generation, timeout = ?self.timeout, "entering secondary loop from foreign thread");
                self.enter_from_foreign_thread(generation);
            }
        }
        debug!(generation, "secondary loop left");
        Ok(true)
    }

    /// End the running loop. Callable from any thread.
    ///
    /// Returns `false`, and does nothing, if no loop is running.
    pub fn exit(&self) -> bool {
        let signal = self.dispatcher.wake_signal();
        let (dispatch, caller) = {
            let _guard = signal.lock.lock();
            let dispatch = self.state.blocking_dispatch.swap(false, Ordering::AcqRel);
            let caller = self.state.blocking_caller.swap(false, Ordering::AcqRel);
            if dispatch || caller {
                signal.cond.notify_all();
            }
            (dispatch, caller)
        };
        if dispatch {
            self.dispatcher.wake();
        }
        trace!(dispatch, caller, "secondary loop exit requested");
        dispatch || caller
    }

    /// Whether an `enter` on this handle is outstanding.
    pub fn is_entered(&self) -> bool {
        self.state.entered.load(Ordering::Acquire)
    }

    fn enter_on_dispatch_thread(&self, generation: u64) -> Result<(), PumpError> {
        let timer = match self.timeout {
            Some(timeout) => Some(Timer::start(
                timeout,
                self.forced_exit(generation),
            )?),
            None => None,
        };
        self.dispatcher.source().discard_in_flight_sequence();
        let state = Arc::clone(&self.state);
        let condition = self.condition.clone();
        let result = self.dispatcher.pump_for_filter(
            EventMask::all(),
            move || state.keep_blocking(condition.as_deref()),
            self.filter.clone(),
        );
        if let Some(timer) = timer {
            timer.cancel();
        }
        result
    }

    fn enter_from_foreign_thread(&self, generation: u64) {
        let installed = self
            .filter
            .clone()
            .filter(|filter| self.dispatcher.add_filter(filter.clone()));

        let state = Arc::clone(&self.state);
        let condition = self.condition.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        self.dispatcher
            .source()
            .post_urgent(Event::invocation(move || {
                let keep = {
                    let state = Arc::clone(&state);
                    move || {
                        state.generation.load(Ordering::Acquire) == generation
                            && state.keep_blocking(condition.as_deref())
                    }
                };
                dispatcher.source().discard_in_flight_sequence();
                let result = dispatcher.pump_for_filter(EventMask::all(), keep, None);
                let signal = dispatcher.wake_signal();
                {
                    let _guard = signal.lock.lock();
                    if state.generation.load(Ordering::Acquire) == generation {
                        state.blocking_caller.store(false, Ordering::Release);
                    }
                    signal.cond.notify_all();
                }
                result.map_err(DispatchError::from)
            }));

        let signal = self.dispatcher.wake_signal();
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if !self.condition.as_deref().is_none_or(|holds| holds()) {
                break;
            }
            let mut guard = signal.lock.lock();
            if !self.state.blocking_caller.load(Ordering::Acquire) {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if signal.cond.wait_until(&mut guard, deadline).timed_out() {
                        debug!(generation, "secondary loop timed out");
                        break;
                    }
                }
                None => signal.cond.wait(&mut guard),
            }
        }

        if let Some(filter) = installed {
            self.dispatcher.remove_filter(&filter);
        }
        if self.state.blocking_dispatch.swap(false, Ordering::AcqRel) {
            self.dispatcher.wake();
        }
    }

    /// Timer callback: end the nested pump of `generation` unless something else did first.
    fn forced_exit(&self, generation: u64) -> impl FnOnce() + Send + 'static + use<W> {
        let state = Arc::clone(&self.state);
        let dispatcher = Arc::clone(&self.dispatcher);
        move || {
            let fired = {
                let _guard = dispatcher.wake_signal().lock.lock();
                state.generation.load(Ordering::Acquire) == generation
                    && state
                        .blocking_dispatch
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            };
            if fired {
                debug!(generation, "secondary loop timed out");
                dispatcher.wake();
            }
        }
    }
}

/// Clears the loop's flags when `enter` returns or unwinds.
struct Entered<'a> {
    state: &'a LoopState,
    signal: &'a WakeSignal,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        let _guard = self.signal.lock.lock();
        self.state.blocking_dispatch.store(false, Ordering::Release);
        self.state.blocking_caller.store(false, Ordering::Release);
        self.state.entered.store(false, Ordering::Release);
    }
}

/// One-shot timer thread; runs its callback unless cancelled first.
struct Timer {
    cancelled: Arc<(Mutex<bool>, Condvar)>,
}

impl Timer {
    fn start(timeout: Duration, fire: impl FnOnce() + Send + 'static) -> Result<Self, PumpError> {
        let cancelled = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("secondary-loop-timer".into())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let (lock, cond) = &*shared;
                let mut cancelled = lock.lock();
                while !*cancelled {
                    if cond.wait_until(&mut cancelled, deadline).timed_out() {
                        break;
                    }
                }
                let run = !*cancelled;
                drop(cancelled);
                if run {
                    fire();
                }
            })?;
        Ok(Self { cancelled })
    }

    fn cancel(self) {
        let (lock, cond) = &*self.cancelled;
        *lock.lock() = true;
        cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use crate::dispatch::DispatchThread;
    use crate::error::FetchError;
    use crate::event::EventKind;
    use crate::filter::FilterAction;
    use crate::source::{EventQueue, EventSource};
    use crate::window::WindowRegistry;

    fn setup() -> (Arc<EventQueue<u32>>, Arc<Dispatcher<u32>>) {
        let queue = Arc::new(EventQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            Arc::new(WindowRegistry::new()),
        ));
        (queue, dispatcher)
    }

    fn running(dispatcher: &Arc<Dispatcher<u32>>) -> DispatchThread<u32> {
        let runner = dispatcher.spawn("dispatch").unwrap();
        while !dispatcher.is_pumping() {
            thread::sleep(Duration::from_millis(1));
        }
        runner
    }

    /// Wait until a foreign `enter` has its nested pump running on the dispatch thread.
    fn wait_for_nested(dispatcher: &Dispatcher<u32>) {
        while dispatcher.depth() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn exit_without_enter_is_a_noop() {
        let (queue, dispatcher) = setup();
        let secondary = SecondaryLoop::new(dispatcher);
        assert!(!secondary.exit());
        assert!(!secondary.is_entered());
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_timeout_means_none() {
        let (_, dispatcher) = setup();
        let secondary = SecondaryLoop::builder(dispatcher)
            .timeout(Duration::ZERO)
            .build();
        assert_eq!(secondary.timeout, None);
    }

    #[test]
    fn timeout_on_worker_thread_returns_promptly() {
        let (_, dispatcher) = setup();
        let runner = running(&dispatcher);
        let secondary = SecondaryLoop::builder(dispatcher.clone())
            .timeout(Duration::from_millis(50))
            .build();
        let start = Instant::now();
        assert!(secondary.enter().unwrap());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));
        assert!(!secondary.exit());
        runner.shutdown().unwrap();
    }

    #[test]
    fn worker_is_released_by_exit_while_events_keep_flowing() {
        let (queue, dispatcher) = setup();
        let runner = running(&dispatcher);
        let secondary = Arc::new(SecondaryLoop::new(dispatcher.clone()));
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let secondary = secondary.clone();
            thread::spawn(move || {
                let entered = secondary.enter().unwrap();
                tx.send(entered).unwrap();
            })
        };
        wait_for_nested(&dispatcher);
        assert!(secondary.is_entered());
        // The nested pump services ordinary work while the worker waits.
        let (done_tx, done_rx) = mpsc::channel();
        queue.post(Event::invocation(move || {
            done_tx.send(()).unwrap();
            Ok(())
        }));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.try_recv().is_err());

        assert!(secondary.exit());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
        assert!(!secondary.is_entered());
        runner.shutdown().unwrap();
    }

    #[test]
    fn concurrent_enter_returns_false_without_disturbing_the_loop() {
        let (_, dispatcher) = setup();
        let runner = running(&dispatcher);
        let secondary = Arc::new(SecondaryLoop::new(dispatcher.clone()));
        let first = {
            let secondary = secondary.clone();
            thread::spawn(move || secondary.enter().unwrap())
        };
        wait_for_nested(&dispatcher);
        assert!(!secondary.enter().unwrap());
        assert!(secondary.is_entered());
        assert!(secondary.exit());
        assert!(first.join().unwrap());
        runner.shutdown().unwrap();
    }

    #[test]
    fn enter_on_dispatch_thread_pumps_nested() {
        let (queue, dispatcher) = setup();
        let secondary = Arc::new(SecondaryLoop::new(dispatcher.clone()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (log, nested, d) = (order.clone(), secondary.clone(), dispatcher.clone());
        queue.set_handler(move |ev| {
            let src = ev.source().unwrap_or(0);
            log.lock().push((src, d.depth()));
            match src {
                1 => {
                    assert!(nested.enter()?);
                }
                3 => {
                    assert!(nested.exit());
                }
                _ => {}
            }
            Ok(())
        });
        for n in 1..=4 {
            queue.post(Event::mouse(n));
        }
        dispatcher.pump(|| order.lock().len() < 4).unwrap();
        assert_eq!(*order.lock(), vec![(1, 1), (2, 2), (3, 2), (4, 1)]);
        assert!(!secondary.is_entered());
    }

    #[test]
    fn timer_ends_nested_pump_on_dispatch_thread() {
        let (queue, dispatcher) = setup();
        let secondary = Arc::new(
            SecondaryLoop::builder(dispatcher.clone())
                .timeout(Duration::from_millis(30))
                .build(),
        );
        let nested = secondary.clone();
        let (tx, rx) = mpsc::channel();
        queue.post(Event::invocation(move || {
            tx.send(nested.enter()?).unwrap();
            Ok(())
        }));
        let mut outcome = None;
        dispatcher
            .pump(|| {
                outcome = rx.try_recv().ok();
                outcome.is_none()
            })
            .unwrap();
        assert_eq!(outcome, Some(true));
        assert!(!secondary.exit());
    }

    #[test]
    fn external_condition_ends_the_loop() {
        let (queue, dispatcher) = setup();
        let runner = running(&dispatcher);
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let secondary = SecondaryLoop::builder(dispatcher.clone())
            .condition(move || !flag.load(Ordering::SeqCst))
            .build();
        let r = released.clone();
        queue.set_handler(move |_| {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        queue.post(Event::custom(1, None));
        assert!(secondary.enter().unwrap());
        assert!(released.load(Ordering::SeqCst));
        assert!(!secondary.exit());
        runner.shutdown().unwrap();
    }

    #[test]
    fn loop_filter_is_installed_only_while_blocking() {
        let (queue, dispatcher) = setup();
        let runner = running(&dispatcher);
        let filter = Filter::generic(|ev: &Event<u32>| {
            if ev.kind() == EventKind::Mouse {
                FilterAction::Reject
            } else {
                FilterAction::Accept
            }
        });
        let secondary = Arc::new(
            SecondaryLoop::builder(dispatcher.clone())
                .filter(filter.clone())
                .build(),
        );
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        let check = filter.clone();
        let exit = secondary.clone();
        queue.set_handler(move |_| {
            tx.send(inner.filters().contains(&check)).unwrap();
            exit.exit();
            Ok(())
        });
        let poster = {
            let (queue, dispatcher) = (queue.clone(), dispatcher.clone());
            thread::spawn(move || {
                wait_for_nested(&dispatcher);
                queue.post(Event::mouse(1));
                queue.post(Event::custom(1, None));
            })
        };
        assert!(secondary.enter().unwrap());
        poster.join().unwrap();
        // The mouse event was rejected; the custom event saw the filter installed.
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!dispatcher.filters().contains(&filter));
        assert_eq!(queue.consumed_count(), 1);
        runner.shutdown().unwrap();
    }

    #[test]
    fn enter_right_after_spawn_blocks_on_the_spawned_thread() {
        let (_, dispatcher) = setup();
        for _ in 0..10 {
            let runner = dispatcher.spawn("dispatch").unwrap();
            // Deliberately no wait for the runner to start pumping.
            let secondary = SecondaryLoop::builder(dispatcher.clone())
                .timeout(Duration::from_millis(5))
                .build();
            assert!(secondary.enter().unwrap());
            assert!(!dispatcher.is_dispatch_thread());
            runner.shutdown().unwrap();
        }
    }

    /// A queue that counts requests to drop in-flight sequences.
    #[derive(Default)]
    struct DiscardCounting {
        queue: EventQueue<u32>,
        discards: AtomicUsize,
    }

    impl EventSource<u32> for DiscardCounting {
        fn next_event(&self, mask: EventMask) -> Result<Event<u32>, FetchError> {
            self.queue.next_event(mask)
        }

        fn dispatch(&self, event: &mut Event<u32>) -> Result<(), DispatchError> {
            self.queue.dispatch(event)
        }

        fn post(&self, event: Event<u32>) {
            self.queue.post(event);
        }

        fn post_urgent(&self, event: Event<u32>) {
            self.queue.post_urgent(event);
        }

        fn discard_in_flight_sequence(&self) {
            self.discards.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_setup() -> (Arc<DiscardCounting>, Arc<Dispatcher<u32>>) {
        let source = Arc::new(DiscardCounting::default());
        let dispatcher = Arc::new(Dispatcher::new(
            source.clone(),
            Arc::new(WindowRegistry::new()),
        ));
        (source, dispatcher)
    }

    #[test]
    fn enter_on_dispatch_thread_discards_in_flight_sequence() {
        let (source, dispatcher) = counting_setup();
        let secondary = Arc::new(
            SecondaryLoop::builder(dispatcher.clone())
                .condition(|| false)
                .build(),
        );
        let nested = secondary.clone();
        let (tx, rx) = mpsc::channel();
        source.post(Event::invocation(move || {
            tx.send(nested.enter()?).unwrap();
            Ok(())
        }));
        let mut outcome = None;
        dispatcher
            .pump(|| {
                outcome = rx.try_recv().ok();
                outcome.is_none()
            })
            .unwrap();
        assert_eq!(outcome, Some(true));
        assert_eq!(source.discards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enter_from_foreign_thread_discards_in_flight_sequence() {
        let (source, dispatcher) = counting_setup();
        let runner = dispatcher.spawn("dispatch").unwrap();
        let secondary = Arc::new(SecondaryLoop::new(dispatcher.clone()));
        let waiter = {
            let secondary = secondary.clone();
            thread::spawn(move || secondary.enter().unwrap())
        };
        wait_for_nested(&dispatcher);
        assert_eq!(source.discards.load(Ordering::SeqCst), 1);
        assert!(secondary.exit());
        assert!(waiter.join().unwrap());
        assert_eq!(source.discards.load(Ordering::SeqCst), 1);
        runner.shutdown().unwrap();
    }
}
