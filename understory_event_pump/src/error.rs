// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the pump.
//!
//! ## Overview
//!
//! Failures fall into four groups, each with a different effect on a running pump:
//!
//! | Failure | Type | Effect |
//! |---|---|---|
//! | Fatal signal | [`DispatchError::Fatal`] → [`PumpError::Fatal`] | stop flag set, re-raised to the pump's caller |
//! | Interruption | [`FetchError::Interrupted`] | stop flag set, pump exits with `Ok(())` |
//! | Per-event failure | [`DispatchError::Handler`] or a panic | reported to the [`FailureHandler`], pump continues |
//! | Misuse | [`PumpError::NotDispatchThread`], [`PumpError::AlreadyModal`], [`PumpError::NotModal`], [`PumpError::Spawn`] | returned before any frame is pushed |
//!
//! A single misbehaving handler can therefore never freeze or end a pump; only a
//! fatal signal, an interruption or an explicit stop does.

use core::fmt;
use std::error::Error;

use crate::event::EventKind;

/// Boxed error type used for per-event handler failures.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Failure fetching the next event from a source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The dispatch thread was interrupted while waiting for an event.
    #[error("event fetch was interrupted")]
    Interrupted,
}

/// Failure dispatching a single event.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The handler failed; the pump reports this and moves on to the next event.
    #[error("event handler failed: {0}")]
    Handler(#[source] BoxError),
    /// Unrecoverable thread-termination signal; ends every pump on the thread.
    #[error("fatal dispatch failure: {0}")]
    Fatal(String),
}

impl DispatchError {
    /// Wrap any error as a per-event handler failure.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Whether this failure ends the pump.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Failure of a pump entry point.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    /// A fatal signal was raised while dispatching; the stop flag has been set.
    #[error("pump terminated by fatal failure: {0}")]
    Fatal(String),
    /// The calling thread is not the thread that owns the active pump frames.
    #[error("pump entered from a thread that is not the dispatch thread")]
    NotDispatchThread,
    /// The window already has an active modal filter.
    #[error("window {0} already has an active modal filter")]
    AlreadyModal(String),
    /// The window has no modality.
    #[error("window {0} is not modal")]
    NotModal(String),
    /// A helper thread (such as a secondary loop's timeout timer) could not be started.
    #[error("failed to start helper thread")]
    Spawn(#[from] std::io::Error),
}

impl From<PumpError> for DispatchError {
    /// Nested pumps run inside handlers; a fatal pump failure keeps unwinding as a
    /// fatal dispatch failure, anything else becomes a per-event failure.
    fn from(err: PumpError) -> Self {
        match err {
            PumpError::Fatal(msg) => Self::Fatal(msg),
            other => Self::Handler(Box::new(other)),
        }
    }
}

/// Why a single event failed.
#[derive(Debug)]
pub enum FailureCause {
    /// A filter or handler returned an error.
    Error(BoxError),
    /// A filter or handler panicked; carries the panic message when it was a string.
    Panic(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err}"),
            Self::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// A per-event failure caught by the pump.
#[derive(Debug)]
pub struct EventFailure {
    /// Id of the failing event, when it had been fetched.
    pub event_id: Option<u32>,
    /// Kind of the failing event, when it had been fetched.
    pub kind: Option<EventKind>,
    /// What went wrong.
    pub cause: FailureCause,
}

impl fmt::Display for EventFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "failure dispatching {kind:?} event: {}", self.cause),
            None => write!(f, "failure in dispatch cycle: {}", self.cause),
        }
    }
}

/// Receives per-event failures caught by the pump.
///
/// Called on the dispatch thread. Implementations must not block.
pub trait FailureHandler: Send + Sync {
    /// Report one failure. The pump continues with the next event afterwards.
    fn handle(&self, failure: &EventFailure);
}

impl<F: Fn(&EventFailure) + Send + Sync> FailureHandler for F {
    fn handle(&self, failure: &EventFailure) {
        self(failure);
    }
}

/// Default [`FailureHandler`]: report through `tracing` at error level.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogFailures;

impl FailureHandler for LogFailures {
    fn handle(&self, failure: &EventFailure) {
        tracing::error!(
            event_id = failure.event_id,
            kind = ?failure.kind,
            cause = %failure.cause,
            "uncaught failure in event dispatch"
        );
    }
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
