// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Nested modal dialogs on a dispatch thread.
//!
//! This example shows:
//! - a frame with an application-modal "Preferences" dialog,
//! - a document-modal "Confirm" dialog opened from inside the preferences session,
//! - how clicks are blocked or delivered while each session runs.
//!
//! Run:
//! - `RUST_LOG=understory_event_pump=debug cargo run -p understory_demos --example modal_dialog`

use std::sync::Arc;
use std::sync::mpsc;

use understory_event_pump::dispatch::Dispatcher;
use understory_event_pump::event::{Event, EventKind};
use understory_event_pump::source::EventQueue;
use understory_event_pump::window::{ModalExclusion, Modality, WindowProps, WindowRegistry};

const FRAME: u32 = 1;
const PREFS: u32 = 2;
const CONFIRM: u32 = 3;
const PALETTE: u32 = 4;
const OK_BUTTON: u32 = 30;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let windows = Arc::new(WindowRegistry::new());
    windows.add_window(
        FRAME,
        WindowProps {
            visible: true,
            ..WindowProps::default()
        },
    );
    // A tool palette that stays usable while dialogs are up.
    windows.add_window(
        PALETTE,
        WindowProps {
            exclusion: ModalExclusion::Application,
            visible: true,
            ..WindowProps::default()
        },
    );
    windows.add_window(
        PREFS,
        WindowProps {
            owner: Some(FRAME),
            modality: Some(Modality::Application),
            ..WindowProps::default()
        },
    );
    windows.add_window(
        CONFIRM,
        WindowProps {
            owner: Some(PREFS),
            modality: Some(Modality::Document),
            ..WindowProps::default()
        },
    );
    windows.add_component(OK_BUTTON, CONFIRM);

    let queue = Arc::new(EventQueue::new());
    let dispatcher = Arc::new(Dispatcher::new(queue.clone(), windows.clone()));

    let (log_tx, log_rx) = mpsc::channel::<String>();
    {
        let (windows, dispatcher) = (windows.clone(), dispatcher.clone());
        queue.set_handler(move |ev: &mut Event<u32>| {
            let depth = dispatcher.depth();
            let _ = log_tx.send(format!(
                "{:>indent$}{:?} on {:?}",
                "",
                ev.kind(),
                ev.source(),
                indent = depth * 2
            ));
            match (ev.kind(), ev.source()) {
                // The frame's menu opens the preferences dialog.
                (EventKind::Action, Some(FRAME)) => {
                    windows.set_visible(PREFS, true);
                    dispatcher.run_modal(PREFS)?;
                }
                // "Apply" in preferences asks for confirmation.
                (EventKind::Action, Some(PREFS)) => {
                    windows.set_visible(CONFIRM, true);
                    dispatcher.run_modal(CONFIRM)?;
                    windows.set_visible(PREFS, false);
                }
                (EventKind::Action, Some(OK_BUTTON)) => {
                    windows.set_visible(CONFIRM, false);
                }
                _ => {}
            }
            Ok(())
        });
    }

    let runner = dispatcher.spawn("dispatch").expect("spawn dispatch thread");

    queue.post(Event::action(FRAME)); // open preferences
    queue.post(Event::mouse(FRAME)); // blocked by preferences
    queue.post(Event::mouse(PALETTE)); // excluded: delivered
    queue.post(Event::action(PREFS)); // open confirm
    queue.post(Event::mouse(PREFS)); // blocked by confirm (same document)
    queue.post(Event::mouse(OK_BUTTON)); // inside confirm: delivered
    queue.post(Event::action(OK_BUTTON)); // close confirm, then preferences
    queue.post(Event::mouse(FRAME)); // delivered again

    let (done_tx, done_rx) = mpsc::channel();
    queue.post(Event::invocation(move || {
        let _ = done_tx.send(());
        Ok(())
    }));
    done_rx.recv().expect("dispatch thread finished the script");
    runner.shutdown().expect("clean shutdown");

    println!("Dispatched:");
    for line in log_rx.try_iter() {
        println!("  {line}");
    }
    println!("Rejected by modal filters: {}", queue.consumed_count());
}
