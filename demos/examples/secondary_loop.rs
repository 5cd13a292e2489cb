// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A worker thread waits on a secondary loop while the dispatch thread keeps working.
//!
//! Run:
//! - `RUST_LOG=understory_event_pump=debug cargo run -p understory_demos --example secondary_loop`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use understory_event_pump::dispatch::Dispatcher;
use understory_event_pump::event::Event;
use understory_event_pump::secondary::SecondaryLoop;
use understory_event_pump::source::EventQueue;
use understory_event_pump::window::WindowRegistry;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let queue = Arc::new(EventQueue::<u32>::new());
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        Arc::new(WindowRegistry::new()),
    ));

    let progress = Arc::new(AtomicUsize::new(0));
    {
        let progress = progress.clone();
        queue.set_handler(move |_| {
            progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let runner = dispatcher.spawn("dispatch").expect("spawn dispatch thread");

    // Block until five events have been handled, or two seconds pass.
    let watched = progress.clone();
    let secondary = SecondaryLoop::builder(dispatcher.clone())
        .condition(move || watched.load(Ordering::SeqCst) < 5)
        .timeout(Duration::from_secs(2))
        .build();

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for n in 0..5 {
                thread::sleep(Duration::from_millis(20));
                queue.post(Event::custom(n, None));
            }
        })
    };

    let start = Instant::now();
    let entered = secondary.enter().expect("secondary loop");
    println!(
        "secondary loop returned {entered} after {:?} with {} events handled",
        start.elapsed(),
        progress.load(Ordering::SeqCst)
    );
    producer.join().expect("producer thread");

    // Exiting a finished loop does nothing.
    println!("exit after completion: {}", secondary.exit());
    runner.shutdown().expect("clean shutdown");
}
