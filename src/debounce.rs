//! Layout-change coalescing.
//!
//! Hosts can fire several layout passes per frame. Every notification resets
//! a short quiet window on a worker thread; once the window passes without a
//! new notification the owner is asked to settle the latest pending area.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as channel, RecvTimeoutError, Sender};
use tracing::{debug, warn};

#[derive(Debug)]
enum Signal {
    Changed,
    Shutdown,
}

pub struct LayoutDebouncer {
    tx: Sender<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl LayoutDebouncer {
    /// Spawns the worker. `on_settled` returns `false` once its owner is
    /// gone, which ends the worker.
    pub fn spawn<F>(window: Duration, on_settled: F) -> io::Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<Signal>();
        let worker = thread::Builder::new()
            .name("layout-debounce".to_string())
            .spawn(move || {
                loop {
                    match rx.recv() {
                        Ok(Signal::Changed) => {}
                        Ok(Signal::Shutdown) | Err(_) => break,
                    }
                    loop {
                        match rx.recv_timeout(window) {
                            Ok(Signal::Changed) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                                debug!("Layout worker cancelled with a pending layout");
                                return;
                            }
                        }
                    }
                    if !on_settled() {
                        break;
                    }
                }
                debug!("Layout worker exiting");
            })?;

        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    pub fn notify(&self) {
        let _ = self.tx.send(Signal::Changed);
    }

    /// Cancels any pending settle without waiting for the worker.
    pub fn cancel(&self) {
        let _ = self.tx.send(Signal::Shutdown);
    }

    /// Cancels any pending settle and waits for the worker, unless called
    /// from the worker itself.
    pub fn shutdown(&mut self) {
        self.cancel();
        if let Some(handle) = self.worker.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Layout worker panicked");
            }
        }
    }
}

impl Drop for LayoutDebouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
