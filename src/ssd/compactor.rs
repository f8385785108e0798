//! Background compaction task.
//!
//! A dedicated thread woken through a coalescing one-slot channel. Each
//! wake drains every eligible sealed segment; shutdown is observed at
//! segment boundaries so a compaction pass always finishes cleanly.
//! Partially compacted segments are simply re-scanned on next startup.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender, TrySendError};

use super::LogCore;

pub(crate) enum CompactorMsg {
    Wake,
    Shutdown,
}

pub(crate) struct CompactorHandle {
    tx: Sender<CompactorMsg>,
    thread: Option<JoinHandle<()>>,
}

impl CompactorHandle {
    /// Coalescing: a wake while one is pending is dropped.
    pub fn wake(&self) {
        match self.tx.try_send(CompactorMsg::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn shutdown(mut self) {
        let _ = self.tx.send(CompactorMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) fn spawn(core: Arc<LogCore>) -> CompactorHandle {
    let (tx, rx) = bounded::<CompactorMsg>(1);
    let thread = std::thread::Builder::new()
        .name("tierkv-compactor".into())
        .spawn(move || loop {
            match rx.recv() {
                Ok(CompactorMsg::Wake) => core.run_compaction_passes(),
                Ok(CompactorMsg::Shutdown) | Err(_) => break,
            }
        })
        .expect("spawn compactor thread");
    CompactorHandle {
        tx,
        thread: Some(thread),
    }
}
