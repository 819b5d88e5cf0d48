//! Background receive loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::transport::Transport;

/// Polls a transport's links on a dedicated thread until stopped.
///
/// The loop sleeps for `idle` whenever a pass finds no frames. Dropping the
/// handle stops the thread and joins it.
pub struct ReceiveLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    pub fn spawn(transport: Arc<Transport>, idle: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("ethmsg-rx".to_string())
            .spawn(move || {
                debug!("receive loop started");
                let mut frames = 0usize;
                while !flag.load(Ordering::Acquire) {
                    let taken = transport.poll();
                    frames += taken;
                    if taken == 0 {
                        thread::sleep(idle);
                    }
                }
                debug!(frames, "receive loop stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("receive loop panicked");
            }
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.halt();
    }
}
