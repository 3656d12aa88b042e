use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::error::GpioError;

/// A named background thread that can be joined with an upper bound on the
/// wait. Stop signalling is left to the owner.
pub(crate) struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: String, body: F) -> Result<Self, GpioError>
    where
        F: FnOnce() + Send + 'static,
    {
        // the sender is dropped when the thread exits, unwinding included
        let (exit_tx, exited) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exit_tx = exit_tx;
                body();
            })
            .map_err(|e| GpioError::Gpio(format!("spawn {name}: {e}")))?;

        Ok(Self {
            name,
            handle: Some(handle),
            exited,
        })
    }

    /// Waits up to `timeout` for the thread to finish. Returns false when the
    /// thread was left running, either because it is the calling thread or
    /// because it did not exit in time.
    pub(crate) fn join(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        if handle.thread().id() == thread::current().id() {
            debug!("{} stopping itself, not joining", self.name);
            return false;
        }

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("{} panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} did not stop within {:?}, leaving it detached",
                    self.name, timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn join_waits_for_exit() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let worker = Worker::spawn("test-worker".into(), move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        stop.store(true, Ordering::Release);
        assert!(worker.join(Duration::from_secs(1)));
    }

    #[test]
    fn join_gives_up_on_stuck_thread() {
        let worker = Worker::spawn("stuck-worker".into(), || {
            thread::sleep(Duration::from_millis(300));
        })
        .unwrap();

        assert!(!worker.join(Duration::from_millis(10)));
    }

    #[test]
    fn join_reports_panicking_thread_as_finished() {
        let worker = Worker::spawn("panicking-worker".into(), || panic!("boom")).unwrap();
        assert!(worker.join(Duration::from_secs(1)));
    }
}
