use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{Canceller, Subscription, Wakeup};
use crate::error::GpioError;
use crate::gpio::{Channel, Edge, Transition};
use crate::warnings::WarningSink;
use crate::worker::Worker;

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type CallbackResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Invoked on the channel's watcher thread for every reported edge.
pub type EventCallback = Arc<dyn Fn(Channel) -> CallbackResult + Send + Sync>;

pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(Channel) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Result of [`GpioManager::wait_for_edge`](crate::GpioManager::wait_for_edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitOutcome {
    Edge(Channel),
    TimedOut,
    /// The channel's edge detection or the channel itself was torn down.
    Cancelled,
}

struct WatchShared {
    channel: Channel,
    edge: Edge,
    debounce: Option<Duration>,
    callbacks: Mutex<Vec<EventCallback>>,
    detected: AtomicBool,
    last_reported: Mutex<Option<Duration>>,
    stop: AtomicBool,
}

impl WatchShared {
    /// Returns true when the transition was reported.
    fn process(&self, transition: Transition, sink: &dyn WarningSink) -> bool {
        if !self.edge.matches(transition.level) {
            return false;
        }

        {
            let mut last = self.last_reported.lock();
            if let (Some(window), Some(previous)) = (self.debounce, *last)
                && transition.timestamp.saturating_sub(previous) < window
            {
                return false;
            }
            *last = Some(transition.timestamp);
        }

        self.detected.store(true, Ordering::Release);

        // snapshot so callbacks may register further callbacks
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks.iter() {
            dispatch(self.channel, callback, sink);
        }
        true
    }
}

fn dispatch(channel: Channel, callback: &EventCallback, sink: &dyn WarningSink) {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(channel))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => sink.callback_failed(channel, &e.to_string()),
        Err(payload) => sink.callback_failed(channel, &panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Edge detection attached to one input channel: a dedicated thread blocked
/// on the channel's subscription, plus the sticky flag and callback list.
pub(crate) struct EventWatcher {
    shared: Arc<WatchShared>,
    canceller: Canceller,
    worker: Option<Worker>,
}

impl EventWatcher {
    pub(crate) fn spawn(
        channel: Channel,
        edge: Edge,
        debounce: Option<Duration>,
        callback: Option<EventCallback>,
        subscription: Subscription,
        sink: Arc<dyn WarningSink>,
    ) -> Result<Self, GpioError> {
        let shared = Arc::new(WatchShared {
            channel,
            edge,
            debounce,
            callbacks: Mutex::new(callback.into_iter().collect()),
            detected: AtomicBool::new(false),
            last_reported: Mutex::new(None),
            stop: AtomicBool::new(false),
        });
        let canceller = subscription.canceller();

        let worker_shared = shared.clone();
        let worker = Worker::spawn(format!("edge-watch-{channel}"), move || {
            watch_loop(worker_shared, subscription, sink);
        })?;

        debug!("edge detection started for channel {channel} ({edge:?}, debounce {debounce:?})");

        Ok(Self {
            shared,
            canceller,
            worker: Some(worker),
        })
    }

    pub(crate) fn edge(&self) -> Edge {
        self.shared.edge
    }

    pub(crate) fn debounce(&self) -> Option<Duration> {
        self.shared.debounce
    }

    pub(crate) fn add_callback(&self, callback: EventCallback) {
        self.shared.callbacks.lock().push(callback);
    }

    /// Reads and clears the sticky flag.
    pub(crate) fn take_detected(&self) -> bool {
        self.shared.detected.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn stop(&mut self, join_timeout: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::Release);
        self.canceller.cancel();
        worker.join(join_timeout);

        self.shared.callbacks.lock().clear();
        self.shared.detected.store(false, Ordering::Release);
        debug!("edge detection stopped for channel {}", self.shared.channel);
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.stop(WATCH_POLL_INTERVAL * 4);
    }
}

fn watch_loop(shared: Arc<WatchShared>, subscription: Subscription, sink: Arc<dyn WarningSink>) {
    while !shared.stop.load(Ordering::Acquire) {
        match subscription.wait(Some(WATCH_POLL_INTERVAL)) {
            Wakeup::Changed(transition) => {
                shared.process(transition, sink.as_ref());
            }
            Wakeup::TimedOut => continue,
            Wakeup::Cancelled => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use crate::warnings::RecordingSink;
    use std::sync::atomic::AtomicUsize;

    fn shared(edge: Edge, debounce: Option<Duration>) -> WatchShared {
        WatchShared {
            channel: Channel::from_line(4),
            edge,
            debounce,
            callbacks: Mutex::new(Vec::new()),
            detected: AtomicBool::new(false),
            last_reported: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    fn at(level: Level, ms: u64) -> Transition {
        Transition {
            level,
            timestamp: Duration::from_millis(ms),
        }
    }

    #[test]
    fn wrong_direction_is_discarded() {
        let sink = RecordingSink::default();
        let watch = shared(Edge::Falling, None);
        assert!(!watch.process(at(Level::High, 0), &sink));
        assert!(!watch.detected.load(Ordering::Acquire));
        assert!(watch.process(at(Level::Low, 1), &sink));
        assert!(watch.detected.load(Ordering::Acquire));
    }

    #[test]
    fn debounce_measures_from_last_reported() {
        let sink = RecordingSink::default();
        let watch = shared(Edge::Both, Some(Duration::from_millis(200)));

        assert!(watch.process(at(Level::High, 0), &sink));
        assert!(!watch.process(at(Level::Low, 150), &sink));
        // 250 ms after the last report even though only 100 ms after the last transition
        assert!(watch.process(at(Level::High, 250), &sink));
        assert!(watch.process(at(Level::Low, 450), &sink));
    }

    #[test]
    fn failing_callbacks_are_reported_and_later_callbacks_still_run() {
        let sink = RecordingSink::default();
        let watch = shared(Edge::Rising, None);
        let hits = Arc::new(AtomicUsize::new(0));

        watch
            .callbacks
            .lock()
            .push(callback(|_| Err("sensor offline".into())));
        watch.callbacks.lock().push(callback(|_| panic!("boom")));
        let counter = hits.clone();
        watch.callbacks.lock().push(callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(watch.process(at(Level::High, 0), &sink));
        assert!(watch.process(at(Level::High, 10), &sink));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let failures = sink.callback_failures();
        assert_eq!(failures.len(), 4);
        assert_eq!(failures[0].1, "sensor offline");
        assert_eq!(failures[1].1, "panicked: boom");
    }
}
