use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::gpio::Transition;

const SUBSCRIPTION_QUEUE_CAPACITY: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Changed(Transition),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct SubscriptionState {
    pending: VecDeque<Transition>,
    cancelled: bool,
    parked: bool,
}

#[derive(Default)]
struct SubscriptionInner {
    state: Mutex<SubscriptionState>,
    ready: Condvar,
}

impl SubscriptionInner {
    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.ready.notify_all();
    }
}

/// Edge-triggered wait primitive for one line. Transitions published after the
/// subscription was opened queue up until consumed by [`Subscription::wait`].
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn wait(&self, timeout: Option<Duration>) -> Wakeup {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();

        loop {
            if state.cancelled {
                return Wakeup::Cancelled;
            }
            if let Some(transition) = state.pending.pop_front() {
                return Wakeup::Changed(transition);
            }

            state.parked = true;
            let timed_out = match deadline {
                Some(deadline) => self.inner.ready.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.inner.ready.wait(&mut state);
                    false
                }
            };
            state.parked = false;

            if timed_out && !state.cancelled && state.pending.is_empty() {
                return Wakeup::TimedOut;
            }
        }
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Cancels a [`Subscription`] from any thread, releasing a blocked waiter
/// with [`Wakeup::Cancelled`].
#[derive(Clone)]
pub struct Canceller {
    inner: Weak<SubscriptionInner>,
}

impl Canceller {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel();
        }
    }

    pub fn is_for(&self, subscription: &Subscription) -> bool {
        Weak::ptr_eq(&self.inner, &Arc::downgrade(&subscription.inner))
    }
}

/// Per-line fan-out of transitions to every open subscription.
#[derive(Default)]
pub struct Publisher {
    subscribers: Mutex<Vec<Weak<SubscriptionInner>>>,
}

impl Publisher {
    pub fn subscribe(&self) -> Subscription {
        let inner = Arc::new(SubscriptionInner::default());
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.strong_count() > 0);
        subscribers.push(Arc::downgrade(&inner));
        Subscription { inner }
    }

    pub fn publish(&self, transition: Transition) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let mut state = inner.state.lock();
            if state.pending.len() >= SUBSCRIPTION_QUEUE_CAPACITY {
                warn!("subscription queue full, dropping oldest transition");
                state.pending.pop_front();
            }
            state.pending.push_back(transition);
            drop(state);
            inner.ready.notify_one();
            true
        });
    }

    /// Releases every blocked waiter, e.g. when the line goes away.
    pub fn cancel_all(&self) {
        let mut subscribers = self.subscribers.lock();
        for inner in subscribers.drain(..).filter_map(|w| w.upgrade()) {
            inner.cancel();
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscribers.lock().iter().any(|s| s.strong_count() > 0)
    }

    /// True when every live subscriber has drained its queue and is parked
    /// waiting for the next transition.
    pub fn is_settled(&self) -> bool {
        self.subscribers
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .all(|inner| {
                let state = inner.state.lock();
                state.cancelled || (state.pending.is_empty() && state.parked)
            })
    }
}
