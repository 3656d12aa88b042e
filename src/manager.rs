use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::backend::{Canceller, Wakeup};
use crate::config::GpioConfig;
use crate::error::GpioError;
use crate::events::{EventCallback, EventWatcher, WaitOutcome};
use crate::gpio::{
    Channel, Direction, Edge, GpioBackend, GpioFunction, Level, NumberingMode, Pull,
};
use crate::pwm::{PwmStatus, SoftPwm};
use crate::resolver::{BoardLayout, PinResolver};
use crate::warnings::{LogSink, Warning, WarningSink};

#[derive(Debug, Clone, Copy)]
struct Context {
    mode: Option<NumberingMode>,
    warnings: bool,
}

/// Snapshot of one owned channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub id: u32,
    pub channel: Channel,
    pub direction: Direction,
    pub pull: Pull,
    pub edge_detect: Option<Edge>,
    pub debounce_ms: Option<u64>,
    pub pwm: Option<PwmStatus>,
}

#[derive(Default)]
struct EntryState {
    released: bool,
    direction: Option<Direction>,
    pull: Pull,
    watcher: Option<EventWatcher>,
    pwm: Option<SoftPwm>,
}

struct ChannelEntry {
    id: u32,
    channel: Channel,
    state: Mutex<EntryState>,
    waiters: Mutex<Vec<Canceller>>,
}

impl ChannelEntry {
    fn new(id: u32, channel: Channel) -> Self {
        Self {
            id,
            channel,
            state: Mutex::new(EntryState::default()),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn cancel_waiters(&self) {
        for waiter in self.waiters.lock().drain(..) {
            waiter.cancel();
        }
    }
}

/// Registry of the channels this process configured, and the entry point for
/// every channel operation.
///
/// Numbering mode and the warnings flag live here rather than in globals, so
/// independent managers can coexist. Dropping the manager releases every
/// channel it still owns.
pub struct GpioManager<B: GpioBackend + 'static> {
    backend: Arc<B>,
    resolver: Arc<dyn PinResolver>,
    sink: Arc<dyn WarningSink>,
    context: RwLock<Context>,
    channels: RwLock<FxHashMap<Channel, Arc<ChannelEntry>>>,
    join_timeout: Duration,
}

impl<B: GpioBackend + 'static> GpioManager<B> {
    pub fn new(config: &GpioConfig, backend: Arc<B>) -> Self {
        Self {
            backend,
            resolver: Arc::new(BoardLayout::from_config(&config.board)),
            sink: Arc::new(LogSink),
            context: RwLock::new(Context {
                mode: None,
                warnings: config.warnings,
            }),
            channels: RwLock::new(FxHashMap::default()),
            join_timeout: config.join_timeout(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PinResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn WarningSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn set_mode(&self, mode: NumberingMode) {
        let mut ctx = self.context.write();
        if ctx.mode.is_some_and(|m| m != mode) {
            debug!("numbering mode changed from {:?} to {mode:?}", ctx.mode);
        }
        ctx.mode = Some(mode);
    }

    pub fn mode(&self) -> Option<NumberingMode> {
        self.context.read().mode
    }

    pub fn set_warnings(&self, enabled: bool) {
        self.context.write().warnings = enabled;
    }

    pub fn warnings(&self) -> bool {
        self.context.read().warnings
    }

    fn warn(&self, warning: Warning) {
        if self.context.read().warnings {
            self.sink.warn(&warning);
        }
    }

    fn resolve(&self, id: u32) -> Result<Channel, GpioError> {
        let mode = self.context.read().mode.ok_or(GpioError::ModeNotSet)?;
        self.resolver.resolve(id, mode)
    }

    fn entry(&self, channel: Channel) -> Option<Arc<ChannelEntry>> {
        self.channels.read().get(&channel).cloned()
    }

    fn entry_or_insert(&self, id: u32, channel: Channel) -> Arc<ChannelEntry> {
        if let Some(entry) = self.entry(channel) {
            return entry;
        }
        self.channels
            .write()
            .entry(channel)
            .or_insert_with(|| Arc::new(ChannelEntry::new(id, channel)))
            .clone()
    }

    fn forget(&self, entry: &Arc<ChannelEntry>) {
        let mut channels = self.channels.write();
        if channels
            .get(&entry.channel)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            channels.remove(&entry.channel);
        }
    }

    /// Exports the line behind `id` and applies `direction`.
    ///
    /// `pull` other than [`Pull::Off`] is only valid for inputs. For outputs,
    /// `initial` is driven as part of applying the direction. A line already
    /// exported elsewhere is taken over after an [`Warning::AlreadyInUse`].
    pub fn configure(
        &self,
        id: u32,
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        let channel = self.resolve(id)?;
        if direction == Direction::Out && pull != Pull::Off {
            return Err(GpioError::InvalidPullConfig(format!(
                "pull {pull:?} cannot be used with an output on channel {id}"
            )));
        }

        loop {
            let entry = self.entry_or_insert(id, channel);
            let mut state = entry.state.lock();
            if state.released {
                // lost a race with cleanup of the same channel
                continue;
            }

            match state.direction {
                Some(_) => {
                    let watcher = match direction {
                        Direction::Out => state.watcher.take(),
                        Direction::In => None,
                    };
                    let pwm = match direction {
                        Direction::In => state.pwm.take(),
                        Direction::Out => None,
                    };
                    if watcher.is_some() || pwm.is_some() {
                        // workers may call back into this channel, stop them unlocked
                        drop(state);
                        if watcher.is_some() {
                            entry.cancel_waiters();
                        }
                        self.stop_workers(watcher, pwm);
                        continue;
                    }
                    if direction == Direction::Out {
                        entry.cancel_waiters();
                    }
                    self.backend
                        .set_direction(channel, direction, pull, initial)?;
                }
                None => {
                    if let Err(e) = self.claim(channel, direction, pull, initial) {
                        state.released = true;
                        drop(state);
                        self.forget(&entry);
                        return Err(e);
                    }
                }
            }

            state.direction = Some(direction);
            state.pull = pull;
            debug!("channel {id} (line {channel}) configured as {direction:?}, pull {pull:?}");
            return Ok(());
        }
    }

    fn claim(
        &self,
        channel: Channel,
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        // best effort, the line can still be grabbed between check and export
        let exported = self.backend.is_exported(channel)?;
        let alternate = self.backend.query_function(channel)? == GpioFunction::AltFunction;
        if exported || alternate {
            self.warn(Warning::AlreadyInUse(channel));
        }
        if exported {
            self.backend.unexport(channel)?;
        }

        self.backend.export(channel)?;
        if let Err(e) = self.backend.set_direction(channel, direction, pull, initial) {
            if let Err(unexport) = self.backend.unexport(channel) {
                warn!("failed to unexport line {channel} after setup error: {unexport}");
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn read(&self, id: u32) -> Result<Level, GpioError> {
        let channel = self.resolve(id)?;
        let entry = self
            .entry(channel)
            .ok_or_else(|| GpioError::WrongDirection(id.to_string()))?;
        let state = entry.state.lock();
        if state.direction.is_none() {
            return Err(GpioError::WrongDirection(id.to_string()));
        }
        self.backend.read_level(channel)
    }

    pub fn write(&self, id: u32, level: Level) -> Result<(), GpioError> {
        let channel = self.resolve(id)?;
        let entry = self
            .entry(channel)
            .ok_or_else(|| GpioError::WrongDirection(id.to_string()))?;
        let state = entry.state.lock();
        if state.direction != Some(Direction::Out) {
            return Err(GpioError::WrongDirection(id.to_string()));
        }
        self.backend.write_level(channel, level)
    }

    /// Asks the backend what the line is currently doing, whether or not this
    /// process configured it.
    pub fn gpio_function(&self, id: u32) -> Result<GpioFunction, GpioError> {
        let channel = self.resolve(id)?;
        self.backend.query_function(channel)
    }

    /// Releases one channel, or every owned channel when `id` is `None`.
    /// Returns how many channels were released.
    pub fn cleanup(&self, id: Option<u32>) -> Result<usize, GpioError> {
        let released = match id {
            Some(id) => {
                let channel = self.resolve(id)?;
                match self.entry(channel) {
                    Some(entry) => usize::from(self.release(&entry)),
                    None => 0,
                }
            }
            None => self.release_all(),
        };

        if released == 0 && !self.has_owned() {
            self.warn(Warning::CleanupOfNothing);
        }
        Ok(released)
    }

    fn has_owned(&self) -> bool {
        let entries: Vec<_> = self.channels.read().values().cloned().collect();
        entries
            .iter()
            .any(|entry| entry.state.lock().direction.is_some())
    }

    fn release_all(&self) -> usize {
        let entries: Vec<_> = self.channels.read().values().cloned().collect();
        entries
            .iter()
            .filter(|entry| self.release(entry))
            .count()
    }

    /// Tears down one entry: workers first, then direction reset, unexport,
    /// and removal from the map. Returns false if it was not owned.
    fn release(&self, entry: &Arc<ChannelEntry>) -> bool {
        let mut state = loop {
            let mut state = entry.state.lock();
            if state.released || state.direction.is_none() {
                return false;
            }
            let (watcher, pwm) = (state.watcher.take(), state.pwm.take());
            if watcher.is_none() && pwm.is_none() {
                break state;
            }
            // a worker attached while the previous batch was stopping lands here again
            drop(state);
            entry.cancel_waiters();
            self.stop_workers(watcher, pwm);
        };
        entry.cancel_waiters();

        let channel = entry.channel;
        if let Err(e) = self
            .backend
            .set_direction(channel, Direction::In, Pull::Off, None)
        {
            warn!("failed to reset line {channel} to input: {e}");
        }
        if let Err(e) = self.backend.unexport(channel) {
            warn!("failed to unexport line {channel}: {e}");
        }

        state.released = true;
        state.direction = None;
        drop(state);
        self.forget(entry);
        debug!("channel {} (line {channel}) released", entry.id);
        true
    }

    /// Joins workers taken out of an entry. Callers must not hold the entry's
    /// state lock, callbacks may be waiting on it.
    fn stop_workers(&self, watcher: Option<EventWatcher>, pwm: Option<SoftPwm>) {
        if let Some(mut watcher) = watcher {
            watcher.stop(self.join_timeout);
        }
        if let Some(mut pwm) = pwm {
            pwm.stop(self.join_timeout);
        }
    }

    /// Every channel currently owned, sorted by line.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let entries: Vec<_> = self.channels.read().values().cloned().collect();
        let mut infos: Vec<ChannelInfo> = entries
            .iter()
            .filter_map(|entry| {
                let state = entry.state.lock();
                let direction = state.direction?;
                Some(ChannelInfo {
                    id: entry.id,
                    channel: entry.channel,
                    direction,
                    pull: state.pull,
                    edge_detect: state.watcher.as_ref().map(EventWatcher::edge),
                    debounce_ms: state
                        .watcher
                        .as_ref()
                        .and_then(EventWatcher::debounce)
                        .map(|d| d.as_millis() as u64),
                    pwm: state.pwm.as_ref().map(SoftPwm::status),
                })
            })
            .collect();
        infos.sort_by_key(|info| info.channel);
        infos
    }

    fn input_entry(&self, id: u32) -> Result<Arc<ChannelEntry>, GpioError> {
        let channel = self.resolve(id)?;
        self.entry(channel)
            .ok_or_else(|| GpioError::WrongDirection(id.to_string()))
    }

    /// Starts edge detection on an input channel.
    pub fn add_event_detect(
        &self,
        id: u32,
        edge: Edge,
        callback: Option<EventCallback>,
        debounce: Option<Duration>,
    ) -> Result<(), GpioError> {
        let entry = self.input_entry(id)?;
        let mut state = entry.state.lock();
        if state.released || state.direction != Some(Direction::In) {
            return Err(GpioError::WrongDirection(id.to_string()));
        }
        if state.watcher.is_some() {
            return Err(GpioError::DuplicateWatcher(id.to_string()));
        }

        let subscription = self.backend.subscribe(entry.channel)?;
        state.watcher = Some(EventWatcher::spawn(
            entry.channel,
            edge,
            debounce,
            callback,
            subscription,
            self.sink.clone(),
        )?);
        Ok(())
    }

    pub fn add_event_callback(&self, id: u32, callback: EventCallback) -> Result<(), GpioError> {
        let entry = self.input_entry(id)?;
        let state = entry.state.lock();
        if state.direction != Some(Direction::In) {
            return Err(GpioError::WrongDirection(id.to_string()));
        }
        let watcher = state
            .watcher
            .as_ref()
            .ok_or_else(|| GpioError::NotWatching(id.to_string()))?;
        watcher.add_callback(callback);
        Ok(())
    }

    /// Reads and clears the sticky detected flag.
    pub fn event_detected(&self, id: u32) -> Result<bool, GpioError> {
        let entry = self.input_entry(id)?;
        let state = entry.state.lock();
        let watcher = state
            .watcher
            .as_ref()
            .ok_or_else(|| GpioError::NotWatching(id.to_string()))?;
        Ok(watcher.take_detected())
    }

    /// Stops edge detection and wakes any `wait_for_edge` caller on the
    /// channel with [`WaitOutcome::Cancelled`].
    pub fn remove_event_detect(&self, id: u32) -> Result<(), GpioError> {
        let entry = self.input_entry(id)?;
        let watcher = entry.state.lock().watcher.take();
        match watcher {
            Some(watcher) => {
                entry.cancel_waiters();
                self.stop_workers(Some(watcher), None);
                Ok(())
            }
            None => Err(GpioError::NotWatching(id.to_string())),
        }
    }

    /// Blocks the calling thread until `edge` occurs on the channel, the
    /// timeout elapses, or the channel's edge detection is torn down.
    pub fn wait_for_edge(
        &self,
        id: u32,
        edge: Edge,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, GpioError> {
        let entry = self.input_entry(id)?;
        let subscription = {
            let state = entry.state.lock();
            if state.released || state.direction != Some(Direction::In) {
                return Err(GpioError::WrongDirection(id.to_string()));
            }
            let subscription = self.backend.subscribe(entry.channel)?;
            entry.waiters.lock().push(subscription.canceller());
            subscription
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match subscription.wait(remaining) {
                Wakeup::Changed(t) if edge.matches(t.level) => break WaitOutcome::Edge(entry.channel),
                Wakeup::Changed(_) => continue,
                Wakeup::TimedOut => break WaitOutcome::TimedOut,
                Wakeup::Cancelled => break WaitOutcome::Cancelled,
            }
        };

        entry.waiters.lock().retain(|w| !w.is_for(&subscription));
        Ok(outcome)
    }

    /// Creates a software PWM generator on an output channel.
    pub fn pwm(&self, id: u32, frequency_hz: f64) -> Result<Pwm<'_, B>, GpioError> {
        let channel = self.resolve(id)?;
        let entry = self
            .entry(channel)
            .ok_or_else(|| GpioError::NotConfiguredAsOutput(id.to_string()))?;
        let mut state = entry.state.lock();
        if state.released || state.direction != Some(Direction::Out) {
            return Err(GpioError::NotConfiguredAsOutput(id.to_string()));
        }
        if state.pwm.is_some() {
            return Err(GpioError::PwmAlreadyExists(id.to_string()));
        }

        let backend: Arc<dyn GpioBackend> = self.backend.clone();
        state.pwm = Some(SoftPwm::new(channel, frequency_hz, backend)?);
        Ok(Pwm {
            manager: self,
            id,
            channel,
        })
    }

    /// Handle to the PWM generator previously created on `id`.
    pub fn existing_pwm(&self, id: u32) -> Result<Pwm<'_, B>, GpioError> {
        let channel = self.resolve(id)?;
        let pwm = Pwm {
            manager: self,
            id,
            channel,
        };
        pwm.with(|_| Ok(()))?;
        Ok(pwm)
    }
}

impl<B: GpioBackend + 'static> Drop for GpioManager<B> {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            debug!("released {released} channel(s) on shutdown");
        }
    }
}

/// Borrowed handle to the software PWM generator of one channel. The
/// generator itself belongs to the channel and is stopped when the channel
/// is cleaned up.
pub struct Pwm<'a, B: GpioBackend + 'static> {
    manager: &'a GpioManager<B>,
    id: u32,
    channel: Channel,
}

impl<B: GpioBackend + 'static> Pwm<'_, B> {
    fn with<T>(&self, f: impl FnOnce(&mut SoftPwm) -> Result<T, GpioError>) -> Result<T, GpioError> {
        let missing = || GpioError::NotConfiguredAsOutput(self.id.to_string());
        let entry = self.manager.entry(self.channel).ok_or_else(missing)?;
        let mut state = entry.state.lock();
        if state.released || state.direction != Some(Direction::Out) {
            return Err(missing());
        }
        let pwm = state.pwm.as_mut().ok_or_else(missing)?;
        f(pwm)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn start(&self, duty_cycle: f64) -> Result<(), GpioError> {
        self.with(|pwm| pwm.start(duty_cycle))
    }

    pub fn change_duty_cycle(&self, duty_cycle: f64) -> Result<(), GpioError> {
        self.with(|pwm| pwm.change_duty_cycle(duty_cycle))
    }

    pub fn change_frequency(&self, frequency_hz: f64) -> Result<(), GpioError> {
        self.with(|pwm| pwm.change_frequency(frequency_hz))
    }

    pub fn stop(&self) -> Result<(), GpioError> {
        let timeout = self.manager.join_timeout;
        self.with(|pwm| {
            pwm.stop(timeout);
            Ok(())
        })
    }

    pub fn status(&self) -> Result<PwmStatus, GpioError> {
        self.with(|pwm| Ok(pwm.status()))
    }

    /// Stops the generator and detaches it from the channel so a new one can
    /// be created.
    pub fn close(self) -> Result<(), GpioError> {
        let entry = self
            .manager
            .entry(self.channel)
            .ok_or_else(|| GpioError::NotConfiguredAsOutput(self.id.to_string()))?;
        let pwm = entry.state.lock().pwm.take();
        if let Some(mut pwm) = pwm {
            pwm.stop(self.manager.join_timeout);
        }
        Ok(())
    }
}
