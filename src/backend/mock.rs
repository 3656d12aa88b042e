use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Publisher, Subscription};
use crate::error::GpioError;
use crate::gpio::{Channel, Direction, GpioBackend, GpioFunction, Level, Pull, Transition};

/// In-memory stand-in for the kernel GPIO interface.
///
/// Besides the [`GpioBackend`] operations it offers helpers to play the
/// outside world: driving input lines, wiring an output to an input,
/// pretending another process exported a line.
pub struct MockGpioBackend {
    lines: RwLock<HashMap<Channel, Mutex<MockLineState>>>, // keyed by line
    epoch: Instant,
}

struct MockLineState {
    exported: bool,
    function: GpioFunction,
    pull: Pull,
    level: Level,
    publisher: Arc<Publisher>,
    writes: Vec<Level>,
    wired_to: Vec<Channel>,
}

impl Default for MockLineState {
    fn default() -> Self {
        Self {
            exported: false,
            function: GpioFunction::In,
            pull: Pull::Off,
            level: Level::Low,
            publisher: Arc::new(Publisher::default()),
            writes: Vec::new(),
            wired_to: Vec::new(),
        }
    }
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self {
            lines: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> GpioError {
    GpioError::Gpio(format!("lock poisoned: {e}"))
}

impl MockGpioBackend {
    fn with_line<T>(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut MockLineState) -> Result<T, GpioError>,
    ) -> Result<T, GpioError> {
        {
            let lines = self.lines.read().map_err(poisoned)?;
            if let Some(line) = lines.get(&channel) {
                let mut line = line.lock().map_err(poisoned)?;
                return f(&mut line);
            }
        }

        let mut lines = self.lines.write().map_err(poisoned)?;
        let line = lines.entry(channel).or_default();
        let mut line = line.lock().map_err(poisoned)?;
        f(&mut line)
    }

    fn with_exported<T>(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut MockLineState) -> Result<T, GpioError>,
    ) -> Result<T, GpioError> {
        self.with_line(channel, |line| {
            if !line.exported {
                return Err(GpioError::Gpio(format!("line {channel} is not exported")));
            }
            f(line)
        })
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Changes the level seen on `channel` and notifies subscribers.
    /// Returns the lines wired to it.
    fn apply_level(
        &self,
        channel: Channel,
        level: Level,
        timestamp: Duration,
    ) -> Result<Vec<Channel>, GpioError> {
        self.with_line(channel, |line| {
            if line.level == level {
                return Ok(Vec::new());
            }
            line.level = level;
            if line.exported {
                line.publisher.publish(Transition { level, timestamp });
            }
            Ok(line.wired_to.clone())
        })
    }

    fn propagate(&self, channel: Channel, level: Level, timestamp: Duration) -> Result<(), GpioError> {
        let mut pending = vec![channel];
        while let Some(next) = pending.pop() {
            pending.extend(self.apply_level(next, level, timestamp)?);
        }
        Ok(())
    }

    /// Drives a level onto a line from outside, as a button or sensor would.
    pub fn drive(&self, channel: Channel, level: Level) -> Result<(), GpioError> {
        let now = self.now();
        self.propagate(channel, level, now)
    }

    /// Like [`drive`](Self::drive) with an explicit transition timestamp.
    pub fn drive_at(
        &self,
        channel: Channel,
        level: Level,
        timestamp: Duration,
    ) -> Result<(), GpioError> {
        self.propagate(channel, level, timestamp)
    }

    /// Connects `from` to `to` so that writes on `from` are seen on `to`.
    pub fn wire(&self, from: Channel, to: Channel) -> Result<(), GpioError> {
        self.with_line(from, |line| {
            if !line.wired_to.contains(&to) {
                line.wired_to.push(to);
            }
            Ok(())
        })
    }

    /// Simulates another process exporting the line and setting it up.
    pub fn export_external(&self, channel: Channel, direction: Direction) -> Result<(), GpioError> {
        self.with_line(channel, |line| {
            line.exported = true;
            line.function = match direction {
                Direction::In => GpioFunction::In,
                Direction::Out => GpioFunction::Out,
            };
            Ok(())
        })
    }

    /// Marks the line as claimed by an alternate function (I2C, SPI, ...).
    pub fn set_alt_function(&self, channel: Channel) -> Result<(), GpioError> {
        self.with_line(channel, |line| {
            line.function = GpioFunction::AltFunction;
            Ok(())
        })
    }

    pub fn level(&self, channel: Channel) -> Result<Level, GpioError> {
        self.with_line(channel, |line| Ok(line.level))
    }

    pub fn pull(&self, channel: Channel) -> Result<Pull, GpioError> {
        self.with_line(channel, |line| Ok(line.pull))
    }

    /// Every level written through [`GpioBackend::write_level`] or as an
    /// initial output value, oldest first.
    pub fn writes(&self, channel: Channel) -> Result<Vec<Level>, GpioError> {
        self.with_line(channel, |line| Ok(line.writes.clone()))
    }

    pub fn has_subscribers(&self, channel: Channel) -> Result<bool, GpioError> {
        self.with_line(channel, |line| Ok(line.publisher.has_subscribers()))
    }

    /// Blocks until every subscriber of the line has consumed its queued
    /// transitions and is parked again, or `timeout` elapses.
    pub fn wait_settled(&self, channel: Channel, timeout: Duration) -> Result<bool, GpioError> {
        let publisher = self.with_line(channel, |line| Ok(line.publisher.clone()))?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if publisher.is_settled() {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(publisher.is_settled())
    }
}

impl GpioBackend for MockGpioBackend {
    fn export(&self, channel: Channel) -> Result<(), GpioError> {
        self.with_line(channel, |line| {
            if line.exported {
                return Err(GpioError::Gpio(format!(
                    "line {channel} is already exported"
                )));
            }
            line.exported = true;
            line.publisher = Arc::new(Publisher::default());
            Ok(())
        })
    }

    fn unexport(&self, channel: Channel) -> Result<(), GpioError> {
        self.with_line(channel, |line| {
            line.exported = false;
            line.publisher.cancel_all();
            Ok(())
        })
    }

    fn is_exported(&self, channel: Channel) -> Result<bool, GpioError> {
        self.with_line(channel, |line| Ok(line.exported))
    }

    fn set_direction(
        &self,
        channel: Channel,
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        let wired = self.with_exported(channel, |line| {
            line.pull = pull;
            match direction {
                Direction::Out => {
                    line.function = GpioFunction::Out;
                    match initial {
                        Some(level) => {
                            line.writes.push(level);
                            line.level = level;
                            Ok(Some((level, line.wired_to.clone())))
                        }
                        None => Ok(None),
                    }
                }
                Direction::In => {
                    line.function = GpioFunction::In;
                    match pull {
                        Pull::Up => line.level = Level::High,
                        Pull::Down => line.level = Level::Low,
                        Pull::Off => {}
                    }
                    Ok(None)
                }
            }
        })?;

        if let Some((level, wired_to)) = wired {
            let now = self.now();
            for to in wired_to {
                self.propagate(to, level, now)?;
            }
        }
        Ok(())
    }

    fn read_level(&self, channel: Channel) -> Result<Level, GpioError> {
        self.with_exported(channel, |line| Ok(line.level))
    }

    fn write_level(&self, channel: Channel, level: Level) -> Result<(), GpioError> {
        self.with_exported(channel, |line| {
            if line.function != GpioFunction::Out {
                return Err(GpioError::Gpio(format!(
                    "line {channel} must be in output mode to set value"
                )));
            }
            line.writes.push(level);
            Ok(())
        })?;
        self.drive(channel, level)
    }

    fn query_function(&self, channel: Channel) -> Result<GpioFunction, GpioError> {
        self.with_line(channel, |line| Ok(line.function))
    }

    fn subscribe(&self, channel: Channel) -> Result<Subscription, GpioError> {
        self.with_exported(channel, |line| Ok(line.publisher.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Wakeup;

    const LED: Channel = Channel::from_line(18);
    const BUTTON: Channel = Channel::from_line(23);

    #[test]
    fn write_requires_output_direction() {
        let backend = MockGpioBackend::default();
        backend.export(LED).unwrap();
        backend.set_direction(LED, Direction::In, Pull::Off, None).unwrap();
        assert!(backend.write_level(LED, Level::High).is_err());

        backend
            .set_direction(LED, Direction::Out, Pull::Off, Some(Level::High))
            .unwrap();
        assert_eq!(backend.read_level(LED).unwrap(), Level::High);
        backend.write_level(LED, Level::Low).unwrap();
        assert_eq!(backend.writes(LED).unwrap(), vec![Level::High, Level::Low]);
    }

    #[test]
    fn wired_lines_follow_the_driver() {
        let backend = MockGpioBackend::default();
        backend.export(LED).unwrap();
        backend.export(BUTTON).unwrap();
        backend.wire(LED, BUTTON).unwrap();
        backend
            .set_direction(LED, Direction::Out, Pull::Off, Some(Level::Low))
            .unwrap();
        backend.set_direction(BUTTON, Direction::In, Pull::Off, None).unwrap();

        let sub = backend.subscribe(BUTTON).unwrap();
        backend.write_level(LED, Level::High).unwrap();

        assert_eq!(backend.read_level(BUTTON).unwrap(), Level::High);
        match sub.wait(Some(Duration::from_millis(100))) {
            Wakeup::Changed(t) => assert_eq!(t.level, Level::High),
            other => panic!("unexpected wakeup {other:?}"),
        }
    }

    #[test]
    fn unexport_cancels_subscriptions() {
        let backend = MockGpioBackend::default();
        backend.export(BUTTON).unwrap();
        let sub = backend.subscribe(BUTTON).unwrap();
        backend.unexport(BUTTON).unwrap();
        assert_eq!(sub.wait(None), Wakeup::Cancelled);
        assert!(!backend.is_exported(BUTTON).unwrap());
    }

    #[test]
    fn double_export_fails() {
        let backend = MockGpioBackend::default();
        backend.export_external(LED, Direction::Out).unwrap();
        assert!(backend.export(LED).is_err());
        assert_eq!(backend.query_function(LED).unwrap(), GpioFunction::Out);
    }
}
