use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::backend::{Publisher, Subscription};
use crate::config::GpioConfig;
use crate::error::GpioError;
use crate::gpio::{Channel, Direction, GpioBackend, GpioFunction, Level, Pull, Transition};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Character-device backend: each exported channel holds its own line
/// request on the configured chip.
pub struct LibgpiodBackend {
    chip: String,
    consumer: String,
    lines: RwLock<FxHashMap<Channel, LineHandle>>,
}

struct LineHandle {
    direction: Direction,
    publisher: Arc<Publisher>,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, consumer: &str, line_cfg: &line::Config) -> Result<Self, GpioError> {
        let chip = open_chip(chip)?;
        let mut req_cfg =
            request::Config::new().map_err(|e| GpioError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(consumer)
            .map_err(|e| GpioError::Gpio(format!("request consumer: {e}")))?;
        let request = chip
            .request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Gpio(format!("request lines: {e}")))?;
        Ok(Self { request })
    }
}

fn open_chip(path: &str) -> Result<Chip, GpioError> {
    let p = PathBuf::from(path);
    Chip::open(&p).map_err(|e| GpioError::Gpio(format!("open chip {path}: {e}")))
}

/// Drains kernel edge events for one line into its publisher.
struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        channel: Channel,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        publisher: Arc<Publisher>,
    ) -> Result<Self, GpioError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::Builder::new()
            .name(format!("gpiod-edges-{channel}"))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    let hdl = gpiod_handle.lock();
                    let req = &hdl.request;

                    let has_event =
                        match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("wait edge events error for line {channel}: {e}");
                                drop(hdl);
                                yield_now();
                                continue;
                            }
                        };
                    if !has_event {
                        continue;
                    }

                    let events = match req.read_edge_events(&mut buffer) {
                        Ok(evts) => evts,
                        Err(e) => {
                            warn!("read edge events error for line {channel}: {e}");
                            drop(hdl);
                            yield_now();
                            continue;
                        }
                    };
                    for evt in events {
                        let Ok(evt) = evt else {
                            continue;
                        };
                        let level = match evt.event_type() {
                            Ok(line::EdgeKind::Rising) => Level::High,
                            Ok(line::EdgeKind::Falling) => Level::Low,
                            Err(_) => continue,
                        };
                        publisher.publish(Transition {
                            level,
                            timestamp: evt.timestamp(),
                        });
                    }
                }
            })
            .map_err(|e| GpioError::Gpio(format!("spawn edge listener: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(config: &GpioConfig) -> Result<Self, GpioError> {
        // fail early on a missing chip rather than on first export
        open_chip(&config.chip)?;
        Ok(Self {
            chip: config.chip.clone(),
            consumer: config.consumer.clone(),
            lines: RwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<line::Settings, GpioError> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::Gpio(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Out => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| GpioError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| GpioError::Gpio(format!("set drive: {e}")))?;
                if let Some(level) = initial {
                    ls.set_output_value(to_value(level))
                        .map_err(|e| GpioError::Gpio(format!("set output value: {e}")))?;
                }
            }
            Direction::In => {
                let bias = match pull {
                    Pull::Off => Some(line::Bias::Disabled),
                    Pull::Up => Some(line::Bias::PullUp),
                    Pull::Down => Some(line::Bias::PullDown),
                };
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| GpioError::Gpio(format!("set direction: {e}")))?;
                ls.set_bias(bias)
                    .map_err(|e| GpioError::Gpio(format!("set bias: {e}")))?;
                // inputs always report both edges; filtering happens per subscriber
                ls.set_edge_detection(Some(line::Edge::Both))
                    .map_err(|e| GpioError::Gpio(format!("set edge detection: {e}")))?;
                ls.set_event_clock(EventClock::Monotonic)
                    .map_err(|e| GpioError::Gpio(format!("set event clock: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn not_exported(channel: Channel) -> GpioError {
        GpioError::Gpio(format!("line {channel} is not exported"))
    }
}

fn to_value(level: Level) -> line::Value {
    match level {
        Level::Low => line::Value::InActive,
        Level::High => line::Value::Active,
    }
}

impl GpioBackend for LibgpiodBackend {
    fn export(&self, channel: Channel) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        if lines.contains_key(&channel) {
            return Err(GpioError::Gpio(format!("line {channel} is already exported")));
        }

        let line_settings = Self::make_line_settings(Direction::In, Pull::Off, None)?;
        let line_cfg = Self::make_line_config(channel.line(), line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(
            &self.chip,
            &self.consumer,
            &line_cfg,
        )?));
        let publisher = Arc::new(Publisher::default());
        let listener = EdgeListener::new(channel, gpiod_handle.clone(), publisher.clone())?;

        lines.insert(
            channel,
            LineHandle {
                direction: Direction::In,
                publisher,
                gpiod_handle,
                listener: Some(listener),
            },
        );
        debug!("requested line {channel} on {}", self.chip);
        Ok(())
    }

    fn unexport(&self, channel: Channel) -> Result<(), GpioError> {
        if let Some(handle) = self.lines.write().remove(&channel) {
            handle.publisher.cancel_all();
        }
        Ok(())
    }

    fn is_exported(&self, channel: Channel) -> Result<bool, GpioError> {
        if self.lines.read().contains_key(&channel) {
            return Ok(true);
        }
        let chip = open_chip(&self.chip)?;
        let info = chip
            .line_info(channel.line())
            .map_err(|e| GpioError::Gpio(format!("line info {channel}: {e}")))?;
        Ok(info.is_used())
    }

    fn set_direction(
        &self,
        channel: Channel,
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&channel)
            .ok_or_else(|| Self::not_exported(channel))?;

        // the listener holds the request lock while waiting, stop it first
        drop(handle.listener.take());

        let line_settings = Self::make_line_settings(direction, pull, initial)?;
        let line_cfg = Self::make_line_config(channel.line(), line_settings)?;
        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Gpio(format!("reconfigure lines: {e}")))?;

        if direction == Direction::In {
            handle.listener = Some(EdgeListener::new(
                channel,
                handle.gpiod_handle.clone(),
                handle.publisher.clone(),
            )?);
        }
        handle.direction = direction;
        Ok(())
    }

    fn read_level(&self, channel: Channel) -> Result<Level, GpioError> {
        let lines = self.lines.read();
        let handle = lines
            .get(&channel)
            .ok_or_else(|| Self::not_exported(channel))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(channel.line())
            .map_err(|e| GpioError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn write_level(&self, channel: Channel, level: Level) -> Result<(), GpioError> {
        let lines = self.lines.read();
        let handle = lines
            .get(&channel)
            .ok_or_else(|| Self::not_exported(channel))?;

        if handle.direction != Direction::Out {
            return Err(GpioError::Gpio(format!(
                "line {channel} must be in output mode to set value"
            )));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(channel.line(), to_value(level))
            .map_err(|e| GpioError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn query_function(&self, channel: Channel) -> Result<GpioFunction, GpioError> {
        if let Some(handle) = self.lines.read().get(&channel) {
            return Ok(match handle.direction {
                Direction::In => GpioFunction::In,
                Direction::Out => GpioFunction::Out,
            });
        }

        let chip = open_chip(&self.chip)?;
        let info = chip
            .line_info(channel.line())
            .map_err(|e| GpioError::Gpio(format!("line info {channel}: {e}")))?;
        Ok(match info.direction() {
            Ok(line::Direction::Input) => GpioFunction::In,
            Ok(line::Direction::Output) => GpioFunction::Out,
            // claimed by the kernel for something other than plain GPIO
            _ if info.is_used() => GpioFunction::AltFunction,
            _ => GpioFunction::Unknown,
        })
    }

    fn subscribe(&self, channel: Channel) -> Result<Subscription, GpioError> {
        let lines = self.lines.read();
        let handle = lines
            .get(&channel)
            .ok_or_else(|| Self::not_exported(channel))?;
        Ok(handle.publisher.subscribe())
    }
}
