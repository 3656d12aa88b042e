use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::GpioError;
use crate::gpio::{Channel, GpioBackend, Level};
use crate::worker::Worker;

const PWM_MIN_PERIOD: Duration = Duration::from_micros(10);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PwmStatus {
    pub frequency_hz: f64,
    pub duty_cycle: f64,
    pub running: bool,
}

pub(crate) fn validate_duty_cycle(duty_cycle: f64) -> Result<f64, GpioError> {
    if (0.0..=100.0).contains(&duty_cycle) {
        Ok(duty_cycle)
    } else {
        Err(GpioError::InvalidDutyCycle(duty_cycle.to_string()))
    }
}

pub(crate) fn validate_frequency(frequency_hz: f64) -> Result<f64, GpioError> {
    period_of(frequency_hz)?;
    Ok(frequency_hz)
}

/// One period at `frequency_hz`, rejecting frequencies whose period is not a
/// finite, representable duration.
fn period_of(frequency_hz: f64) -> Result<Duration, GpioError> {
    let invalid = || GpioError::InvalidFrequency(frequency_hz.to_string());
    if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return Err(invalid());
    }
    let period = Duration::try_from_secs_f64(1.0 / frequency_hz).map_err(|_| invalid())?;
    Instant::now().checked_add(period).ok_or_else(invalid)?;
    Ok(period.max(PWM_MIN_PERIOD))
}

#[derive(Debug, Clone, Copy)]
struct PwmParams {
    frequency_hz: f64,
    duty_cycle: f64,
}

impl PwmParams {
    /// High and low hold times for one period.
    fn phases(self) -> (Duration, Duration) {
        // frequency was validated on the way in
        let period = period_of(self.frequency_hz).unwrap_or(PWM_MIN_PERIOD);
        if self.duty_cycle <= 0.0 {
            return (Duration::ZERO, period);
        }
        if self.duty_cycle >= 100.0 {
            return (period, Duration::ZERO);
        }
        let high = period.mul_f64(self.duty_cycle / 100.0);
        (high, period.saturating_sub(high))
    }
}

struct PwmShared {
    channel: Channel,
    params: Mutex<PwmParams>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl PwmShared {
    /// Sleeps for `duration` unless stopped first. Returns true when stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                return *stopped;
            }
        }
        true
    }
}

/// Software PWM on one output channel, driven by a dedicated thread.
pub(crate) struct SoftPwm {
    shared: Arc<PwmShared>,
    backend: Arc<dyn GpioBackend>,
    worker: Option<Worker>,
}

impl SoftPwm {
    pub(crate) fn new(
        channel: Channel,
        frequency_hz: f64,
        backend: Arc<dyn GpioBackend>,
    ) -> Result<Self, GpioError> {
        let frequency_hz = validate_frequency(frequency_hz)?;
        Ok(Self {
            shared: Arc::new(PwmShared {
                channel,
                params: Mutex::new(PwmParams {
                    frequency_hz,
                    duty_cycle: 0.0,
                }),
                stopped: Mutex::new(true),
                wake: Condvar::new(),
            }),
            backend,
            worker: None,
        })
    }

    pub(crate) fn status(&self) -> PwmStatus {
        let params = *self.shared.params.lock();
        PwmStatus {
            frequency_hz: params.frequency_hz,
            duty_cycle: params.duty_cycle,
            running: self.worker.is_some(),
        }
    }

    /// Starts the generator, or only updates the duty cycle when already
    /// running.
    pub(crate) fn start(&mut self, duty_cycle: f64) -> Result<(), GpioError> {
        self.change_duty_cycle(duty_cycle)?;
        if self.worker.is_some() {
            return Ok(());
        }

        *self.shared.stopped.lock() = false;
        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let channel = self.shared.channel;
        match Worker::spawn(format!("soft-pwm-{channel}"), move || {
            pwm_loop(&shared, backend.as_ref())
        }) {
            Ok(worker) => {
                self.worker = Some(worker);
                debug!("soft PWM started on channel {channel}");
                Ok(())
            }
            Err(e) => {
                *self.shared.stopped.lock() = true;
                Err(e)
            }
        }
    }

    pub(crate) fn change_duty_cycle(&self, duty_cycle: f64) -> Result<(), GpioError> {
        let duty_cycle = validate_duty_cycle(duty_cycle)?;
        self.shared.params.lock().duty_cycle = duty_cycle;
        Ok(())
    }

    pub(crate) fn change_frequency(&self, frequency_hz: f64) -> Result<(), GpioError> {
        let frequency_hz = validate_frequency(frequency_hz)?;
        self.shared.params.lock().frequency_hz = frequency_hz;
        Ok(())
    }

    /// Stops the worker and leaves the line low.
    pub(crate) fn stop(&mut self, join_timeout: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        worker.join(join_timeout);

        let channel = self.shared.channel;
        if let Err(e) = self.backend.write_level(channel, Level::Low) {
            warn!("soft PWM on channel {channel}: failed to drive low after stop: {e}");
        }
        debug!("soft PWM stopped on channel {channel}");
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(100));
    }
}

fn pwm_loop(shared: &PwmShared, backend: &dyn GpioBackend) {
    let channel = shared.channel;
    let mut current: Option<Level> = None;
    let mut failing = false;

    let mut drive = |level: Level| {
        if current == Some(level) {
            return;
        }
        match backend.write_level(channel, level) {
            Ok(()) => {
                current = Some(level);
                failing = false;
            }
            Err(e) => {
                if !failing {
                    warn!("soft PWM on channel {channel}: write failed: {e}");
                }
                failing = true;
            }
        }
    };

    loop {
        // parameters are sampled once per period
        let (high, low) = shared.params.lock().phases();

        if !high.is_zero() {
            drive(Level::High);
            if shared.sleep(high) {
                break;
            }
        }
        if !low.is_zero() {
            drive(Level::Low);
            if shared.sleep(low) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_split_the_period() {
        let params = PwmParams {
            frequency_hz: 50.0,
            duty_cycle: 25.0,
        };
        let (high, low) = params.phases();
        assert!((high.as_secs_f64() - 0.005).abs() < 1e-6);
        assert!((low.as_secs_f64() - 0.015).abs() < 1e-6);
    }

    #[test]
    fn degenerate_duty_cycles() {
        let full = PwmParams {
            frequency_hz: 100.0,
            duty_cycle: 100.0,
        };
        let (high, low) = full.phases();
        assert_eq!(low, Duration::ZERO);
        assert!((high.as_secs_f64() - 0.010).abs() < 1e-6);

        let off = PwmParams {
            frequency_hz: 100.0,
            duty_cycle: 0.0,
        };
        let (high, low) = off.phases();
        assert_eq!(high, Duration::ZERO);
        assert!((low.as_secs_f64() - 0.010).abs() < 1e-6);
    }

    #[test]
    fn validation() {
        assert!(validate_duty_cycle(0.0).is_ok());
        assert!(validate_duty_cycle(100.0).is_ok());
        assert!(matches!(
            validate_duty_cycle(100.5),
            Err(GpioError::InvalidDutyCycle(_))
        ));
        assert!(validate_duty_cycle(f64::NAN).is_err());
        assert!(matches!(
            validate_frequency(0.0),
            Err(GpioError::InvalidFrequency(_))
        ));
        assert!(validate_frequency(f64::INFINITY).is_err());
        assert!(validate_frequency(0.5).is_ok());
    }

    #[test]
    fn unrepresentable_periods_are_rejected() {
        for frequency_hz in [1e-30, f64::MIN_POSITIVE, 1e-300] {
            assert!(matches!(
                validate_frequency(frequency_hz),
                Err(GpioError::InvalidFrequency(_))
            ));
        }
        assert!(validate_frequency(1e-3).is_ok());
        assert_eq!(period_of(1e9).ok(), Some(PWM_MIN_PERIOD));
    }
}
