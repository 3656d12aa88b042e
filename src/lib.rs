mod backend;
mod config;
mod error;
mod events;
mod gpio;
mod manager;
mod pwm;
mod resolver;
mod routes;
mod warnings;
mod worker;

pub use config::{AppConfig, BoardConfig, BoardRevision, GpioConfig, HttpConfig};
pub use error::GpioError;
pub use events::{CallbackResult, EventCallback, WaitOutcome, callback};
pub use gpio::{
    Channel, Direction, Edge, GpioBackend, GpioFunction, Level, NumberingMode, Pull, Transition,
};
pub use manager::{ChannelInfo, GpioManager, Pwm};
pub use pwm::PwmStatus;
pub use resolver::{BoardLayout, PinResolver};
pub use routes::{AppState, EdgeEvent};
pub use warnings::{LogSink, RecordingSink, Warning, WarningSink};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{Canceller, MockGpioBackend, Publisher, Subscription, Wakeup};
