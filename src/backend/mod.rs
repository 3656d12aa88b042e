#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
mod subscription;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
pub use subscription::{Canceller, Publisher, Subscription, Wakeup};
