use std::fmt;
use std::ops::Not;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Subscription;
use crate::error::GpioError;

/// Physical line identity, produced by a [`PinResolver`](crate::PinResolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(u32);

impl Channel {
    pub const fn from_line(line: u32) -> Self {
        Channel(line)
    }

    pub const fn line(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingMode {
    /// Physical header pin numbers.
    Board,
    /// SoC line numbers.
    Bcm,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition that settled at `level` qualifies for this edge.
    pub fn matches(self, level: Level) -> bool {
        match self {
            Edge::Rising => level.is_high(),
            Edge::Falling => !level.is_high(),
            Edge::Both => true,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpioFunction {
    In,
    Out,
    AltFunction,
    Unknown,
}

/// A level change reported by a backend subscription. `timestamp` is taken
/// from the backend's monotonic clock when the change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub level: Level,
    pub timestamp: Duration,
}

// Textual and numeric forms. The numeric codes are the ones the classic
// Raspberry Pi Python API exposes, so scripts ported from it keep working.

impl FromStr for NumberingMode {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "board" | "physical" => Ok(NumberingMode::Board),
            "bcm" | "line" | "logical" => Ok(NumberingMode::Bcm),
            other => Err(GpioError::InvalidMode(other.to_string())),
        }
    }
}

impl TryFrom<i32> for NumberingMode {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            10 => Ok(NumberingMode::Board),
            11 => Ok(NumberingMode::Bcm),
            other => Err(GpioError::InvalidMode(other.to_string())),
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "input" => Ok(Direction::In),
            "out" | "output" => Ok(Direction::Out),
            other => Err(GpioError::InvalidDirection(other.to_string())),
        }
    }
}

impl TryFrom<i32> for Direction {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => Err(GpioError::InvalidDirection(other.to_string())),
        }
    }
}

impl FromStr for Pull {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Pull::Off),
            "up" => Ok(Pull::Up),
            "down" => Ok(Pull::Down),
            other => Err(GpioError::InvalidPullConfig(format!(
                "{other} should be either off, up or down"
            ))),
        }
    }
}

impl TryFrom<i32> for Pull {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            20 => Ok(Pull::Off),
            21 => Ok(Pull::Down),
            22 => Ok(Pull::Up),
            other => Err(GpioError::InvalidPullConfig(format!(
                "{other} should be either off, up or down"
            ))),
        }
    }
}

impl FromStr for Level {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "low" | "false" => Ok(Level::Low),
            "1" | "high" | "true" => Ok(Level::High),
            other => Err(GpioError::InvalidValue(format!(
                "level must be 0 or 1, got {other}"
            ))),
        }
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(GpioError::InvalidEdge(other.to_string())),
        }
    }
}

impl TryFrom<i32> for Edge {
    type Error = GpioError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            31 => Ok(Edge::Rising),
            32 => Ok(Edge::Falling),
            33 => Ok(Edge::Both),
            other => Err(GpioError::InvalidEdge(other.to_string())),
        }
    }
}

/// The operating-system side of a GPIO line.
///
/// Implementations only move bits; ownership, direction checks and worker
/// lifecycles are handled by [`GpioManager`](crate::GpioManager).
pub trait GpioBackend: Send + Sync {
    fn export(&self, channel: Channel) -> Result<(), GpioError>;
    fn unexport(&self, channel: Channel) -> Result<(), GpioError>;
    /// Whether the line is currently exported by anyone, this process included.
    fn is_exported(&self, channel: Channel) -> Result<bool, GpioError>;
    /// Applies direction and bias. For outputs, `initial` is driven before
    /// the call returns.
    fn set_direction(
        &self,
        channel: Channel,
        direction: Direction,
        pull: Pull,
        initial: Option<Level>,
    ) -> Result<(), GpioError>;
    fn read_level(&self, channel: Channel) -> Result<Level, GpioError>;
    fn write_level(&self, channel: Channel, level: Level) -> Result<(), GpioError>;
    fn query_function(&self, channel: Channel) -> Result<GpioFunction, GpioError>;
    /// Opens a new wait primitive receiving every subsequent level change of
    /// the line. Each subscription sees all transitions independently.
    fn subscribe(&self, channel: Channel) -> Result<Subscription, GpioError>;
}
