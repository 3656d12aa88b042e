use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BoardRevision {
    /// Original 26-pin header.
    Rev1,
    /// 26-pin header with I2C moved to lines 2/3.
    Rev2,
    /// 40-pin header (B+ and later).
    #[default]
    Plus,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum BoardConfig {
    Revision(BoardRevision),
    /// `header[n]` is the line behind physical pin `n + 1`, `null` for power
    /// and ground pins.
    Custom {
        header: Vec<Option<u32>>,
        max_line: u32,
    },
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig::Revision(BoardRevision::default())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpioConfig {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_consumer")]
    pub consumer: String,
    #[serde(default = "default_warnings")]
    pub warnings: bool,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_chip() -> String {
    "/dev/gpiochip0".to_string()
}

fn default_consumer() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_warnings() -> bool {
    true
}

fn default_join_timeout_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            board: BoardConfig::default(),
            chip: default_chip(),
            consumer: default_consumer(),
            warnings: default_warnings(),
            join_timeout_ms: default_join_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl GpioConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_section_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{ "http": { "host": "localhost:8080", "path": "/api/v1", "timeout": 30 } }"#,
        )
        .unwrap();

        assert_eq!(cfg.gpio.board, BoardConfig::Revision(BoardRevision::Plus));
        assert_eq!(cfg.gpio.chip, "/dev/gpiochip0");
        assert!(cfg.gpio.warnings);
        assert_eq!(cfg.gpio.join_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn board_can_be_named_or_custom() {
        let named: GpioConfig = serde_json::from_str(r#"{ "board": "rev1" }"#).unwrap();
        assert_eq!(named.board, BoardConfig::Revision(BoardRevision::Rev1));

        let custom: GpioConfig =
            serde_json::from_str(r#"{ "board": { "header": [null, 4, 5], "max_line": 27 } }"#)
                .unwrap();
        assert_eq!(
            custom.board,
            BoardConfig::Custom {
                header: vec![None, Some(4), Some(5)],
                max_line: 27
            }
        );
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = AppConfig::load_from_file("/nonexistent/chanio.json").unwrap_err();
        assert!(matches!(err, GpioError::Config(_)));
    }
}
