use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error(
        "Please set pin numbering mode using set_mode(NumberingMode::Board) or set_mode(NumberingMode::Bcm)"
    )]
    ModeNotSet,
    #[error("An invalid mode was passed to set_mode(): {0}")]
    InvalidMode(String),
    #[error("The channel sent is invalid on this board: {0}")]
    InvalidChannel(String),
    #[error("An invalid direction was passed to configure(): {0}")]
    InvalidDirection(String),
    #[error("Invalid pull configuration: {0}")]
    InvalidPullConfig(String),
    #[error("The GPIO channel has not been set up or is set up in the wrong direction: {0}")]
    WrongDirection(String),
    #[error("The edge must be set to rising, falling or both: {0}")]
    InvalidEdge(String),
    #[error("Edge detection is already enabled for channel {0}")]
    DuplicateWatcher(String),
    #[error("Edge detection has not been enabled for channel {0}")]
    NotWatching(String),
    #[error("You must configure channel {0} as an output first")]
    NotConfiguredAsOutput(String),
    #[error("A PWM generator already exists for channel {0}")]
    PwmAlreadyExists(String),
    #[error("Duty cycle must have a value from 0.0 to 100.0: {0}")]
    InvalidDutyCycle(String),
    #[error("Frequency must be greater than 0.0: {0}")]
    InvalidFrequency(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl ResponseError for GpioError {
    fn status_code(&self) -> StatusCode {
        match self {
            GpioError::InvalidChannel(_) => StatusCode::NOT_FOUND,
            GpioError::ModeNotSet
            | GpioError::WrongDirection(_)
            | GpioError::NotWatching(_)
            | GpioError::NotConfiguredAsOutput(_) => StatusCode::PRECONDITION_FAILED,
            GpioError::DuplicateWatcher(_) | GpioError::PwmAlreadyExists(_) => {
                StatusCode::CONFLICT
            }
            GpioError::InvalidMode(_)
            | GpioError::InvalidDirection(_)
            | GpioError::InvalidPullConfig(_)
            | GpioError::InvalidEdge(_)
            | GpioError::InvalidDutyCycle(_)
            | GpioError::InvalidFrequency(_)
            | GpioError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            GpioError::Config(_) | GpioError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
