//! # Nightwatch
//!
//! Robotic observatory supervision: remote actor proxies, device sets,
//! per-tile observation sequencing and the unattended overwatcher loop.

pub mod actor;
pub mod bus;
pub mod config;
pub mod coordinates;
pub mod device;
pub mod enclosure;
pub mod guider;
pub mod observatory;
pub mod observer;
pub mod overwatcher;
pub mod power;
pub mod retry;
pub mod scheduler;
pub mod spectrograph;
pub mod standards;
pub mod telemetry;
pub mod telescope;
pub mod tile;

#[doc(no_inline)]
pub use actor::{ActorClient, ActorReply, Args, RemoteActor};
#[doc(no_inline)]
pub use config::Config;
#[doc(no_inline)]
pub use coordinates::Coordinates;
#[doc(no_inline)]
pub use device::{Device, DeviceSet};
#[doc(no_inline)]
pub use observatory::{Observatory, TileRequest};
#[doc(no_inline)]
pub use observer::{Exposed, Observer};
#[doc(no_inline)]
pub use overwatcher::Overwatcher;
#[doc(no_inline)]
pub use tile::Tile;

/// Stable numeric codes attached to every [Error]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    CommandFailed = 2,
    CommandTimedOut = 5,
    LocalMode = 101,
    FailedReachingPosition = 102,
    InvalidPosition = 103,
    FibreSelectorInvalidPosition = 110,
    SpectrographFailed = 300,
    SpectrographNotIdle = 302,
    EnclosureFailed = 501,
    DomeMotionFailed = 502,
    GuiderFailed = 600,
    InvalidPixelName = 601,
    SchedulerUnavailable = 701,
    SchedulerTileError = 702,
    SchedulerRegistrationFailed = 703,
    AcquisitionFailed = 801,
    Unknown = 9999,
}
impl ErrorCode {
    pub fn value(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed executing command {command:?} on {actor}. {message}")]
    Rpc {
        actor: String,
        command: String,
        message: String,
    },
    #[error("message bus transport failed")]
    Transport(#[from] bus::TransportError),
    #[error("{0}")]
    LocalMode(String),
    #[error(
        "telescope {telescope} failed to reach desired position ({separation:.3} deg off). \
         The axes have been disabled for safety. Try re-homing the telescope"
    )]
    Pointing { telescope: String, separation: f64 },
    #[error("invalid telescope position: {0}")]
    InvalidPosition(String),
    #[error("fibre selector: {0}")]
    FibreSelector(String),
    #[error("spectrograph: {0}")]
    Spectrograph(String),
    #[error("some spectrographs are not idle: {0}")]
    SpectrographNotIdle(String),
    #[error("enclosure: {0}")]
    Enclosure(String),
    #[error("dome motion failed: {0}")]
    DomeMotion(String),
    #[error("guider: {0}")]
    Guider(String),
    #[error("invalid pixel name {pixel:?} for guider {guider}")]
    InvalidPixel { guider: String, pixel: String },
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
    #[error("tile error: {0}")]
    Tile(String),
    #[error("failed registering observation: {0}")]
    Registration(String),
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("overwatcher: {0}")]
    Overwatcher(String),
    #[error("{0}")]
    Unsafe(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration")]
    Toml(#[from] toml::de::Error),
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
    #[error("events encoding error")]
    Bincode(#[from] bincode::Error),
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),
}
impl Error {
    /// Returns the numeric code of the error
    pub fn code(&self) -> ErrorCode {
        use Error::*;
        match self {
            Rpc { .. } | Transport(_) => ErrorCode::CommandFailed,
            Timeout(_) => ErrorCode::CommandTimedOut,
            LocalMode(_) => ErrorCode::LocalMode,
            Pointing { .. } => ErrorCode::FailedReachingPosition,
            InvalidPosition(_) => ErrorCode::InvalidPosition,
            FibreSelector(_) => ErrorCode::FibreSelectorInvalidPosition,
            Spectrograph(_) => ErrorCode::SpectrographFailed,
            SpectrographNotIdle(_) => ErrorCode::SpectrographNotIdle,
            Enclosure(_) => ErrorCode::EnclosureFailed,
            DomeMotion(_) => ErrorCode::DomeMotionFailed,
            Guider(_) => ErrorCode::GuiderFailed,
            InvalidPixel { .. } => ErrorCode::InvalidPixelName,
            SchedulerUnavailable(_) => ErrorCode::SchedulerUnavailable,
            Tile(_) => ErrorCode::SchedulerTileError,
            Registration(_) => ErrorCode::SchedulerRegistrationFailed,
            Acquisition(_) => ErrorCode::AcquisitionFailed,
            _ => ErrorCode::Unknown,
        }
    }
}
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        let err = Error::Pointing {
            telescope: "sci".into(),
            separation: 0.2,
        };
        assert_eq!(err.code().value(), 102);
        assert!(err.to_string().contains("re-homing"));
        assert_eq!(Error::Acquisition("x".into()).code().value(), 801);
        assert_eq!(Error::Config("x".into()).code(), ErrorCode::Unknown);
    }
}
