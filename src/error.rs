use crate::darwin_subscriber::SubscriberError;
use crate::decoder::DecodeError;
use crate::store::StoreError;
use crate::webui::WebUiError;
use anyhow;
use config_file::ConfigFileError;
use tokio::task::JoinError;

use std::fmt;

#[derive(Debug)]
pub enum Error {
    ConfigFileError(ConfigFileError),
    IoError(std::io::Error),
    SerdeJsonError(serde_json::Error),
    StoreError(StoreError),
    SubscriberError(SubscriberError),
    DecodeError(DecodeError),
    AnyhowError(anyhow::Error),
    RocketError(rocket::Error),
    WebUiError(WebUiError),
    JoinError(JoinError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConfigFileError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::IoError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::SerdeJsonError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::StoreError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::SubscriberError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::DecodeError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::AnyhowError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::RocketError(x) => write!(f, "DarwinCancellations error: {}", x.pretty_print()),
            Error::WebUiError(x) => write!(f, "DarwinCancellations error: {}", x),
            Error::JoinError(x) => write!(f, "DarwinCancellations error: {}", x),
        }
    }
}

impl From<ConfigFileError> for Error {
    fn from(error: ConfigFileError) -> Self {
        Error::ConfigFileError(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerdeJsonError(error)
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Error::StoreError(error)
    }
}

impl From<SubscriberError> for Error {
    fn from(error: SubscriberError) -> Self {
        Error::SubscriberError(error)
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        Error::DecodeError(error)
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::AnyhowError(error)
    }
}

impl From<rocket::Error> for Error {
    fn from(error: rocket::Error) -> Self {
        Error::RocketError(error)
    }
}

impl From<WebUiError> for Error {
    fn from(error: WebUiError) -> Self {
        Error::WebUiError(error)
    }
}

impl From<JoinError> for Error {
    fn from(error: JoinError) -> Self {
        Error::JoinError(error)
    }
}
