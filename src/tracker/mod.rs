mod rest;

pub use self::rest::{Http, TIMEOUT};

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Assembla API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("HTTP request error")]
    Request(#[from] reqwest::Error),
    #[error("Trying to construct invalid HTTP header")]
    Header(#[from] http::header::InvalidHeaderValue),
    #[error("Invalid API URL {0}")]
    Url(String),
    #[error("Invalid JSON in Assembla response: {res}")]
    Decode {
        res: String,
        #[source]
        e: serde_json::Error,
    },
}

/// Authenticated JSON access to the Assembla REST API.
///
/// Paths are relative to the API base URL and start with a slash. Empty responses (Assembla
/// answers `204 No Content` for empty lists) come back as `Value::Null`.
pub trait Transport {
    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, Error>;

    fn post(&self, path: &str, body: &Value) -> Result<Value, Error>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, Error> {
        (**self).get(path, query)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, Error> {
        (**self).post(path, body)
    }
}
