use super::{Error, Transport};

use clap::{crate_name, crate_version};
use colored::*;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::*;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Default per-request timeout
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Bearer-authenticated blocking HTTP client for the Assembla REST API
#[derive(Debug, Clone)]
pub struct Http {
    client: Client,
    base: String,
}

impl Http {
    pub fn new(token: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        Url::parse(base_url).map_err(|_| Error::Url(base_url.to_owned()))?;
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, format!("Bearer {}", token).parse()?);
        h.insert(ACCEPT, "application/json".parse()?);
        h.insert(
            USER_AGENT,
            format!("{}/{}", crate_name!(), crate_version!()).parse()?,
        );
        let client = Client::builder()
            .default_headers(h)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn send(&self, req: RequestBuilder) -> Result<Value> {
        let res = req.send()?;
        let status = res.status();
        let txt = res.text()?;
        if !status.is_success() {
            debug!("{} {}", status.to_string().red(), txt);
            return Err(Error::Status { status, body: txt });
        }
        decode(txt)
    }
}

/// Parses a successful response body. Assembla sends no body at all for empty collections.
fn decode(res: String) -> Result<Value> {
    if res.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&res).map_err(|e| Error::Decode { res, e })
}

impl Transport for Http {
    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        debug!("GET {} {:?}", path.cyan(), query);
        self.send(self.client.get(&self.url(path)).query(query))
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value> {
        debug!("POST {} {}", path.cyan(), body);
        self.send(self.client.post(&self.url(path)).json(body))
    }
}
