//! Assembla OAuth2 authorization code flow.
//!
//! Obtain a client id and secret by registering an application with Assembla. Token requests
//! authenticate the application with HTTP Basic auth.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default authorization server
pub const OAUTH_URL: &str = "https://api.assembla.com";

const TOKEN_PATH: &str = "/token";
const AUTHORIZATION_PATH: &str = "/authorization";
const USER_DETAILS_PATH: &str = "/v1/user.json";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authorization canceled by user")]
    Canceled,
    #[error("Assembla token endpoint returned {status}: {body}")]
    Fatal { status: StatusCode, body: String },
    #[error("Unexpected answer from Assembla authorization server: {0}")]
    Unknown(String),
    #[error("HTTP request error")]
    Request(#[from] reqwest::Error),
    #[error("Invalid authorization URL: {0}")]
    Url(String),
    #[error("Assembla client id or secret not set (ASSEMBLA_CLIENT_ID, ASSEMBLA_CLIENT_SECRET)")]
    NotConfigured,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Token endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Assembla account behind a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub email: Option<String>,
    pub id: String,
    #[serde(rename(deserialize = "name"), default)]
    pub full_name: Option<String>,
}

/// Token request type. Only code exchange knows about user cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// `Basic base64(client_id:client_secret)`
pub fn basic_auth(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", client_id, client_secret))
    )
}

/// Classifies a token endpoint response
pub fn token_response(grant: Grant, status: StatusCode, body: &str) -> Result<Token> {
    if status == StatusCode::BAD_REQUEST && grant == Grant::AuthorizationCode {
        return Err(Error::Canceled);
    }
    if !status.is_success() {
        return Err(Error::Fatal {
            status,
            body: body.to_owned(),
        });
    }
    let v: Value = serde_json::from_str(body).map_err(|e| Error::Unknown(e.to_string()))?;
    if let Some(err) = v.get("error") {
        return match err.as_str() {
            Some("access_denied") => Err(Error::Canceled),
            _ => Err(Error::Unknown(err.to_string())),
        };
    }
    serde_json::from_value(v).map_err(|e| Error::Unknown(e.to_string()))
}

/// Decodes the user details document
pub fn identity_response(status: StatusCode, body: &str) -> Result<Identity> {
    if !status.is_success() {
        return Err(Error::Fatal {
            status,
            body: body.to_owned(),
        });
    }
    serde_json::from_str(body).map_err(|e| Error::Unknown(e.to_string()))
}

pub struct Authenticator {
    client_id: String,
    client_secret: String,
    base: String,
    http: Client,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("client_id", &self.client_id)
            .field("base", &self.base)
            .finish()
    }
}

impl Authenticator {
    /// Client credentials are mandatory. `base_url` is the authorization server, normally
    /// [`OAUTH_URL`].
    pub fn new(
        client_id: Option<&str>,
        client_secret: Option<&str>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let (id, secret) = match (client_id, client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => (id, secret),
            _ => return Err(Error::NotConfigured),
        };
        Url::parse(base_url).map_err(|_| Error::Url(base_url.to_owned()))?;
        Ok(Self {
            client_id: id.to_owned(),
            client_secret: secret.to_owned(),
            base: base_url.trim_end_matches('/').to_owned(),
            http: Client::builder().timeout(timeout).build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Where to send the user to grant access
    pub fn authorization_url(&self, state: Option<&str>) -> Result<Url> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
        ];
        if let Some(s) = state {
            params.push(("state", s));
        }
        Url::parse_with_params(&self.url(AUTHORIZATION_PATH), &params)
            .map_err(|e| Error::Url(e.to_string()))
    }

    fn token_request(&self, grant: Grant, params: &[(&str, &str)]) -> Result<Token> {
        let res = self
            .http
            .post(&self.url(TOKEN_PATH))
            .header(
                AUTHORIZATION,
                basic_auth(&self.client_id, &self.client_secret),
            )
            .header(ACCEPT, "application/json")
            .form(params)
            .send()?;
        let status = res.status();
        let body = res.text()?;
        debug!("token endpoint: {}", status);
        token_response(grant, status, &body)
    }

    /// Trades an authorization code for tokens
    pub fn exchange_code(&self, code: &str) -> Result<Token> {
        self.token_request(
            Grant::AuthorizationCode,
            &[("grant_type", "authorization_code"), ("code", code)],
        )
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<Token> {
        let token = self.token_request(
            Grant::RefreshToken,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )?;
        info!("refreshed access token (expires in {:?}s)", token.expires_in);
        Ok(token)
    }

    /// Account details of the token owner
    pub fn identity(&self, access_token: &str) -> Result<Identity> {
        let res = self
            .http
            .get(&self.url(USER_DETAILS_PATH))
            .bearer_auth(access_token)
            .send()?;
        let status = res.status();
        identity_response(status, &res.text()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;
    use serde_json::json;

    fn auth_at(base: &str) -> Authenticator {
        Authenticator::new(Some("cid"), Some("s3cret"), base, Duration::from_secs(5)).unwrap()
    }

    fn auth() -> Authenticator {
        auth_at(OAUTH_URL)
    }

    #[test]
    fn basic_auth_header() {
        assert_eq!(basic_auth("cid", "s3cret"), "Basic Y2lkOnMzY3JldA==");
    }

    #[test]
    fn requires_credentials() {
        let t = Duration::from_secs(1);
        let new = |id, secret| Authenticator::new(id, secret, OAUTH_URL, t);
        assert_matches!(new(None, Some("s")), Err(Error::NotConfigured));
        assert_matches!(new(Some("c"), None), Err(Error::NotConfigured));
        assert_matches!(new(Some(""), Some("s")), Err(Error::NotConfigured));
    }

    #[test]
    fn reject_invalid_base_url() {
        let e = Authenticator::new(Some("c"), Some("s"), "nowhere", Duration::from_secs(1));
        assert_matches!(&e, Err(Error::Url(u)) if u == "nowhere");
        assert_eq!(
            e.unwrap_err().to_string(),
            "Invalid authorization URL: nowhere"
        );
    }

    #[test]
    fn authorization_url_carries_client_id() {
        let url = auth().authorization_url(Some("xyz")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.assembla.com/authorization?client_id=cid&response_type=code&state=xyz"
        );
        assert!(auth().authorization_url(None).unwrap().query().unwrap().ends_with("code"));
    }

    #[test]
    fn successful_exchange() {
        let t = token_response(
            Grant::AuthorizationCode,
            StatusCode::OK,
            r#"{"access_token": "a1", "refresh_token": "r1", "token_type": "bearer", "expires_in": 300}"#,
        )
        .unwrap();
        assert_eq!(t.access_token, "a1");
        assert_eq!(t.refresh_token.as_deref(), Some("r1"));
        assert_eq!(t.expires_in, Some(300));
    }

    #[test]
    fn bad_request_during_exchange_is_canceled() {
        assert_matches!(
            token_response(Grant::AuthorizationCode, StatusCode::BAD_REQUEST, ""),
            Err(Error::Canceled)
        );
    }

    #[test]
    fn other_errors_are_fatal() {
        assert_matches!(
            token_response(Grant::AuthorizationCode, StatusCode::UNAUTHORIZED, "nope"),
            Err(Error::Fatal { status, .. }) if status == StatusCode::UNAUTHORIZED
        );
        assert_matches!(
            token_response(Grant::RefreshToken, StatusCode::BAD_REQUEST, ""),
            Err(Error::Fatal { .. })
        );
    }

    #[test]
    fn malformed_token_is_unknown() {
        assert_matches!(
            token_response(Grant::AuthorizationCode, StatusCode::OK, "<html>"),
            Err(Error::Unknown(_))
        );
        assert_matches!(
            token_response(Grant::AuthorizationCode, StatusCode::OK, r#"{"token": "x"}"#),
            Err(Error::Unknown(_))
        );
    }

    #[test]
    fn error_payloads() {
        assert_matches!(
            token_response(
                Grant::AuthorizationCode,
                StatusCode::OK,
                r#"{"error": "access_denied"}"#
            ),
            Err(Error::Canceled)
        );
        assert_matches!(
            token_response(
                Grant::RefreshToken,
                StatusCode::OK,
                r#"{"error": "invalid_grant"}"#
            ),
            Err(Error::Unknown(_))
        );
    }

    #[test]
    fn decode_identity() {
        let id = identity_response(
            StatusCode::OK,
            r#"{"id": "u1", "login": "ann", "name": "Ann Example", "email": "ann@example.com"}"#,
        )
        .unwrap();
        assert_eq!(
            id,
            Identity {
                email: Some("ann@example.com".into()),
                id: "u1".into(),
                full_name: Some("Ann Example".into()),
            }
        );
        assert_matches!(identity_response(StatusCode::OK, "oops"), Err(Error::Unknown(_)));
        assert_matches!(
            identity_response(StatusCode::FORBIDDEN, ""),
            Err(Error::Fatal { .. })
        );
    }

    #[test]
    fn exchange_code_over_http() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", "Basic Y2lkOnMzY3JldA==")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_contains("grant_type=authorization_code")
                .body_contains("code=c0de");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"access_token": "a1", "refresh_token": "r1", "expires_in": 300}));
        });
        let t = auth_at(&server.base_url()).exchange_code("c0de").unwrap();
        assert_eq!(t.access_token, "a1");
        assert_eq!(t.refresh_token.as_deref(), Some("r1"));
        token.assert();
    }

    #[test]
    fn refresh_over_http() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", "Basic Y2lkOnMzY3JldA==")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=r1");
            then.status(200)
                .json_body(json!({"access_token": "a2", "expires_in": 300}));
        });
        let t = auth_at(&server.base_url()).refresh("r1").unwrap();
        assert_eq!(t.access_token, "a2");
        token.assert();
    }

    #[test]
    fn bad_request_over_http() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).body(r#"{"error": "invalid_grant"}"#);
        });
        let a = auth_at(&server.base_url());
        assert_matches!(a.exchange_code("stale"), Err(Error::Canceled));
        assert_matches!(
            a.refresh("stale"),
            Err(Error::Fatal { status, body }) if status == StatusCode::BAD_REQUEST
                && body.contains("invalid_grant")
        );
        token.assert_hits(2);
    }

    #[test]
    fn server_error_over_http_is_fatal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(503).body("maintenance");
        });
        assert_matches!(
            auth_at(&server.base_url()).exchange_code("c0de"),
            Err(Error::Fatal { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn identity_over_http() {
        let server = MockServer::start();
        let me = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/user.json")
                .header("authorization", "Bearer a1");
            then.status(200)
                .json_body(json!({"id": "u1", "login": "ann", "name": "Ann Example"}));
        });
        let id = auth_at(&server.base_url()).identity("a1").unwrap();
        assert_eq!(id.id, "u1");
        assert_eq!(id.full_name.as_deref(), Some("Ann Example"));
        assert_eq!(id.email, None);
        me.assert();
    }

    #[test]
    fn authorization_url_follows_base() {
        let url = auth_at("http://127.0.0.1:9/")
            .authorization_url(None)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9/authorization?client_id=cid&response_type=code"
        );
    }
}
