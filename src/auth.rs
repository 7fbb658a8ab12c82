//! Registry authentication: `WWW-Authenticate` challenges, bearer token
//! exchange and the base64 credential encoding shared with Docker.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    Basic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self, AppError> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "bearer" => AuthScheme::Bearer,
            "basic" => AuthScheme::Basic,
            _ => {
                return Err(AppError::Unauthorized(format!(
                    "unsupported authentication challenge '{header}'"
                )));
            }
        };
        Ok(Challenge { scheme, params: parse_params(rest) })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Token endpoint: the realm with every other parameter as a query pair.
    pub fn token_url(&self) -> Result<Url, AppError> {
        let realm = self
            .param("realm")
            .ok_or_else(|| AppError::Unauthorized("challenge without a realm".to_string()))?;
        let mut url = Url::parse(realm).map_err(|_| AppError::Url(realm.to_string()))?;
        let extra: Vec<_> =
            self.params.iter().filter(|(key, _)| !key.eq_ignore_ascii_case("realm")).collect();
        if !extra.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Widen pull-only repository scopes so the token also allows pushing.
    pub fn with_push_scope(mut self) -> Self {
        for (key, value) in self.params.iter_mut() {
            if !key.eq_ignore_ascii_case("scope") {
                continue;
            }
            let widened: Vec<String> = value
                .split(' ')
                .map(|scope| match scope.rsplit_once(':') {
                    Some((resource, "pull")) => format!("{resource}:pull,push"),
                    _ => scope.to_string(),
                })
                .collect();
            *value = widened.join(" ");
        }
        self
    }
}

fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        params.push((key.trim().to_string(), value.trim().to_string()));
    }

    params
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Credentials { username: username.into(), password: password.into() }
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }

    pub fn decode(encoded: &str) -> Result<Self, AppError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| AppError::config(format!("Stored credentials are not base64: {err}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AppError::config("Stored credentials are not valid UTF-8"))?;
        let (username, password) = text
            .split_once(':')
            .ok_or_else(|| AppError::config("Stored credentials are missing a ':' separator"))?;
        Ok(Credentials::new(username, password))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Exchange a bearer challenge for a registry token.
pub fn fetch_token(
    http: &Client,
    challenge: &Challenge,
    credentials: Option<&Credentials>,
) -> Result<String, AppError> {
    let url = challenge.token_url()?;
    debug!(url = %url, with_credentials = credentials.is_some(), "requesting registry token");

    let mut request = http.get(url.clone());
    if let Some(credentials) = credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }
    let response = request.send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AppError::Unauthorized(format!(
            "token request to {} failed with {}: {}",
            url.as_str().split('?').next().unwrap_or_default(),
            status,
            body.trim()
        )));
    }

    let body = response.bytes()?;
    let parsed: TokenResponse = serde_json::from_slice(&body)?;
    parsed
        .token
        .filter(|token| !token.is_empty())
        .or(parsed.access_token.filter(|token| !token.is_empty()))
        .ok_or_else(|| {
            AppError::Unauthorized(format!(
                "authentication is required and it was not provided: {}",
                String::from_utf8_lossy(&body)
            ))
        })
}
