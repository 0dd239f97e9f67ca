use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    error::AuthError,
    structs::{Credentials, Project},
};

const LOGIN_ENDPOINT: &str = "login";

/// Upper bound for one API call, response body included. Archive downloads
/// only bound the wait for the response headers.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_id: &'a str,
    password: &'a str,
}

#[derive(Deserialize, Debug)]
struct LoginResponse {
    token: Option<Token>,
    user: Option<User>,
}

#[derive(Deserialize, Debug)]
struct Token {
    jwt: String,
}

#[derive(Deserialize, Debug)]
struct User {
    #[serde(default)]
    projects: Vec<Project>,
}

/// Authenticated connection to one AIR deployment.
///
/// Holds the HTTP client (and its cookie jar), the bearer token if AIR issued
/// one, and the projects granted at login. Lives for a single run.
pub struct Session {
    client: Client,
    base: Url,
    jwt: Option<String>,
    authorization: Option<header::HeaderValue>,
    projects: Vec<Project>,
    established_at: DateTime<Utc>,
}

impl Session {
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Projects the user may export under, as reported at login.
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub(crate) fn jwt(&self) -> Option<&str> {
        self.jwt.as_deref()
    }

    /// Starts a POST to an endpoint relative to the API base, authenticated.
    pub(crate) fn post(&self, endpoint: &str) -> RequestBuilder {
        let builder = self.client.post(format!("{}{}", self.base, endpoint));
        match &self.authorization {
            Some(value) => builder.header(header::AUTHORIZATION, value.clone()),
            None => builder,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base", &self.base.as_str())
            .field("token", &self.jwt.as_ref().map(|_| "<redacted>"))
            .field("projects", &self.projects)
            .field("established_at", &self.established_at)
            .finish()
    }
}

fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .cookie_store(true)
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("air_download/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Logs into AIR and returns the session every later call goes through.
///
/// # Arguments
///
/// * `base` - API base URL, with a trailing slash (see [crate::api_base]).
/// * `credentials` - The AIR login pair. Sent once, never stored in the session.
///
/// # Errors
///
/// * [AuthError::InvalidCredentials] when AIR answers 401/403 or grants no token.
/// * [AuthError::Unreachable] when the login endpoint cannot be reached.
pub async fn authenticate(base: &Url, credentials: &Credentials) -> Result<Session, AuthError> {
    let client = build_client().map_err(AuthError::Unreachable)?;

    let start = std::time::Instant::now();

    let response = client
        .post(format!("{}{}", base, LOGIN_ENDPOINT))
        .timeout(REQUEST_TIMEOUT)
        .json(&LoginRequest {
            user_id: credentials.username(),
            password: credentials.password(),
        })
        .send()
        .await
        .map_err(|e| {
            error!("Cannot reach AIR at {}: {}", base, e);
            AuthError::Unreachable(e)
        })?;

    debug!("Time to log in : {:?}", start.elapsed());

    match response.status() {
        status if status.is_success() => {}
        status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
            error!("AIR refused login for user {}", credentials.username());
            return Err(AuthError::InvalidCredentials {
                reason: format!("HTTP {}", status),
            });
        }
        status => {
            return Err(AuthError::UnexpectedResponse(format!(
                "HTTP {} from {}",
                status, LOGIN_ENDPOINT
            )))
        }
    }

    let has_cookie = response.cookies().next().is_some();

    let login: LoginResponse = response
        .json()
        .await
        .map_err(|e| AuthError::UnexpectedResponse(e.to_string()))?;

    let jwt = login.token.map(|token| token.jwt).filter(|jwt| !jwt.is_empty());
    if jwt.is_none() && !has_cookie {
        return Err(AuthError::InvalidCredentials {
            reason: "login response carried neither a token nor a session cookie".to_string(),
        });
    }

    let authorization = match &jwt {
        Some(jwt) => {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", jwt))
                .map_err(|e| AuthError::UnexpectedResponse(format!("unusable token: {}", e)))?;
            value.set_sensitive(true);
            Some(value)
        }
        None => None,
    };

    let projects = login.user.map(|user| user.projects).unwrap_or_default();

    info!(
        "Logged into AIR as {} ({} projects available).",
        credentials.username(),
        projects.len()
    );

    Ok(Session {
        client,
        base: base.clone(),
        jwt,
        authorization,
        projects,
        established_at: Utc::now(),
    })
}
