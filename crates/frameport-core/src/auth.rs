use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("auth endpoint is empty")]
    MissingEndpoint,
    #[error("auth request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("auth transport error: {0}")]
    Transport(String),
    #[error("auth response invalid: {0}")]
    InvalidResponse(String),
    #[error("auth rejected: {0}")]
    Rejected(String),
}

/// Issues session tokens scoped to one plugin, on behalf of the host's own
/// authenticated session.
pub trait AuthBackend {
    fn issue_token(&mut self, plugin_id: &str) -> Result<String, AuthError>;
}

/// Backend answering every request the same way.
#[derive(Clone, Debug)]
pub struct StaticAuthBackend {
    outcome: Result<String, AuthError>,
    calls: Vec<String>,
}

impl StaticAuthBackend {
    pub fn granting(token: impl Into<String>) -> Self {
        Self {
            outcome: Ok(token.into()),
            calls: Vec::new(),
        }
    }

    pub fn failing(error: AuthError) -> Self {
        Self {
            outcome: Err(error),
            calls: Vec::new(),
        }
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }
}

impl AuthBackend for StaticAuthBackend {
    fn issue_token(&mut self, plugin_id: &str) -> Result<String, AuthError> {
        self.calls.push(plugin_id.to_string());
        self.outcome.clone()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Token endpoint reached over HTTP with the host session's credential.
#[derive(Clone, Debug)]
pub struct HttpAuthBackend {
    endpoint: String,
    session_credential: Option<String>,
    timeout: Duration,
}

impl HttpAuthBackend {
    pub fn new(
        endpoint: impl Into<String>,
        session_credential: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_credential,
            timeout,
        }
    }
}

impl AuthBackend for HttpAuthBackend {
    fn issue_token(&mut self, plugin_id: &str) -> Result<String, AuthError> {
        if self.endpoint.trim().is_empty() {
            return Err(AuthError::MissingEndpoint);
        }

        let agent = ureq::AgentBuilder::new()
            .timeout(self.timeout.max(Duration::from_millis(100)))
            .build();
        let mut req = agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json");
        if let Some(credential) = &self.session_credential {
            req = req.set("Authorization", format!("Bearer {credential}").as_str());
        }

        let response = match req.send_json(json!({ "pluginId": plugin_id })) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(AuthError::Status { status, body });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(AuthError::Transport(err.to_string()));
            }
        };

        let body: TokenResponse = response
            .into_json()
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        token_from_response(body)
    }
}

fn token_from_response(body: TokenResponse) -> Result<String, AuthError> {
    if let Some(error) = body.error {
        return Err(AuthError::Rejected(error));
    }
    body.token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| AuthError::InvalidResponse("response has no token".to_string()))
}
