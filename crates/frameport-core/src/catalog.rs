use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Where in the host UI a plugin is offered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PluginCategory {
    IssueDetails,
    ProjectPage,
    Unknown(String),
}

impl PluginCategory {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::IssueDetails => "issue_details",
            Self::ProjectPage => "project_page",
            Self::Unknown(tag) => tag.as_str(),
        }
    }

    pub fn from_tag(input: &str) -> Self {
        match input.trim() {
            "issue_details" => Self::IssueDetails,
            "project_page" => Self::ProjectPage,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl Serialize for PluginCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for PluginCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&raw))
    }
}

/// One plugin as published by the remote configuration source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub tooltip: String,
    #[serde(default)]
    pub publish_id: String,
    pub category: PluginCategory,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog endpoint is empty")]
    MissingEndpoint,
    #[error("catalog request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("catalog transport error: {0}")]
    Transport(String),
    #[error("decode catalog response failed: {0}")]
    Decode(String),
}

/// Remote configuration source listing the plugins available to this host.
pub trait PluginCatalog {
    fn fetch(&self) -> Result<Vec<PluginRecord>, CatalogError>;
}

/// Catalog backed by records already in memory (settings file, tests).
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    records: Vec<PluginRecord>,
}

impl StaticCatalog {
    pub fn new(records: Vec<PluginRecord>) -> Self {
        Self { records }
    }
}

impl PluginCatalog for StaticCatalog {
    fn fetch(&self) -> Result<Vec<PluginRecord>, CatalogError> {
        Ok(self.records.clone())
    }
}

/// Catalog served as a JSON array over HTTP.
#[derive(Clone, Debug)]
pub struct HttpCatalog {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            timeout,
        }
    }
}

impl PluginCatalog for HttpCatalog {
    fn fetch(&self) -> Result<Vec<PluginRecord>, CatalogError> {
        if self.endpoint.trim().is_empty() {
            return Err(CatalogError::MissingEndpoint);
        }

        let agent = ureq::AgentBuilder::new()
            .timeout(self.timeout.max(Duration::from_millis(100)))
            .build();
        let mut req = agent
            .get(self.endpoint.as_str())
            .set("Accept", "application/json");
        if let Some(api_key) = &self.api_key {
            req = req.set("Authorization", format!("Bearer {api_key}").as_str());
        }

        let response = match req.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(CatalogError::Status { status, body });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(CatalogError::Transport(err.to_string()));
            }
        };

        response
            .into_json::<Vec<PluginRecord>>()
            .map_err(|err| CatalogError::Decode(err.to_string()))
    }
}
