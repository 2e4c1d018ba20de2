use crate::auth::{AuthBackend, HttpAuthBackend, StaticAuthBackend};
use crate::catalog::{HttpCatalog, PluginCatalog, PluginRecord, StaticCatalog};
use crate::host::HostConfig;
use crate::origin::Origin;
use crate::protocol::OperatorIdentity;
use crate::surface::SurfaceLayout;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST_ORIGIN: &str = "http://localhost:8080";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_host_origin")]
    pub host_origin: String,
    #[serde(default = "default_operator")]
    pub operator: OperatorIdentity,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default)]
    pub surface_layout: SurfaceLayout,
}

/// Where plugin descriptors come from. A non-empty `url` takes precedence
/// over the inline `plugins` list.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub plugins: Vec<PluginRecord>,
}

/// Token endpoint used for plugin logins. Without an endpoint, `static_token`
/// is handed out instead, which is only meant for local harness runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub session_credential: Option<String>,
    #[serde(default)]
    pub static_token: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            host_origin: default_host_origin(),
            operator: default_operator(),
            catalog: CatalogSettings::default(),
            auth: AuthSettings::default(),
            http_timeout_ms: default_http_timeout_ms(),
            surface_layout: SurfaceLayout::default(),
        }
    }
}

impl HostSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms.max(100))
    }

    pub fn to_host_config(&self) -> Result<HostConfig> {
        let host_origin = Origin::from_url(&self.host_origin)
            .with_context(|| format!("host_origin is not a valid origin: {}", self.host_origin))?;
        Ok(HostConfig {
            host_origin,
            operator: self.operator.clone(),
            layout: self.surface_layout,
        })
    }

    pub fn build_catalog(&self) -> Box<dyn PluginCatalog> {
        match non_empty(&self.catalog.url) {
            Some(url) => Box::new(HttpCatalog::new(
                url,
                self.catalog.api_key.clone(),
                self.http_timeout(),
            )),
            None => Box::new(StaticCatalog::new(self.catalog.plugins.clone())),
        }
    }

    pub fn build_auth_backend(&self) -> Result<Box<dyn AuthBackend>> {
        if let Some(endpoint) = non_empty(&self.auth.endpoint) {
            return Ok(Box::new(HttpAuthBackend::new(
                endpoint,
                self.auth.session_credential.clone(),
                self.http_timeout(),
            )));
        }
        let token = non_empty(&self.auth.static_token)
            .context("auth settings need either `endpoint` or `static_token`")?;
        Ok(Box::new(StaticAuthBackend::granting(token)))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("host.json")
}

pub fn load_settings(config_dir: &Path) -> Result<HostSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn save_settings(config_dir: &Path, settings: &HostSettings) -> Result<()> {
    save_settings_to_path(&settings_path(config_dir), settings)
}

pub fn load_settings_from_path(path: &Path) -> Result<HostSettings> {
    if !path.exists() {
        return Ok(HostSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: HostSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;
    Ok(settings)
}

fn save_settings_to_path(path: &Path, settings: &HostSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("write settings file: {}", path.display()))?;
    Ok(())
}

const fn default_schema_version() -> u32 {
    1
}

fn default_host_origin() -> String {
    DEFAULT_HOST_ORIGIN.to_string()
}

fn default_operator() -> OperatorIdentity {
    OperatorIdentity {
        email: String::new(),
        name: "operator".to_string(),
        role: "member".to_string(),
    }
}

const fn default_http_timeout_ms() -> u64 {
    5000
}
