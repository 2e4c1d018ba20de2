use crate::origin::Origin;
use crate::transport::{
    memory_pair, InboundMessage, MemoryChannel, MessageChannel, StdioProcessChannel,
    TransportError,
};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::time::Duration;
use url::Url;

pub const PLUGIN_URL_ENV: &str = "FRAMEPORT_PLUGIN_URL";
pub const PLUGIN_ID_ENV: &str = "FRAMEPORT_PLUGIN_ID";

/// Requested box for a plugin surface, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub top: i32,
    pub left: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub const fn new(top: i32, left: i32, width: i32, height: i32) -> Self {
        Self {
            top,
            left,
            width,
            height,
        }
    }
}

/// Inset applied between the requested box and the visible content area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceLayout {
    #[serde(default = "default_margin_px")]
    pub margin_px: i32,
    #[serde(default = "default_width_deduction_px")]
    pub width_deduction_px: i32,
}

impl Default for SurfaceLayout {
    fn default() -> Self {
        Self {
            margin_px: default_margin_px(),
            width_deduction_px: default_width_deduction_px(),
        }
    }
}

impl SurfaceLayout {
    fn normalized_margin_px(&self) -> i32 {
        self.margin_px.max(1)
    }

    fn normalized_width_deduction_px(&self) -> i32 {
        self.width_deduction_px.max(0)
    }

    /// Content box strictly inside `requested`; never negative in size.
    pub fn inset(&self, requested: Bounds) -> Bounds {
        let margin = self.normalized_margin_px();
        let width = requested
            .width
            .saturating_sub(margin.saturating_mul(2))
            .saturating_sub(self.normalized_width_deduction_px());
        let height = requested.height.saturating_sub(margin.saturating_mul(2));
        Bounds {
            top: requested.top.saturating_add(margin),
            left: requested.left.saturating_add(margin),
            width: width.max(0),
            height: height.max(0),
        }
    }
}

const fn default_margin_px() -> i32 {
    4
}

const fn default_width_deduction_px() -> i32 {
    2
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("spawn plugin surface failed: {0}")]
    Spawn(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Embedded, isolated container hosting one plugin.
///
/// Messaging goes through the [`MessageChannel`] supertrait; the remaining
/// methods drive the visual container.
pub trait PluginSurface: MessageChannel {
    fn set_visible(&mut self, visible: bool);
    fn apply_bounds(&mut self, bounds: Bounds);
    fn set_input_enabled(&mut self, enabled: bool);
}

pub struct SurfaceRequest<'a> {
    pub plugin_id: &'a str,
    pub load_url: &'a Url,
    pub host_origin: &'a Origin,
    pub plugin_origin: &'a Origin,
}

pub trait SurfaceFactory {
    fn create(
        &mut self,
        request: &SurfaceRequest<'_>,
    ) -> Result<Box<dyn PluginSurface>, SurfaceError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Presentation {
    pub visible: bool,
    pub bounds: Option<Bounds>,
    pub input_enabled: bool,
}

/// Surface with no visual container: records presentation state and
/// delegates messaging to `channel`.
pub struct HeadlessSurface<C: MessageChannel> {
    channel: C,
    presentation: Presentation,
}

impl<C: MessageChannel> HeadlessSurface<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            presentation: Presentation {
                visible: false,
                bounds: None,
                input_enabled: true,
            },
        }
    }

    pub fn presentation(&self) -> &Presentation {
        &self.presentation
    }
}

impl<C: MessageChannel> MessageChannel for HeadlessSurface<C> {
    fn post(&mut self, target: &Origin, payload: &str) -> Result<(), TransportError> {
        self.channel.post(target, payload)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        self.channel.receive(timeout)
    }

    fn terminate(&mut self) {
        self.channel.terminate();
    }
}

impl<C: MessageChannel> PluginSurface for HeadlessSurface<C> {
    fn set_visible(&mut self, visible: bool) {
        self.presentation.visible = visible;
    }

    fn apply_bounds(&mut self, bounds: Bounds) {
        self.presentation.bounds = Some(bounds);
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.presentation.input_enabled = enabled;
    }
}

/// Plugin-side end of an in-process surface.
pub struct PluginEndpoint {
    pub load_url: Url,
    pub channel: MemoryChannel,
}

/// Creates in-process surfaces; the plugin end of each channel waits here
/// until the embedder takes it.
///
/// Clones share the same endpoint table, so the embedder can keep a handle
/// after moving the factory into a registry.
#[derive(Clone, Default)]
pub struct MemorySurfaceFactory {
    endpoints: Rc<RefCell<HashMap<String, PluginEndpoint>>>,
    created_count: Rc<Cell<usize>>,
}

impl MemorySurfaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_plugin_endpoint(&self, plugin_id: &str) -> Option<PluginEndpoint> {
        self.endpoints.borrow_mut().remove(plugin_id)
    }

    pub fn created_count(&self) -> usize {
        self.created_count.get()
    }
}

impl SurfaceFactory for MemorySurfaceFactory {
    fn create(
        &mut self,
        request: &SurfaceRequest<'_>,
    ) -> Result<Box<dyn PluginSurface>, SurfaceError> {
        let (host_end, plugin_end) =
            memory_pair(request.host_origin.clone(), request.plugin_origin.clone());
        self.endpoints.borrow_mut().insert(
            request.plugin_id.to_string(),
            PluginEndpoint {
                load_url: request.load_url.clone(),
                channel: plugin_end,
            },
        );
        self.created_count.set(self.created_count.get() + 1);
        Ok(Box::new(HeadlessSurface::new(host_end)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSurfaceConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub inherit_stderr: bool,
}

impl Default for ProcessSurfaceConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let worker_binary = "frameport-plugin-worker.exe";
        #[cfg(not(target_os = "windows"))]
        let worker_binary = "frameport-plugin-worker";

        let worker_path = std::env::var("FRAMEPORT_PLUGIN_WORKER_BIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| worker_binary.to_string());

        Self {
            command: worker_path,
            args: Vec::new(),
            extra_env: HashMap::new(),
            inherit_stderr: false,
        }
    }
}

impl ProcessSurfaceConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// Runs each plugin as a worker process talking over stdin/stdout.
pub struct ProcessSurfaceFactory {
    config: ProcessSurfaceConfig,
}

impl ProcessSurfaceFactory {
    pub fn new(config: ProcessSurfaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessSurfaceConfig {
        &self.config
    }
}

impl SurfaceFactory for ProcessSurfaceFactory {
    fn create(
        &mut self,
        request: &SurfaceRequest<'_>,
    ) -> Result<Box<dyn PluginSurface>, SurfaceError> {
        if self.config.command.trim().is_empty() {
            return Err(SurfaceError::Spawn(
                "plugin worker command is empty".to_string(),
            ));
        }

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.config.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .env(PLUGIN_ID_ENV, request.plugin_id)
            .env(PLUGIN_URL_ENV, request.load_url.as_str());

        for (key, value) in &self.config.extra_env {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .map_err(|err| SurfaceError::Spawn(format!("{}: {err}", self.config.command)))?;
        let channel = StdioProcessChannel::from_child(request.host_origin.clone(), child)?;
        tracing::debug!(plugin_id = request.plugin_id, command = %self.config.command, "spawned plugin worker");
        Ok(Box::new(HeadlessSurface::new(channel)))
    }
}
