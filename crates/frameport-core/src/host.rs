use crate::auth::AuthBackend;
use crate::catalog::{PluginCatalog, PluginCategory, PluginRecord};
use crate::origin::{parse_url, with_query_param, Origin, OriginError, HOST_ORIGIN_PARAM};
use crate::protocol::{
    ActivityContext, Envelope, HostNotification, LoginReply, OperatorIdentity, RequestId,
};
use crate::router::{DropReason, HostRequest, HostRouter, RouteOutcome};
use crate::surface::{
    Bounds, PluginSurface, SurfaceError, SurfaceFactory, SurfaceLayout, SurfaceRequest,
};
use crate::transport::InboundMessage;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Host's record of a registered plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub author: String,
    pub icon: String,
    pub tooltip: String,
    pub publish_id: String,
    pub category: PluginCategory,
    pub source_url: Option<String>,
}

impl From<PluginRecord> for PluginDescriptor {
    fn from(record: PluginRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            author: record.author,
            icon: record.icon,
            tooltip: record.tooltip,
            publish_id: record.publish_id,
            category: record.category,
            source_url: record.url.filter(|url| !url.trim().is_empty()),
        }
    }
}

/// Unloaded → Created → Shown ⇄ Hidden. There is no way back to Unloaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceState {
    Unloaded,
    Created,
    Shown,
    Hidden,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SurfaceSnapshot {
    pub state: SurfaceState,
    pub plugin_origin: Origin,
    pub context: ActivityContext,
    pub content_bounds: Option<Bounds>,
    pub input_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HostTelemetrySnapshot {
    pub surfaces_created: u64,
    pub notifications_sent: u64,
    pub logins_served: u64,
    pub logins_failed: u64,
    pub send_failures: u64,
    pub dropped_foreign_sender: u64,
    pub dropped_decode: u64,
    pub dropped_unknown_event: u64,
    pub dropped_other: u64,
}

impl HostTelemetrySnapshot {
    fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::ForeignSender => &mut self.dropped_foreign_sender,
            DropReason::Decode => &mut self.dropped_decode,
            DropReason::UnknownEvent => &mut self.dropped_unknown_event,
            DropReason::MissingRequestId | DropReason::WrongDirection => &mut self.dropped_other,
        };
        *counter = counter.saturating_add(1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("plugin `{0}` has no source url")]
    NoSourceUrl(String),
    #[error("plugin `{plugin_id}` source url is unusable: {source}")]
    SourceUrl {
        plugin_id: String,
        #[source]
        source: OriginError,
    },
    #[error("plugin `{plugin_id}` surface could not be created: {source}")]
    Surface {
        plugin_id: String,
        #[source]
        source: SurfaceError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub host_origin: Origin,
    pub operator: OperatorIdentity,
    pub layout: SurfaceLayout,
}

struct SurfaceSlot {
    surface: Box<dyn PluginSurface>,
    router: HostRouter,
    state: SurfaceState,
    context: ActivityContext,
    content_bounds: Option<Bounds>,
    input_enabled: bool,
}

impl SurfaceSlot {
    fn apply_bounds(&mut self, layout: &SurfaceLayout, requested: Bounds) {
        let inner = layout.inset(requested);
        self.surface.apply_bounds(inner);
        self.content_bounds = Some(inner);
    }

    fn post(&mut self, envelope: &Envelope, telemetry: &mut HostTelemetrySnapshot) -> bool {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(plugin_id = %self.router.plugin_id(), error = %err, "encode host message failed");
                telemetry.send_failures = telemetry.send_failures.saturating_add(1);
                return false;
            }
        };
        let target = self.router.expected_origin().clone();
        match self.surface.post(&target, &payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(plugin_id = %self.router.plugin_id(), error = %err, "post to plugin failed");
                telemetry.send_failures = telemetry.send_failures.saturating_add(1);
                false
            }
        }
    }

    fn notify(&mut self, notification: &HostNotification, telemetry: &mut HostTelemetrySnapshot) {
        let envelope = match notification.to_envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(plugin_id = %self.router.plugin_id(), error = %err, "build notification failed");
                return;
            }
        };
        if self.post(&envelope, telemetry) {
            telemetry.notifications_sent = telemetry.notifications_sent.saturating_add(1);
        }
    }
}

/// Owns the plugin descriptors of one host session and the surfaces
/// created for them.
pub struct HostRegistry {
    config: HostConfig,
    descriptors: HashMap<String, PluginDescriptor>,
    order: Vec<String>,
    slots: HashMap<String, SurfaceSlot>,
    factory: Box<dyn SurfaceFactory>,
    auth: Box<dyn AuthBackend>,
    telemetry: HostTelemetrySnapshot,
}

impl HostRegistry {
    pub fn new(
        config: HostConfig,
        factory: Box<dyn SurfaceFactory>,
        auth: Box<dyn AuthBackend>,
    ) -> Self {
        Self {
            config,
            descriptors: HashMap::new(),
            order: Vec::new(),
            slots: HashMap::new(),
            factory,
            auth,
            telemetry: HostTelemetrySnapshot::default(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Registers every record the catalog returns. A failed fetch is logged
    /// and registers nothing.
    pub fn load_catalog(&mut self, catalog: &dyn PluginCatalog) -> usize {
        let records = match catalog.fetch() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "plugin catalog fetch failed");
                return 0;
            }
        };

        let count = records.len();
        for record in records {
            self.register(PluginDescriptor::from(record));
        }
        info!(count, "plugin catalog loaded");
        count
    }

    pub fn register(&mut self, descriptor: PluginDescriptor) {
        if !self.descriptors.contains_key(&descriptor.id) {
            self.order.push(descriptor.id.clone());
        }
        self.descriptors.insert(descriptor.id.clone(), descriptor);
    }

    pub fn descriptor(&self, plugin_id: &str) -> Option<&PluginDescriptor> {
        self.descriptors.get(plugin_id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> + '_ {
        self.order.iter().filter_map(|id| self.descriptors.get(id))
    }

    pub fn list_by_category(&self, category: &PluginCategory) -> Vec<&PluginDescriptor> {
        self.descriptors()
            .filter(|descriptor| &descriptor.category == category)
            .collect()
    }

    pub fn surface_state(&self, plugin_id: &str) -> SurfaceState {
        self.slots
            .get(plugin_id)
            .map(|slot| slot.state)
            .unwrap_or(SurfaceState::Unloaded)
    }

    pub fn surface_snapshot(&self, plugin_id: &str) -> Option<SurfaceSnapshot> {
        self.slots.get(plugin_id).map(|slot| SurfaceSnapshot {
            state: slot.state,
            plugin_origin: slot.router.expected_origin().clone(),
            context: slot.context.clone(),
            content_bounds: slot.content_bounds,
            input_enabled: slot.input_enabled,
        })
    }

    pub fn telemetry_snapshot(&self) -> HostTelemetrySnapshot {
        self.telemetry.clone()
    }

    /// Shows a plugin for `context`, creating its surface on first use.
    ///
    /// `plugin-shown` is only sent on a transition into Shown; re-activating
    /// a shown plugin just updates its context and geometry. Unknown ids are
    /// ignored.
    pub fn activate(
        &mut self,
        plugin_id: &str,
        context: ActivityContext,
        bounds: Bounds,
    ) -> Result<(), ActivationError> {
        if !self.descriptors.contains_key(plugin_id) {
            debug!(plugin_id, "activate for unknown plugin ignored");
            return Ok(());
        }

        if !self.slots.contains_key(plugin_id) {
            let slot = self.create_slot(plugin_id)?;
            self.slots.insert(plugin_id.to_string(), slot);
            self.telemetry.surfaces_created = self.telemetry.surfaces_created.saturating_add(1);
        }

        let Some(slot) = self.slots.get_mut(plugin_id) else {
            return Ok(());
        };
        slot.context = context;
        if slot.state != SurfaceState::Shown {
            slot.surface.set_visible(true);
            slot.state = SurfaceState::Shown;
            let notification = HostNotification::Shown {
                context: slot.context.clone(),
            };
            slot.notify(&notification, &mut self.telemetry);
            debug!(plugin_id, "plugin shown");
        }
        slot.apply_bounds(&self.config.layout, bounds);
        Ok(())
    }

    /// Hides a plugin's surface and clears its context. Returns `false` when
    /// the plugin has no surface.
    pub fn deactivate(&mut self, plugin_id: &str) -> bool {
        let Some(slot) = self.slots.get_mut(plugin_id) else {
            return false;
        };
        slot.surface.set_visible(false);
        slot.state = SurfaceState::Hidden;
        slot.context = ActivityContext::new();
        slot.notify(&HostNotification::Hidden, &mut self.telemetry);
        debug!(plugin_id, "plugin hidden");
        true
    }

    pub fn reposition(&mut self, plugin_id: &str, bounds: Bounds) -> bool {
        let Some(slot) = self.slots.get_mut(plugin_id) else {
            return false;
        };
        slot.apply_bounds(&self.config.layout, bounds);
        true
    }

    pub fn suspend_input(&mut self, plugin_id: &str) -> bool {
        self.set_input_enabled(plugin_id, false)
    }

    pub fn resume_input(&mut self, plugin_id: &str) -> bool {
        self.set_input_enabled(plugin_id, true)
    }

    fn set_input_enabled(&mut self, plugin_id: &str, enabled: bool) -> bool {
        let Some(slot) = self.slots.get_mut(plugin_id) else {
            return false;
        };
        slot.surface.set_input_enabled(enabled);
        slot.input_enabled = enabled;
        true
    }

    /// Routes one inbound message received on `plugin_id`'s surface.
    pub fn handle_inbound(&mut self, plugin_id: &str, message: &InboundMessage) -> RouteOutcome {
        let Some(slot) = self.slots.get(plugin_id) else {
            debug!(plugin_id, "inbound message for plugin without surface");
            return RouteOutcome::Dropped(DropReason::ForeignSender);
        };

        let outcome = slot.router.route(message);
        match &outcome {
            RouteOutcome::Dispatch(HostRequest::Login { request_id }) => {
                self.serve_login(plugin_id, request_id.clone());
            }
            RouteOutcome::Dropped(reason) => self.telemetry.record_drop(*reason),
        }
        outcome
    }

    /// Drains every created surface and routes what arrived. Returns the
    /// number of messages handled.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let mut inbound = Vec::new();
        for plugin_id in &self.order {
            let Some(slot) = self.slots.get_mut(plugin_id) else {
                continue;
            };
            loop {
                match slot.surface.receive(timeout) {
                    Ok(Some(message)) => inbound.push((plugin_id.clone(), message)),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(plugin_id = %plugin_id, error = %err, "receive from plugin failed");
                        break;
                    }
                }
            }
        }

        let handled = inbound.len();
        for (plugin_id, message) in inbound {
            self.handle_inbound(&plugin_id, &message);
        }
        handled
    }

    fn create_slot(&mut self, plugin_id: &str) -> Result<SurfaceSlot, ActivationError> {
        let source = self
            .descriptors
            .get(plugin_id)
            .and_then(|descriptor| descriptor.source_url.clone())
            .ok_or_else(|| ActivationError::NoSourceUrl(plugin_id.to_string()))?;

        let source_url = parse_url(&source).map_err(|source| ActivationError::SourceUrl {
            plugin_id: plugin_id.to_string(),
            source,
        })?;
        let plugin_origin =
            Origin::from_parsed(&source_url).map_err(|source| ActivationError::SourceUrl {
                plugin_id: plugin_id.to_string(),
                source,
            })?;
        let load_url = with_query_param(
            &source_url,
            HOST_ORIGIN_PARAM,
            self.config.host_origin.as_str(),
        );

        let mut surface = self
            .factory
            .create(&SurfaceRequest {
                plugin_id,
                load_url: &load_url,
                host_origin: &self.config.host_origin,
                plugin_origin: &plugin_origin,
            })
            .map_err(|source| ActivationError::Surface {
                plugin_id: plugin_id.to_string(),
                source,
            })?;
        surface.set_visible(false);
        surface.set_input_enabled(true);
        info!(plugin_id, origin = %plugin_origin, "plugin surface created");

        Ok(SurfaceSlot {
            surface,
            router: HostRouter::new(plugin_id, plugin_origin),
            state: SurfaceState::Created,
            context: ActivityContext::new(),
            content_bounds: None,
            input_enabled: true,
        })
    }

    fn serve_login(&mut self, plugin_id: &str, request_id: RequestId) {
        let token = self.auth.issue_token(plugin_id);
        let Some(slot) = self.slots.get_mut(plugin_id) else {
            return;
        };

        let reply = match token {
            Ok(token) => {
                self.telemetry.logins_served = self.telemetry.logins_served.saturating_add(1);
                LoginReply::success(token, self.config.operator.clone(), slot.context.clone())
            }
            Err(err) => {
                warn!(plugin_id, error = %err, "plugin login failed");
                self.telemetry.logins_failed = self.telemetry.logins_failed.saturating_add(1);
                LoginReply::failure(err.to_string())
            }
        };

        match Envelope::login_reply(request_id, &reply) {
            Ok(envelope) => {
                slot.post(&envelope, &mut self.telemetry);
            }
            Err(err) => error!(plugin_id, error = %err, "build login reply failed"),
        }
    }
}

impl Drop for HostRegistry {
    fn drop(&mut self) {
        for slot in self.slots.values_mut() {
            slot.surface.terminate();
        }
        self.slots.clear();
    }
}
