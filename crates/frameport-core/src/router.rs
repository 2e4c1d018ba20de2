use crate::origin::Origin;
use crate::protocol::{Envelope, EventKind, LoginRequest, RequestId, PROTOCOL_VERSION};
use crate::transport::InboundMessage;
use tracing::{debug, trace, warn};

/// A decoded plugin request the host has to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostRequest {
    Login { request_id: RequestId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    ForeignSender,
    Decode,
    UnknownEvent,
    MissingRequestId,
    WrongDirection,
}

impl DropReason {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::ForeignSender => "foreign_sender",
            Self::Decode => "decode",
            Self::UnknownEvent => "unknown_event",
            Self::MissingRequestId => "missing_request_id",
            Self::WrongDirection => "wrong_direction",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatch(HostRequest),
    Dropped(DropReason),
}

/// Inbound filter and decoder for one plugin surface.
#[derive(Clone, Debug)]
pub struct HostRouter {
    plugin_id: String,
    expected: Origin,
}

impl HostRouter {
    pub fn new(plugin_id: impl Into<String>, expected: Origin) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            expected,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn expected_origin(&self) -> &Origin {
        &self.expected
    }

    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        if message.sender != self.expected {
            trace!(plugin_id = %self.plugin_id, sender = %message.sender, "ignoring message from foreign sender");
            return RouteOutcome::Dropped(DropReason::ForeignSender);
        }

        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(plugin_id = %self.plugin_id, error = %err, "dropping undecodable plugin message");
                return RouteOutcome::Dropped(DropReason::Decode);
            }
        };

        if envelope.effective_version() != PROTOCOL_VERSION {
            debug!(
                plugin_id = %self.plugin_id,
                version = envelope.effective_version(),
                "plugin speaks a different protocol version"
            );
        }

        match &envelope.name {
            EventKind::Login => match login_request_id(&envelope) {
                Some(request_id) => RouteOutcome::Dispatch(HostRequest::Login { request_id }),
                None => {
                    warn!(plugin_id = %self.plugin_id, "dropping login request without request id");
                    RouteOutcome::Dropped(DropReason::MissingRequestId)
                }
            },
            EventKind::PluginShown | EventKind::PluginHidden => {
                warn!(plugin_id = %self.plugin_id, event = %envelope.name, "plugin sent a host-only notification");
                RouteOutcome::Dropped(DropReason::WrongDirection)
            }
            EventKind::Unknown(tag) => {
                warn!(plugin_id = %self.plugin_id, event = %tag, "dropping unsupported plugin event");
                RouteOutcome::Dropped(DropReason::UnknownEvent)
            }
        }
    }
}

fn login_request_id(envelope: &Envelope) -> Option<RequestId> {
    if let Some(request_id) = &envelope.request_id {
        return Some(request_id.clone());
    }
    envelope
        .payload::<LoginRequest>()
        .ok()
        .and_then(|request| request.request_id)
}
