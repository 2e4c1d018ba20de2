use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;

/// Arbitrary key/value payload describing what a plugin is being shown for.
pub type ActivityContext = Map<String, Value>;

/// Event-name tag of an envelope.
///
/// Tags outside the supported set decode to `Unknown` so a newer peer never
/// turns into a decode failure on this side.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Login,
    PluginShown,
    PluginHidden,
    Unknown(String),
}

impl EventKind {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Login => "login",
            Self::PluginShown => "plugin-shown",
            Self::PluginHidden => "plugin-hidden",
            Self::Unknown(tag) => tag.as_str(),
        }
    }

    pub fn from_tag(input: &str) -> Self {
        match input.trim() {
            "login" => Self::Login,
            "plugin-shown" => Self::PluginShown,
            "plugin-hidden" => Self::PluginHidden,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&raw))
    }
}

/// Host-originated one-way notification kinds a plugin may subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    PluginShown,
    PluginHidden,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 2] = [Self::PluginShown, Self::PluginHidden];

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::PluginShown => "plugin-shown",
            Self::PluginHidden => "plugin-hidden",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_tag() == input.trim())
    }
}

/// Correlation identifier linking a request to its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Older plugin builds send time-derived numeric ids.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("decode envelope failed: {0}")]
    Decode(String),
    #[error("encode envelope failed: {0}")]
    Encode(String),
    #[error("`{event}` payload does not match its schema: {reason}")]
    Payload { event: String, reason: String },
    #[error("`{0}` is not a host notification")]
    NotNotification(String),
}

/// Wire entity exchanged over a message channel.
///
/// `request_id` present means request/response, absent means notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(alias = "type")]
    pub name: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Envelope {
    pub fn new(name: EventKind, request_id: Option<RequestId>, data: Value) -> Self {
        Self {
            name,
            request_id,
            data,
            version: Some(PROTOCOL_VERSION),
        }
    }

    pub fn login_request(request_id: RequestId) -> Self {
        Self::new(
            EventKind::Login,
            Some(request_id),
            Value::Object(Map::new()),
        )
    }

    pub fn login_reply(request_id: RequestId, reply: &LoginReply) -> Result<Self, ProtocolError> {
        let data =
            serde_json::to_value(reply).map_err(|err| ProtocolError::Encode(err.to_string()))?;
        Ok(Self::new(EventKind::Login, Some(request_id), data))
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|err| ProtocolError::Decode(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    /// Envelopes without a version predate versioning and count as version 1.
    pub fn effective_version(&self) -> u32 {
        self.version.unwrap_or(1)
    }

    pub fn is_notification(&self) -> bool {
        self.request_id.is_none()
    }

    /// Deserializes `data` into the schema of this envelope's event kind.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = if self.data.is_null() {
            Value::Object(Map::new())
        } else {
            self.data.clone()
        };
        serde_json::from_value(data).map_err(|err| ProtocolError::Payload {
            event: self.name.as_tag().to_string(),
            reason: err.to_string(),
        })
    }
}

/// `data` of a plugin's login request. Some plugin builds put the
/// correlation id inside `data` instead of on the envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    pub email: String,
    pub name: String,
    pub role: String,
}

/// `data` of the host's login response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<OperatorIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ActivityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginReply {
    pub fn success(token: String, user: OperatorIdentity, context: ActivityContext) -> Self {
        Self {
            token: Some(token),
            user: Some(user),
            context: Some(context),
            error: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            error: Some(detail.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct VisibilityNotice {
    #[serde(default)]
    context: ActivityContext,
}

/// Host-originated notification as seen by plugin subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum HostNotification {
    Shown { context: ActivityContext },
    Hidden,
}

impl HostNotification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Shown { .. } => NotificationKind::PluginShown,
            Self::Hidden => NotificationKind::PluginHidden,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let (name, notice) = match self {
            Self::Shown { context } => (
                EventKind::PluginShown,
                VisibilityNotice {
                    context: context.clone(),
                },
            ),
            Self::Hidden => (EventKind::PluginHidden, VisibilityNotice::default()),
        };
        let data =
            serde_json::to_value(notice).map_err(|err| ProtocolError::Encode(err.to_string()))?;
        Ok(Envelope::new(name, None, data))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match &envelope.name {
            EventKind::PluginShown => {
                let notice: VisibilityNotice = envelope.payload()?;
                Ok(Self::Shown {
                    context: notice.context,
                })
            }
            EventKind::PluginHidden => Ok(Self::Hidden),
            EventKind::Login | EventKind::Unknown(_) => Err(ProtocolError::NotNotification(
                envelope.name.as_tag().to_string(),
            )),
        }
    }
}
