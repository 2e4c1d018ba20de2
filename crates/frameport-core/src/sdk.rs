//! Plugin-side half of the protocol: outbound requests with correlated
//! responses, and subscriptions to host notifications.

use crate::listeners::{Listener, ListenerTable};
use crate::origin::{parse_url, query_param, Origin, OriginError, HOST_ORIGIN_PARAM};
use crate::pending::{DuplicateRequestId, PendingRequests};
use crate::protocol::{
    ActivityContext, Envelope, HostNotification, LoginReply, NotificationKind, OperatorIdentity,
    ProtocolError, RequestId,
};
use crate::transport::{InboundMessage, MessageChannel, TransportError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("plugin load url is invalid: {0}")]
    InvalidLoadUrl(#[source] OriginError),
    #[error("plugin load url has no `hostOrigin` parameter")]
    MissingHostOrigin,
    #[error("`hostOrigin` parameter `{value}` is not a valid origin")]
    InvalidHostOrigin {
        value: String,
        #[source]
        source: OriginError,
    },
    #[error("unknown api `{0}`")]
    UnknownApi(String),
    #[error("options do not match api `{api}`")]
    OptionsMismatch { api: &'static str },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    DuplicateRequest(#[from] DuplicateRequestId),
}

/// Successful login response handed to the plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct LoginGrant {
    pub token: String,
    pub user: Option<OperatorIdentity>,
    pub context: ActivityContext,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoginFailure {
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("login response carries no token")]
    MissingToken,
    #[error("login response is malformed: {0}")]
    Malformed(ProtocolError),
}

pub type LoginResult = Result<LoginGrant, LoginFailure>;

/// Entry points reachable through [`PluginSdk::invoke`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiName {
    Login,
    AddEventListener,
}

impl ApiName {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::AddEventListener => "addEventListener",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        match input.trim() {
            "login" => Some(Self::Login),
            "addEventListener" => Some(Self::AddEventListener),
            _ => None,
        }
    }
}

pub enum ApiOptions {
    Login {
        on_success: Box<dyn FnOnce(LoginGrant)>,
        on_failure: Box<dyn FnOnce(LoginFailure)>,
    },
    AddEventListener {
        event: String,
        listener: Listener,
    },
}

impl ApiOptions {
    pub fn login(
        on_success: impl FnOnce(LoginGrant) + 'static,
        on_failure: impl FnOnce(LoginFailure) + 'static,
    ) -> Self {
        Self::Login {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }

    pub fn add_event_listener(
        event: impl Into<String>,
        listener: impl FnMut(&HostNotification) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self::AddEventListener {
            event: event.into(),
            listener: Box::new(listener),
        }
    }
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    ForeignSender,
    Decode,
    /// Matched a pending request, whose callback has now run.
    Resolved,
    /// Carried a request id nothing is waiting on.
    Unmatched,
    /// Notification delivered; the count is listeners that completed.
    Notified(usize),
    Unsupported,
}

pub struct PluginSdk {
    host_origin: Origin,
    channel: Box<dyn MessageChannel>,
    pending: PendingRequests<Envelope>,
    listeners: ListenerTable,
    request_sequence: u64,
}

impl PluginSdk {
    /// Reads the trusted host origin from the plugin's own load URL.
    ///
    /// This is the only fatal SDK failure: without it no inbound message can
    /// be trusted.
    pub fn from_load_url(
        load_url: &str,
        channel: Box<dyn MessageChannel>,
    ) -> Result<Self, SdkError> {
        let url = parse_url(load_url).map_err(SdkError::InvalidLoadUrl)?;
        let raw = query_param(&url, HOST_ORIGIN_PARAM)
            .filter(|value| !value.trim().is_empty())
            .ok_or(SdkError::MissingHostOrigin)?;
        let host_origin = Origin::from_url(&raw)
            .map_err(|source| SdkError::InvalidHostOrigin { value: raw, source })?;

        debug!(host_origin = %host_origin, "plugin sdk initialized");
        Ok(Self {
            host_origin,
            channel,
            pending: PendingRequests::new(),
            listeners: ListenerTable::new(),
            request_sequence: 0,
        })
    }

    pub fn host_origin(&self) -> &Origin {
        &self.host_origin
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Asks the host for a session token. Exactly one of the two callbacks
    /// runs, once, when the matching response arrives.
    pub fn login(
        &mut self,
        on_success: impl FnOnce(LoginGrant) + 'static,
        on_failure: impl FnOnce(LoginFailure) + 'static,
    ) -> Result<RequestId, SdkError> {
        let request_id = self.next_request_id("login");
        self.pending
            .register(request_id.clone(), move |envelope: Envelope| {
                match login_result(&envelope) {
                    Ok(grant) => on_success(grant),
                    Err(failure) => on_failure(failure),
                }
            })?;

        if let Err(err) = self.send(&Envelope::login_request(request_id.clone())) {
            self.pending.forget(&request_id);
            return Err(err);
        }
        debug!(request_id = %request_id, "login requested");
        Ok(request_id)
    }

    /// Same exchange as [`PluginSdk::login`], delivered through a receiver.
    pub fn login_receiver(&mut self) -> Result<mpsc::Receiver<LoginResult>, SdkError> {
        let (tx, rx) = mpsc::channel();
        let failure_tx = tx.clone();
        self.login(
            move |grant| {
                let _ = tx.send(Ok(grant));
            },
            move |failure| {
                let _ = failure_tx.send(Err(failure));
            },
        )?;
        Ok(rx)
    }

    /// Appends a listener for a host notification. Event names outside the
    /// notification set are rejected and `false` is returned.
    pub fn subscribe(
        &mut self,
        event: &str,
        listener: impl FnMut(&HostNotification) -> anyhow::Result<()> + 'static,
    ) -> bool {
        self.subscribe_boxed(event, Box::new(listener))
    }

    fn subscribe_boxed(&mut self, event: &str, listener: Listener) -> bool {
        let Some(kind) = NotificationKind::from_tag(event) else {
            warn!(event = %event, "ignoring subscription to unsupported event");
            return false;
        };
        self.listeners.subscribe(kind, listener);
        true
    }

    /// Single named entry point over the SDK surface.
    pub fn invoke(&mut self, api: &str, options: ApiOptions) -> Result<(), SdkError> {
        let name = ApiName::from_tag(api).ok_or_else(|| SdkError::UnknownApi(api.to_string()))?;
        match (name, options) {
            (
                ApiName::Login,
                ApiOptions::Login {
                    on_success,
                    on_failure,
                },
            ) => self.login(on_success, on_failure).map(|_| ()),
            (ApiName::AddEventListener, ApiOptions::AddEventListener { event, listener }) => {
                self.subscribe_boxed(&event, listener);
                Ok(())
            }
            (name, _) => Err(SdkError::OptionsMismatch {
                api: name.as_tag(),
            }),
        }
    }

    pub fn handle_inbound(&mut self, message: &InboundMessage) -> InboundOutcome {
        if message.sender != self.host_origin {
            trace!(sender = %message.sender, "ignoring message from foreign sender");
            return InboundOutcome::ForeignSender;
        }

        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping undecodable host message");
                return InboundOutcome::Decode;
            }
        };

        if let Some(request_id) = envelope.request_id.clone() {
            return self.resolve(&request_id, envelope);
        }

        match HostNotification::from_envelope(&envelope) {
            Ok(notification) => {
                let completed = self.listeners.dispatch(&notification);
                debug!(event = %envelope.name, listeners = completed, "host notification dispatched");
                InboundOutcome::Notified(completed)
            }
            Err(ProtocolError::Payload { event, reason }) => {
                warn!(event = %event, reason = %reason, "dropping malformed host notification");
                InboundOutcome::Decode
            }
            Err(err) => {
                warn!(error = %err, "dropping unsupported host notification");
                InboundOutcome::Unsupported
            }
        }
    }

    /// Drains the channel, waiting up to `timeout` for each message.
    /// Returns the number of messages handled.
    pub fn pump(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let mut handled = 0;
        while let Some(message) = self.channel.receive(timeout)? {
            self.handle_inbound(&message);
            handled += 1;
        }
        Ok(handled)
    }

    fn resolve(&mut self, request_id: &RequestId, envelope: Envelope) -> InboundOutcome {
        if !self.pending.contains(request_id) {
            debug!(request_id = %request_id, "dropping response with no pending request");
            return InboundOutcome::Unmatched;
        }
        let pending = &mut self.pending;
        match catch_unwind(AssertUnwindSafe(|| pending.resolve(request_id, envelope))) {
            Ok(_) => InboundOutcome::Resolved,
            Err(_) => {
                error!(request_id = %request_id, "response callback panicked");
                InboundOutcome::Resolved
            }
        }
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), SdkError> {
        let payload = envelope.encode()?;
        self.channel.post(&self.host_origin, &payload)?;
        Ok(())
    }

    fn next_request_id(&mut self, prefix: &str) -> RequestId {
        loop {
            self.request_sequence = self.request_sequence.saturating_add(1);
            let id = RequestId::new(format!("{prefix}:{}", self.request_sequence));
            if !self.pending.contains(&id) {
                return id;
            }
        }
    }
}

impl Drop for PluginSdk {
    fn drop(&mut self) {
        self.channel.terminate();
    }
}

fn login_result(envelope: &Envelope) -> LoginResult {
    let reply: LoginReply = envelope.payload().map_err(LoginFailure::Malformed)?;
    if let Some(detail) = reply.error {
        return Err(LoginFailure::Rejected(detail));
    }
    let token = reply
        .token
        .filter(|token| !token.trim().is_empty())
        .ok_or(LoginFailure::MissingToken)?;
    Ok(LoginGrant {
        token,
        user: reply.user,
        context: reply.context.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, MemoryChannel};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    const HOST: &str = "https://host.example";
    const PLUGIN: &str = "https://ext.example";

    fn origin(url: &str) -> Origin {
        Origin::from_url(url).expect("origin")
    }

    fn sdk_pair() -> (PluginSdk, MemoryChannel) {
        let (host_end, plugin_end) = memory_pair(origin(HOST), origin(PLUGIN));
        let sdk = PluginSdk::from_load_url(
            "https://ext.example/p1/index.html?hostOrigin=https%3A%2F%2Fhost.example",
            Box::new(plugin_end),
        )
        .expect("sdk");
        (sdk, host_end)
    }

    fn next_request(host_end: &mut MemoryChannel) -> Envelope {
        let message = host_end
            .receive(Duration::ZERO)
            .expect("receive")
            .expect("request posted");
        assert_eq!(message.sender, origin(PLUGIN));
        Envelope::decode(&message.payload).expect("decode request")
    }

    fn reply(host_end: &mut MemoryChannel, request_id: RequestId, reply: &LoginReply) {
        let envelope = Envelope::login_reply(request_id, reply).expect("reply envelope");
        host_end
            .post(&origin(PLUGIN), &envelope.encode().expect("encode"))
            .expect("post");
    }

    type Calls = Rc<RefCell<Vec<String>>>;

    fn login_recording(sdk: &mut PluginSdk, calls: &Calls) -> RequestId {
        let on_success = Rc::clone(calls);
        let on_failure = Rc::clone(calls);
        sdk.login(
            move |grant| on_success.borrow_mut().push(format!("ok:{}", grant.token)),
            move |failure| on_failure.borrow_mut().push(format!("err:{failure}")),
        )
        .expect("login")
    }

    #[test]
    fn missing_host_origin_is_fatal() {
        let (_, plugin_end) = memory_pair(origin(HOST), origin(PLUGIN));
        let err = PluginSdk::from_load_url("https://ext.example/p1", Box::new(plugin_end))
            .err()
            .expect("missing host origin");
        assert!(matches!(err, SdkError::MissingHostOrigin));

        let (_, plugin_end) = memory_pair(origin(HOST), origin(PLUGIN));
        let err = PluginSdk::from_load_url(
            "https://ext.example/p1?hostOrigin=not-a-url",
            Box::new(plugin_end),
        )
        .err()
        .expect("invalid host origin");
        assert!(matches!(err, SdkError::InvalidHostOrigin { .. }));
    }

    #[test]
    fn login_success_invokes_only_on_success() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        let request_id = login_recording(&mut sdk, &calls);
        assert_eq!(request_id, RequestId::new("login:1"));

        let request = next_request(&mut host_end);
        assert_eq!(request.request_id, Some(request_id.clone()));
        assert_eq!(sdk.pending_count(), 1);

        let user = OperatorIdentity {
            email: "ops@host.example".to_string(),
            name: "Operator".to_string(),
            role: "admin".to_string(),
        };
        reply(
            &mut host_end,
            request_id,
            &LoginReply::success("T".to_string(), user, ActivityContext::new()),
        );
        assert_eq!(sdk.pump(Duration::ZERO).expect("pump"), 1);

        assert_eq!(*calls.borrow(), vec!["ok:T".to_string()]);
        assert_eq!(sdk.pending_count(), 0);
    }

    #[test]
    fn login_failure_invokes_only_on_failure_and_clears_entry() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        let request_id = login_recording(&mut sdk, &calls);

        reply(
            &mut host_end,
            request_id,
            &LoginReply::failure("backend unavailable"),
        );
        sdk.pump(Duration::ZERO).expect("pump");

        assert_eq!(
            *calls.borrow(),
            vec!["err:login rejected: backend unavailable".to_string()]
        );
        assert_eq!(sdk.pending_count(), 0);
    }

    #[test]
    fn reply_without_token_is_a_failure() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        let request_id = login_recording(&mut sdk, &calls);

        reply(&mut host_end, request_id, &LoginReply::default());
        sdk.pump(Duration::ZERO).expect("pump");

        assert_eq!(
            *calls.borrow(),
            vec!["err:login response carries no token".to_string()]
        );
    }

    #[test]
    fn duplicate_and_late_responses_are_ignored() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        let request_id = login_recording(&mut sdk, &calls);

        let grant = LoginReply {
            token: Some("T".to_string()),
            ..LoginReply::default()
        };
        reply(&mut host_end, request_id.clone(), &grant);
        reply(&mut host_end, request_id, &grant);
        reply(&mut host_end, RequestId::new("login:99"), &grant);

        let mut outcomes = Vec::new();
        while let Some(message) = sdk.channel.receive(Duration::ZERO).expect("receive") {
            outcomes.push(sdk.handle_inbound(&message));
        }

        assert_eq!(
            outcomes,
            vec![
                InboundOutcome::Resolved,
                InboundOutcome::Unmatched,
                InboundOutcome::Unmatched
            ]
        );
        assert_eq!(*calls.borrow(), vec!["ok:T".to_string()]);
    }

    #[test]
    fn concurrent_logins_use_distinct_ids_and_resolve_independently() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        let first = login_recording(&mut sdk, &calls);
        let second = login_recording(&mut sdk, &calls);
        assert_ne!(first, second);
        assert_eq!(sdk.pending_count(), 2);

        reply(
            &mut host_end,
            second,
            &LoginReply {
                token: Some("second".to_string()),
                ..LoginReply::default()
            },
        );
        reply(&mut host_end, first, &LoginReply::failure("nope"));
        sdk.pump(Duration::ZERO).expect("pump");

        assert_eq!(
            *calls.borrow(),
            vec!["ok:second".to_string(), "err:login rejected: nope".to_string()]
        );
    }

    #[test]
    fn login_receiver_yields_the_grant() {
        let (mut sdk, mut host_end) = sdk_pair();
        let rx = sdk.login_receiver().expect("login");
        let request = next_request(&mut host_end);
        let mut context = ActivityContext::new();
        context.insert("issueId".to_string(), json!(42));
        reply(
            &mut host_end,
            request.request_id.expect("request id"),
            &LoginReply {
                token: Some("T".to_string()),
                user: None,
                context: Some(context.clone()),
                error: None,
            },
        );
        sdk.pump(Duration::ZERO).expect("pump");

        let grant = rx.try_recv().expect("login result").expect("grant");
        assert_eq!(grant.token, "T");
        assert_eq!(grant.context, context);
    }

    #[test]
    fn notifications_reach_subscribers_in_order() {
        let (mut sdk, mut host_end) = sdk_pair();
        let calls = Calls::default();
        for name in ["first", "second"] {
            let sink = Rc::clone(&calls);
            assert!(sdk.subscribe("plugin-shown", move |notification: &HostNotification| {
                if let HostNotification::Shown { context } = notification {
                    sink.borrow_mut().push(format!("{name}:{}", context["issueId"]));
                }
                Ok(())
            }));
        }

        let shown = HostNotification::Shown {
            context: serde_json::from_value(json!({"issueId": 42})).expect("context"),
        };
        host_end
            .post(
                &origin(PLUGIN),
                &shown.to_envelope().expect("envelope").encode().expect("encode"),
            )
            .expect("post");
        sdk.pump(Duration::ZERO).expect("pump");

        assert_eq!(
            *calls.borrow(),
            vec!["first:42".to_string(), "second:42".to_string()]
        );
    }

    #[test]
    fn unsupported_subscription_is_rejected() {
        let (mut sdk, _host_end) = sdk_pair();
        assert!(!sdk.subscribe("plugin-resized", |_: &HostNotification| Ok(())));
        assert!(!sdk.subscribe("login", |_: &HostNotification| Ok(())));
        assert!(sdk.subscribe("plugin-hidden", |_: &HostNotification| Ok(())));
    }

    #[test]
    fn foreign_and_malformed_messages_are_dropped() {
        let (mut sdk, _host_end) = sdk_pair();
        let calls = Calls::default();
        let sink = Rc::clone(&calls);
        sdk.subscribe("plugin-hidden", move |_: &HostNotification| {
            sink.borrow_mut().push("hidden".to_string());
            Ok(())
        });

        let forged = InboundMessage::new(
            origin("https://evil.example"),
            r#"{"name":"plugin-hidden"}"#,
        );
        assert_eq!(sdk.handle_inbound(&forged), InboundOutcome::ForeignSender);

        let garbage = InboundMessage::new(origin(HOST), "not json");
        assert_eq!(sdk.handle_inbound(&garbage), InboundOutcome::Decode);

        let unknown = InboundMessage::new(origin(HOST), r#"{"name":"plugin-resized"}"#);
        assert_eq!(sdk.handle_inbound(&unknown), InboundOutcome::Unsupported);

        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn invoke_routes_known_apis_and_rejects_others() {
        let (mut sdk, mut host_end) = sdk_pair();
        sdk.invoke(
            "addEventListener",
            ApiOptions::add_event_listener("plugin-hidden", |_: &HostNotification| Ok(())),
        )
        .expect("add listener");
        assert_eq!(sdk.listeners.listener_count(NotificationKind::PluginHidden), 1);

        sdk.invoke("login", ApiOptions::login(|_| {}, |_| {}))
            .expect("login");
        assert_eq!(next_request(&mut host_end).name.as_tag(), "login");

        let err = sdk
            .invoke("openDialog", ApiOptions::login(|_| {}, |_| {}))
            .expect_err("unknown api");
        assert!(matches!(err, SdkError::UnknownApi(ref name) if name == "openDialog"));

        let err = sdk
            .invoke(
                "login",
                ApiOptions::add_event_listener("plugin-shown", |_: &HostNotification| Ok(())),
            )
            .expect_err("mismatched options");
        assert!(matches!(err, SdkError::OptionsMismatch { api: "login" }));
    }

    #[test]
    fn panicking_response_callback_is_contained() {
        let (mut sdk, mut host_end) = sdk_pair();
        let request_id = sdk
            .login(|_| panic!("plugin callback failed"), |_| {})
            .expect("login");
        reply(
            &mut host_end,
            request_id,
            &LoginReply {
                token: Some("T".to_string()),
                ..LoginReply::default()
            },
        );

        assert_eq!(sdk.pump(Duration::ZERO).expect("pump"), 1);
        assert_eq!(sdk.pending_count(), 0);
    }
}
