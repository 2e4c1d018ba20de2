use frameport_core::auth::{AuthError, StaticAuthBackend};
use frameport_core::catalog::{PluginCategory, PluginRecord, StaticCatalog};
use frameport_core::host::{HostConfig, HostRegistry, SurfaceState};
use frameport_core::origin::Origin;
use frameport_core::protocol::{ActivityContext, HostNotification, OperatorIdentity};
use frameport_core::sdk::{ApiOptions, LoginFailure, PluginSdk};
use frameport_core::surface::{
    Bounds, MemorySurfaceFactory, ProcessSurfaceConfig, ProcessSurfaceFactory, SurfaceFactory,
    SurfaceLayout,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const HOST: &str = "https://host.example";

fn host_config() -> HostConfig {
    HostConfig {
        host_origin: Origin::from_url(HOST).expect("host origin"),
        operator: OperatorIdentity {
            email: "ops@host.example".to_string(),
            name: "Operator".to_string(),
            role: "admin".to_string(),
        },
        layout: SurfaceLayout::default(),
    }
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new(vec![PluginRecord {
        id: "p1".to_string(),
        name: "Time Tracker".to_string(),
        author: "Acme".to_string(),
        icon: String::new(),
        tooltip: String::new(),
        publish_id: "pub-1".to_string(),
        category: PluginCategory::IssueDetails,
        url: Some("https://ext.example/p1/index.html".to_string()),
    }])
}

fn registry(factory: Box<dyn SurfaceFactory>, auth: StaticAuthBackend) -> HostRegistry {
    let mut registry = HostRegistry::new(host_config(), factory, Box::new(auth));
    assert_eq!(registry.load_catalog(&catalog()), 1);
    registry
}

fn context(issue_id: i64) -> ActivityContext {
    let mut context = ActivityContext::new();
    context.insert("issueId".to_string(), issue_id.into());
    context
}

type Log = Rc<RefCell<Vec<String>>>;

fn plugin_sdk(factory: &MemorySurfaceFactory, log: &Log) -> PluginSdk {
    let endpoint = factory
        .take_plugin_endpoint("p1")
        .expect("plugin endpoint created");
    let mut sdk = PluginSdk::from_load_url(endpoint.load_url.as_str(), Box::new(endpoint.channel))
        .expect("sdk from load url");
    assert_eq!(sdk.host_origin().as_str(), HOST);

    for event in ["plugin-shown", "plugin-hidden"] {
        let sink = Rc::clone(log);
        sdk.invoke(
            "addEventListener",
            ApiOptions::add_event_listener(event, move |notification: &HostNotification| {
                let entry = match notification {
                    HostNotification::Shown { context } => format!("shown:{}", context["issueId"]),
                    HostNotification::Hidden => "hidden".to_string(),
                };
                sink.borrow_mut().push(entry);
                Ok(())
            }),
        )
        .expect("subscribe");
    }
    sdk
}

#[test]
fn in_memory_login_and_visibility_round_trip() {
    let factory = MemorySurfaceFactory::new();
    let mut registry = registry(
        Box::new(factory.clone()),
        StaticAuthBackend::granting("T"),
    );
    registry
        .activate("p1", context(42), Bounds::new(0, 0, 400, 300))
        .expect("activate");
    assert_eq!(registry.surface_state("p1"), SurfaceState::Shown);

    let log = Log::default();
    let mut sdk = plugin_sdk(&factory, &log);
    sdk.pump(Duration::ZERO).expect("pump shown");
    assert_eq!(*log.borrow(), vec!["shown:42".to_string()]);

    let grants = Rc::clone(&log);
    let failures = Rc::clone(&log);
    sdk.invoke(
        "login",
        ApiOptions::login(
            move |grant| {
                let user = grant.user.map(|user| user.email).unwrap_or_default();
                grants.borrow_mut().push(format!(
                    "token:{}:{}:{}",
                    grant.token, user, grant.context["issueId"]
                ));
            },
            move |failure| failures.borrow_mut().push(format!("failed:{failure}")),
        ),
    )
    .expect("login");
    assert_eq!(sdk.pending_count(), 1);

    assert_eq!(registry.pump(Duration::ZERO), 1);
    sdk.pump(Duration::ZERO).expect("pump login reply");
    assert_eq!(sdk.pending_count(), 0);

    registry.deactivate("p1");
    sdk.pump(Duration::ZERO).expect("pump hidden");

    assert_eq!(
        *log.borrow(),
        vec![
            "shown:42".to_string(),
            "token:T:ops@host.example:42".to_string(),
            "hidden".to_string(),
        ]
    );
    let telemetry = registry.telemetry_snapshot();
    assert_eq!(telemetry.logins_served, 1);
    assert_eq!(telemetry.notifications_sent, 2);
}

#[test]
fn in_memory_login_failure_reaches_on_failure() {
    let factory = MemorySurfaceFactory::new();
    let mut registry = registry(
        Box::new(factory.clone()),
        StaticAuthBackend::failing(AuthError::Rejected("plugin not installed".to_string())),
    );
    registry
        .activate("p1", context(7), Bounds::new(0, 0, 400, 300))
        .expect("activate");

    let log = Log::default();
    let mut sdk = plugin_sdk(&factory, &log);
    let rx = sdk.login_receiver().expect("login");
    registry.pump(Duration::ZERO);
    sdk.pump(Duration::ZERO).expect("pump");

    let result = rx.try_recv().expect("login result");
    assert!(matches!(result, Err(LoginFailure::Rejected(ref detail)) if detail.contains("plugin not installed")));
    assert_eq!(sdk.pending_count(), 0);
    assert_eq!(registry.telemetry_snapshot().logins_failed, 1);
}

#[test]
fn process_worker_logs_in_after_being_shown() {
    let mut config = ProcessSurfaceConfig::new(
        "cargo",
        vec![
            "run".to_string(),
            "-q".to_string(),
            "-p".to_string(),
            "frameport-plugin-worker".to_string(),
            "--".to_string(),
        ],
    );
    config.extra_env.insert(
        "FRAMEPORT_PLUGIN_WORKER_LOGIN_ON_SHOW".to_string(),
        "true".to_string(),
    );
    let mut registry = registry(
        Box::new(ProcessSurfaceFactory::new(config)),
        StaticAuthBackend::granting("T"),
    );

    registry
        .activate("p1", context(42), Bounds::new(0, 0, 400, 300))
        .expect("activate worker");

    let deadline = Instant::now() + Duration::from_secs(180);
    while registry.telemetry_snapshot().logins_served == 0 && Instant::now() < deadline {
        registry.pump(Duration::from_millis(100));
    }

    let telemetry = registry.telemetry_snapshot();
    assert_eq!(telemetry.surfaces_created, 1);
    assert_eq!(telemetry.logins_served, 1);
    assert_eq!(telemetry.dropped_foreign_sender, 0);
    assert_eq!(telemetry.dropped_decode, 0);
}
