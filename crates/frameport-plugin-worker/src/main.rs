use anyhow::{Context as _, Result};
use frameport_core::origin::Origin;
use frameport_core::protocol::HostNotification;
use frameport_core::sdk::PluginSdk;
use frameport_core::surface::{PLUGIN_ID_ENV, PLUGIN_URL_ENV};
use frameport_core::transport::{LineChannel, TransportError};
use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    // stdout carries protocol frames, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let load_url = std::env::var(PLUGIN_URL_ENV)
        .with_context(|| format!("{PLUGIN_URL_ENV} is not set"))?;
    let plugin_id = std::env::var(PLUGIN_ID_ENV).unwrap_or_default();
    let login_on_show = std::env::var("FRAMEPORT_PLUGIN_WORKER_LOGIN_ON_SHOW")
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(true);

    let local = Origin::from_url(&load_url).context("derive plugin origin from load url")?;
    let channel = LineChannel::new(local, io::stdin(), io::stdout());
    let mut sdk =
        PluginSdk::from_load_url(&load_url, Box::new(channel)).context("initialize plugin sdk")?;
    info!(plugin_id = %plugin_id, host_origin = %sdk.host_origin(), "plugin worker started");

    let login_wanted = Rc::new(Cell::new(false));
    let shown_flag = Rc::clone(&login_wanted);
    sdk.subscribe("plugin-shown", move |notification: &HostNotification| {
        if let HostNotification::Shown { context } = notification {
            info!(context = %serde_json::Value::Object(context.clone()), "plugin shown");
        }
        if login_on_show {
            shown_flag.set(true);
        }
        Ok(())
    });
    sdk.subscribe("plugin-hidden", |_: &HostNotification| {
        info!("plugin hidden");
        Ok(())
    });

    loop {
        if login_wanted.replace(false) {
            sdk.login(
                |grant| info!(user = ?grant.user.map(|user| user.email), "login granted"),
                |failure| warn!(error = %failure, "login failed"),
            )
            .context("send login request")?;
        }

        match sdk.pump(POLL_INTERVAL) {
            Ok(_) => {}
            Err(TransportError::Disconnected) => {
                info!(pending = sdk.pending_count(), "host closed the channel");
                return Ok(());
            }
            Err(TransportError::InvalidFrame(reason)) => {
                warn!(reason = %reason, "skipping invalid frame from host");
            }
            Err(err) => return Err(err).context("receive from host"),
        }
    }
}
