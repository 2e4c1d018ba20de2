use anyhow::{bail, Context as _, Result};
use frameport_core::catalog::PluginCategory;
use frameport_core::host::{HostRegistry, HostTelemetrySnapshot};
use frameport_core::protocol::ActivityContext;
use frameport_core::settings::{load_settings, save_settings, settings_path, HostSettings};
use frameport_core::surface::{Bounds, ProcessSurfaceConfig, ProcessSurfaceFactory};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "init" => cmd_init(args.collect()),
        "list" => cmd_list(args.collect()),
        "run" => cmd_run(args.collect()),
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown frameport-host command: {other}");
        }
    }
}

fn print_help() {
    eprintln!(
        r#"frameport-host

Commands:
  init   Write a default host.json into the config directory
  list   List registered plugins, optionally filtered by category
  run    Activate one plugin in a worker process and pump its messages

Examples:
  cargo run -p frameport-host -- init --config ./.frameport
  cargo run -p frameport-host -- list --category issue_details
  cargo run -p frameport-host -- run --plugin p1 --context '{{"issueId":42}}' --seconds 3

Environment:
  FRAMEPORT_CONFIG             config directory (default ~/.config/frameport)
  FRAMEPORT_PLUGIN_WORKER_BIN  plugin worker executable
  RUST_LOG                     log filter (default info)
"#
    );
}

#[derive(Debug, Default)]
struct CommonArgs {
    config_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn take(&mut self, arg: &str, args: &mut impl Iterator<Item = String>) -> Result<bool> {
        if arg == "--config" {
            let value = args.next().context("--config requires a value")?;
            self.config_dir = Some(PathBuf::from(value));
            return Ok(true);
        }
        Ok(false)
    }

    fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(default_config_dir)
    }
}

fn cmd_init(args: Vec<String>) -> Result<()> {
    let mut common = CommonArgs::default();
    let mut force = false;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if common.take(&arg, &mut it)? {
            continue;
        }
        match arg.as_str() {
            "--force" => force = true,
            other => bail!("unknown init argument: {other}"),
        }
    }

    let dir = common.config_dir();
    let path = settings_path(&dir);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    save_settings(&dir, &HostSettings::default())?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_list(args: Vec<String>) -> Result<()> {
    let mut common = CommonArgs::default();
    let mut category = None;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if common.take(&arg, &mut it)? {
            continue;
        }
        match arg.as_str() {
            "--category" => {
                let value = it.next().context("--category requires a value")?;
                category = Some(PluginCategory::from_tag(&value));
            }
            other => bail!("unknown list argument: {other}"),
        }
    }

    let settings = load_settings(&common.config_dir())?;
    let registry = build_registry(&settings, ProcessSurfaceConfig::default())?;
    let descriptors = match &category {
        Some(category) => registry.list_by_category(category),
        None => registry.descriptors().collect(),
    };

    for descriptor in descriptors {
        println!(
            "{}",
            json!({
                "id": descriptor.id,
                "name": descriptor.name,
                "author": descriptor.author,
                "category": descriptor.category.as_tag(),
                "url": descriptor.source_url,
            })
        );
    }
    Ok(())
}

#[derive(Debug)]
struct RunArgs {
    plugin_id: String,
    context: ActivityContext,
    bounds: Bounds,
    duration: Duration,
    worker: Option<String>,
}

fn parse_run_args(args: Vec<String>, common: &mut CommonArgs) -> Result<RunArgs> {
    let mut plugin_id = None;
    let mut context = ActivityContext::new();
    let mut bounds = Bounds::new(0, 0, 800, 600);
    let mut duration = Duration::from_secs(2);
    let mut worker = None;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if common.take(&arg, &mut it)? {
            continue;
        }
        match arg.as_str() {
            "--plugin" => plugin_id = Some(it.next().context("--plugin requires a value")?),
            "--context" => {
                let raw = it.next().context("--context requires a value")?;
                context = serde_json::from_str(&raw)
                    .with_context(|| format!("--context is not a JSON object: {raw}"))?;
            }
            "--bounds" => {
                let raw = it.next().context("--bounds requires a value")?;
                bounds = parse_bounds(&raw)?;
            }
            "--seconds" => {
                let raw = it.next().context("--seconds requires a value")?;
                let seconds: u64 = raw
                    .parse()
                    .with_context(|| format!("--seconds is not a number: {raw}"))?;
                duration = Duration::from_secs(seconds.max(1));
            }
            "--worker" => worker = Some(it.next().context("--worker requires a value")?),
            other => bail!("unknown run argument: {other}"),
        }
    }

    Ok(RunArgs {
        plugin_id: plugin_id.context("--plugin is required")?,
        context,
        bounds,
        duration,
        worker,
    })
}

fn parse_bounds(raw: &str) -> Result<Bounds> {
    let parts = raw
        .split(',')
        .map(|part| part.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("--bounds must be top,left,width,height: {raw}"))?;
    let [top, left, width, height] = parts.as_slice() else {
        bail!("--bounds must have four values: {raw}");
    };
    Ok(Bounds::new(*top, *left, *width, *height))
}

fn cmd_run(args: Vec<String>) -> Result<()> {
    let mut common = CommonArgs::default();
    let args = parse_run_args(args, &mut common)?;
    let settings = load_settings(&common.config_dir())?;

    let mut worker = ProcessSurfaceConfig::default();
    if let Some(command) = &args.worker {
        worker.command = command.clone();
    }
    worker.inherit_stderr = true;

    let mut registry = build_registry(&settings, worker)?;
    if registry.descriptor(&args.plugin_id).is_none() {
        bail!("plugin `{}` is not in the catalog", args.plugin_id);
    }

    registry
        .activate(&args.plugin_id, args.context.clone(), args.bounds)
        .with_context(|| format!("activate plugin {}", args.plugin_id))?;
    pump_for(&mut registry, args.duration);

    registry.deactivate(&args.plugin_id);
    pump_for(&mut registry, PUMP_INTERVAL * 4);

    println!("{}", telemetry_json(&registry.telemetry_snapshot()));
    Ok(())
}

fn build_registry(settings: &HostSettings, worker: ProcessSurfaceConfig) -> Result<HostRegistry> {
    let config = settings.to_host_config()?;
    let auth = settings.build_auth_backend()?;
    let mut registry = HostRegistry::new(
        config,
        Box::new(ProcessSurfaceFactory::new(worker)),
        auth,
    );
    let loaded = registry.load_catalog(settings.build_catalog().as_ref());
    info!(plugins = loaded, "catalog loaded");
    Ok(registry)
}

fn pump_for(registry: &mut HostRegistry, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        registry.pump(PUMP_INTERVAL);
    }
}

fn telemetry_json(snapshot: &HostTelemetrySnapshot) -> serde_json::Value {
    json!({
        "surfaces_created": snapshot.surfaces_created,
        "notifications_sent": snapshot.notifications_sent,
        "logins_served": snapshot.logins_served,
        "logins_failed": snapshot.logins_failed,
        "send_failures": snapshot.send_failures,
        "dropped_foreign_sender": snapshot.dropped_foreign_sender,
        "dropped_decode": snapshot.dropped_decode,
        "dropped_unknown_event": snapshot.dropped_unknown_event,
        "dropped_other": snapshot.dropped_other,
    })
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = std::env::var("FRAMEPORT_CONFIG") {
        let path = path.trim();
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if cfg!(target_os = "windows") {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let appdata = appdata.trim();
            if !appdata.is_empty() {
                return Path::new(appdata).join("Frameport");
            }
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let home = home.trim();
        if !home.is_empty() {
            return Path::new(home).join(".config").join("frameport");
        }
    }

    PathBuf::from(".frameport")
}
