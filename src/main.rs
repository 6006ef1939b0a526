/*
 * This file is part of Coolant.
 *
 * Copyright (C) 2025 Coolant contributors
 *
 * Coolant is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Coolant is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Coolant. If not, see <https://www.gnu.org/licenses/>.
 */

//! Coolant daemon (coolantd)
//!
//! Discovers hwmon chips, restores the saved channel settings and runs the
//! poll tick and the job scheduler until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use cl_core::settings;
use cl_core::{DeviceId, HistoryRegistry};
use coolant::commander::DeviceCommander;
use coolant::controller::{ControllerConfig, ControllerContext, DeviceMap};
use coolant::dispatch::{JsonSettingsPersistence, LogNotifier};
use coolant::hwmon::{self, HwmonDispatcher, HwmonPoller};
use coolant::logger;
use coolant::poller::{composite_device, PollLoop, StatusPoller};
use coolant::scheduler::JobScheduler;
use coolant::sources::HistoryTemperatureSource;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Id of the composite device; real devices are numbered from 1
const COMPOSITE_ID: DeviceId = DeviceId(0);

/// Samples older than this many poll intervals don't drive profiles
const STALE_AFTER_TICKS: u32 = 5;

struct Args {
    log_level: String,
    event_log: Option<PathBuf>,
    hwmon_root: PathBuf,
}

fn print_help() {
    eprintln!("coolantd {} - cooling device control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    coolantd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -l, --log-level LEVEL   Log filter (default: $RUST_LOG or info)");
    eprintln!("    -e, --event-log [PATH]  Write JSON events (default {})", logger::DEFAULT_LOG_PATH);
    eprintln!("        --hwmon-root PATH   hwmon class directory (default {})", hwmon::HWMON_ROOT);
    eprintln!("    -v, --version           Print version");
    eprintln!("    -h, --help              Print this help");
}

/// `Ok(None)` means exit successfully (help/version printed)
fn parse_args() -> anyhow::Result<Option<Args>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut parsed = Args {
        log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        event_log: None,
        hwmon_root: PathBuf::from(hwmon::HWMON_ROOT),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("coolantd {}", VERSION);
                return Ok(None);
            }
            "-l" | "--log-level" => {
                i += 1;
                parsed.log_level = args.get(i).cloned().context("--log-level requires a value")?;
            }
            "-e" | "--event-log" => match args.get(i + 1).filter(|a| !a.starts_with('-')) {
                Some(path) => {
                    parsed.event_log = Some(PathBuf::from(path));
                    i += 1;
                }
                None => parsed.event_log = Some(PathBuf::from(logger::DEFAULT_LOG_PATH)),
            },
            "--hwmon-root" => {
                i += 1;
                parsed.hwmon_root = args.get(i).map(PathBuf::from).context("--hwmon-root requires a path")?;
            }
            other => {
                print_help();
                anyhow::bail!("unknown argument: {}", other);
            }
        }
        i += 1;
    }
    Ok(Some(parsed))
}

fn init_tracing(log_level: &str) -> bool {
    // JOURNAL_STREAM is set when systemd connected our stderr to the journal
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();
    false
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let journald = init_tracing(&args.log_level);
    info!("coolantd {} starting, logging to {}", VERSION, if journald { "systemd journal" } else { "stdout" });

    if let Some(path) = &args.event_log {
        match logger::init_logging(path) {
            Ok(()) => logger::log_event("startup", serde_json::json!({ "version": VERSION })),
            Err(e) => warn!("Event log {} unavailable: {}", path.display(), e),
        }
    }

    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root: hwmon channels will most likely be read-only");
    }

    // Settings
    let settings_path = settings::get_settings_path().context("locating settings")?;
    let app_settings = settings::load_settings_from(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    settings::validate_settings(&app_settings).context("invalid settings")?;
    let general = &app_settings.general;

    // Devices
    let chips = hwmon::discover(&args.hwmon_root, 1).context("hwmon discovery")?;
    let registry = Arc::new(HistoryRegistry::new(general.history_config()));
    let mut devices = DeviceMap::new();
    for chip in &chips {
        let device = chip.to_device();
        registry.register(&device);
        devices.insert(device.id, Arc::new(device));
    }
    let composite = composite_device(COMPOSITE_ID);
    registry.register(&composite);
    devices.insert(composite.id, Arc::new(composite));
    info!("{} devices ready", devices.len());

    // Scheduler and controllers
    let scheduler = Arc::new(JobScheduler::new(Handle::current()));
    scheduler.start();
    let config = ControllerConfig::from(general);
    let temperatures = HistoryTemperatureSource::new(registry.clone())
        .with_max_age(config.poll_interval * STALE_AFTER_TICKS);
    let ctx = ControllerContext {
        scheduler: scheduler.clone(),
        dispatcher: Arc::new(HwmonDispatcher::new(&chips)),
        temperatures: Arc::new(temperatures),
        notifier: Arc::new(LogNotifier),
        devices: Arc::new(devices),
        config,
    };

    let pollers: Vec<Arc<dyn StatusPoller>> = chips
        .iter()
        .cloned()
        .map(|chip| Arc::new(HwmonPoller::new(chip)) as Arc<dyn StatusPoller>)
        .collect();
    let mut poll = PollLoop::new(pollers, registry.clone(), config.poll_interval).with_composite(COMPOSITE_ID);
    // Profiles restored below need a first sample
    poll.tick().await;

    let commander = DeviceCommander::new(ctx, registry)
        .with_persistence(Arc::new(JsonSettingsPersistence::new(settings_path)));
    commander.restore(&app_settings.applied);

    // Signals
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let stop = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        let wake = wake.clone();
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            wake.notify_one();
            stop.notify_one();
        }) {
            warn!("Failed to set signal handler: {}", e);
        }
    }

    let poll_handle = tokio::spawn(poll.run(shutdown.clone(), wake));
    stop.notified().await;
    info!("Shutdown requested");

    if let Err(e) = poll_handle.await {
        error!("Poll loop ended abnormally: {}", e);
    }
    scheduler.shutdown().await;
    logger::log_event("shutdown", serde_json::json!({}));
    logger::shutdown_logging();
    info!("coolantd stopped");
    Ok(())
}
