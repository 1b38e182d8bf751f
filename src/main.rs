//! partjob - Main entry point
//!
//! Scans devices, turns plan files into job lists and runs them on the
//! job queue's worker thread, printing progress as it goes.

use anyhow::{bail, Context, Result};
use partjob::bootloader::{self, BootSelection};
use partjob::cli::{Cli, Commands};
use partjob::config::RunConfig;
use partjob::engine::{build_plan, Plan, PlanFile};
use partjob::model::DeviceModel;
use partjob::process_guard::{self, ProcessGuard, SignalRouter};
use partjob::queue::{JobStatus, QueueEvent, QueueReport};
use partjob::storage::{MemoryStorage, Storage, SystemStorage};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the subscriber; `RUST_LOG` overrides the `info` default.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();
    info!("partjob starting up");

    // A first signal stops the queue after the running job; a second kills the tools
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            1
        }
    };
    drop(guard);
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = RunConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load run configuration")?;

    match cli.command {
        Commands::Scan { json } => {
            let model = scan(&SystemStorage::new(config.timeouts))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&model)?);
            } else {
                print_model(&model);
            }
            Ok(0)
        }
        Commands::Plan { plan } => {
            let model = scan(&SystemStorage::new(config.timeouts))?;
            let plan = load_plan(&plan, &model)?;
            println!("{}", plan.summary());
            Ok(0)
        }
        Commands::Run { plan, yes } => run_plan(&plan, yes, cli.dry_run, config),
        Commands::Bootloader {
            firmware,
            device,
            select,
            json,
        } => {
            let model = scan(&SystemStorage::new(config.timeouts))?;
            let firmware = firmware.resolve();
            let selection = select
                .map(|s| s.parse::<BootSelection>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let target = bootloader::resolve(&model, firmware, &device, selection.as_ref())
                .map_err(|e| anyhow::anyhow!("{}\n{}", e.title(), e.details()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&target)?);
            } else {
                println!("Firmware: {}", firmware);
                println!("Boot loader target: {}", target.label(&model));
                println!("Options:");
                for option in bootloader::options(&model, firmware, &device) {
                    println!("  - {}", option.label(&model));
                }
            }
            Ok(0)
        }
        Commands::DefaultConfig { output } => {
            RunConfig::default().save_to_file(&output)?;
            println!("✓ Default configuration written to {}", output.display());
            Ok(0)
        }
    }
}

fn scan(storage: &dyn Storage) -> Result<DeviceModel> {
    DeviceModel::scan(storage).context("Failed to scan storage devices")
}

fn load_plan(path: &Path, model: &DeviceModel) -> Result<Plan> {
    info!("Loading plan from {}", path.display());
    let file = PlanFile::load(path)?;
    let firmware = file.firmware.resolve();
    Ok(build_plan(&file, model, firmware)?)
}

fn run_plan(path: &Path, yes: bool, dry_run: bool, config: RunConfig) -> Result<i32> {
    let system = SystemStorage::new(config.timeouts);
    let model = scan(&system)?;
    let plan = load_plan(path, &model)?;
    println!("{}\n", plan.summary());

    let mut queue = plan.into_queue();
    let destructive = queue.destructive_count();
    if destructive > 0 {
        if !yes {
            bail!(
                "The plan contains {} destructive job(s) that cannot be undone; pass --yes to run it",
                destructive
            );
        }
        queue.confirm_destructive();
    }

    let storage: Arc<dyn Storage> = if dry_run {
        info!("[DRY RUN] Running against an in-memory copy of the scanned devices");
        Arc::new(MemoryStorage::from_devices(model.devices()))
    } else {
        if config.rescan_before_run {
            let current = scan(&system)?;
            if current != model {
                bail!("Devices changed while the plan was being reviewed; rebuild the plan");
            }
        }
        Arc::new(system)
    };

    let handle = queue.spawn(storage, config, model)?;
    let report = {
        let _registration = SignalRouter::global().register(handle.cancel_token());
        for event in handle.events() {
            print_event(&event);
        }
        handle.join()?
    };
    print_report(&report);

    if report.do_not_proceed {
        error!("Storage integrity cannot be guaranteed; do not continue the installation");
        return Ok(2);
    }
    Ok(if report.succeeded() { 0 } else { 1 })
}

fn print_model(model: &DeviceModel) {
    for dev in model.devices() {
        println!(
            "{} {} MB, sector {} B, {} {}",
            dev.path.display(),
            dev.size_mb(),
            dev.sector_size,
            dev.label,
            dev.model
        );
        let Some(table) = &dev.table else {
            continue;
        };
        for p in table.partitions() {
            println!(
                "  {:>3}  {:>12} .. {:<12} {:>8} MB  {:<9} {:<8} {}",
                p.number,
                p.start,
                p.end,
                p.size_mb(),
                p.role,
                p.fs,
                p.mount_point
                    .as_deref()
                    .map(|m| m.display().to_string())
                    .unwrap_or_default()
            );
        }
        for free in table.free_space() {
            println!(
                "       {:>12} .. {:<12} {:>8} MB  free{}",
                free.start,
                free.end,
                free.size() / partjob::model::MIB,
                if free.inside_extended { " (logical)" } else { "" }
            );
        }
    }
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::Progress {
            index,
            total,
            description,
        } => println!("[{}/{}] {}", index + 1, total, description),
        QueueEvent::Status { message, .. } => println!("      {}", message),
        QueueEvent::JobFinished { status, .. } => match status {
            JobStatus::Succeeded => println!("      ✓ done"),
            JobStatus::Failed { title, .. } => println!("      ✗ {}", title),
            JobStatus::Pending | JobStatus::NotRun => {}
        },
        QueueEvent::Finished => println!("\n✓ All jobs completed successfully"),
        QueueEvent::Failed {
            title,
            message,
            fatal,
        } => {
            eprintln!("\n✗ {}", title);
            if !message.is_empty() {
                eprintln!("{}", message);
            }
            if *fatal {
                eprintln!("\nThe disk may be left in an inconsistent state.");
            }
        }
    }
}

fn print_report(report: &QueueReport) {
    let not_run = report.not_run();
    if !not_run.is_empty() {
        println!("\nNot run:");
        for summary in not_run {
            println!("  - {}", summary);
        }
    }
    if report.model_stale {
        warn!("The tracked device layout no longer matches the disks; rescan before planning again");
    }
}
