mod reporter;
mod storage;
mod ui;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use toba_core::constants::BASEBAND_PARTITIONS;
use toba_core::registry::{DeviceLister, SessionRegistry, spawn_watcher};
use toba_core::tools::{PlatformTools, resolve_tools_dir};
use toba_core::{
    BackupManager, BackupStore, DeviceMode, DeviceSession, EngineConfig, EventSink, FanoutSink, FlashPlan, FlashPlanExecutor,
    GuardedTransport, ModeTransitionController, ScriptInterpreter, SimulatedDevice, Slot, TracingSink, Transport,
};

use crate::reporter::ConsoleReporter;
use crate::storage::{FsBackupStore, FsSources};

const DEFAULT_CONFIG: &str = "toba.toml";
const SIMULATED_SERIAL: &str = "SIM0001";

#[derive(Parser, Debug)]
#[command(version, about = "Scripted flashing for Android devices", long_about = None)]
struct Args {
    /// Engine configuration (TOML). Defaults to ./toba.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Device serial; prompts when several devices are connected.
    #[arg(short, long, global = true)]
    serial: Option<String>,

    /// Run against an in-memory device instead of real hardware.
    #[arg(long, global = true)]
    simulate: bool,

    /// Do not ask before destructive operations.
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices and their modes.
    Devices {
        /// Keep watching and print attach/detach/mode changes.
        #[arg(long)]
        watch: bool,
    },
    /// Validate a flash script without touching a device.
    Check {
        script: PathBuf,
        #[arg(long, default_value = ".")]
        images: PathBuf,
    },
    /// Run a flash script.
    Flash {
        script: PathBuf,
        #[arg(long, default_value = ".")]
        images: PathBuf,
    },
    /// Back up partitions (raw read; fastbootd or rooted adb).
    Backup {
        partitions: Vec<String>,
        /// Every baseband partition the device has.
        #[arg(long)]
        baseband: bool,
        #[arg(long)]
        store: PathBuf,
    },
    /// Write a stored backup back to the device.
    Restore {
        checksum: String,
        #[arg(long)]
        store: PathBuf,
    },
    /// List stored backups.
    Backups {
        #[arg(long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        handler_token.cancel();
        println!("{}", "\n>> interrupt received, stopping at the next step...".yellow().bold());
    })
    .context("installing the Ctrl-C handler")?;

    let config = load_config(args.config.as_deref())?;
    debug!(?config, "configuration loaded");

    let app = App { args, config, cancel };
    if let Err(e) = app.run().await {
        ui::err(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.is_file() {
                return Ok(EngineConfig::default());
            }
            default
        }
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    EngineConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

struct App {
    args: Args,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl App {
    async fn run(&self) -> anyhow::Result<()> {
        match &self.args.command {
            Command::Devices { watch } => self.devices(*watch).await,
            Command::Check { script, images } => self.check(script, images).await,
            Command::Flash { script, images } => self.flash(script, images).await,
            Command::Backup {
                partitions,
                baseband,
                store,
            } => self.backup(partitions, *baseband, store).await,
            Command::Restore { checksum, store } => self.restore(checksum, store).await,
            Command::Backups { store } => self.list_backups(store).await,
        }
    }

    fn platform_tools(&self) -> anyhow::Result<PlatformTools> {
        let dir = resolve_tools_dir(self.config.tools_dir.as_deref())?;
        PlatformTools::new(&dir).with_context(|| format!("platform tools in {}", dir.display()))
    }

    /// Transition timings for the in-memory device, which reboots instantly.
    fn controller(&self) -> ModeTransitionController {
        let mut transition = self.config.transition.clone();
        if self.args.simulate {
            transition.settle_ms = 0;
            transition.poll_interval_ms = 10;
        }
        ModeTransitionController::new(transition)
    }

    async fn connect(&self, simulated: impl FnOnce() -> SimulatedDevice) -> anyhow::Result<DeviceSession> {
        let (serial, transport) = if self.args.simulate {
            ui::warn("simulation: no device will be touched");
            let device: Arc<dyn Transport> = Arc::new(simulated());
            (SIMULATED_SERIAL.to_string(), device)
        } else {
            let tools = self.platform_tools()?;
            let serial = self.select_device(&tools).await?;
            let device: Arc<dyn Transport> = Arc::new(tools.for_device(&serial));
            (serial, device)
        };
        let guarded = GuardedTransport::from_config(transport, &self.config);
        let session = DeviceSession::attach(serial, Arc::new(guarded)).await?;
        ui::step(&format!(
            "device {} in {} (model {}, slot {})",
            session.serial().yellow(),
            session.current_mode(),
            session.model().unwrap_or_else(|| "unknown".into()),
            session.slot().map(|s| s.to_string()).unwrap_or_else(|| "-".into())
        ));
        Ok(session)
    }

    async fn select_device(&self, tools: &PlatformTools) -> anyhow::Result<String> {
        if let Some(serial) = &self.args.serial {
            return Ok(serial.clone());
        }
        ui::step("searching for devices...");
        let devices = tools.list_devices().await?;
        match devices.len() {
            0 => bail!("no device detected"),
            1 => Ok(devices[0].serial.clone()),
            _ => {
                let items: Vec<String> = devices
                    .iter()
                    .map(|d| format!("{} [{}]", d.serial.yellow(), d.mode))
                    .collect();
                let pick = ui::choose("select a device", &items).context("invalid selection")?;
                Ok(devices[pick].serial.clone())
            }
        }
    }

    async fn devices(&self, watch: bool) -> anyhow::Result<()> {
        let tools = self.platform_tools()?;
        if !watch {
            let devices = tools.list_devices().await?;
            if devices.is_empty() {
                ui::warn("no devices");
            }
            for d in devices {
                println!("{}\t{}\t{}", d.serial.yellow(), d.mode, d.status);
            }
            return Ok(());
        }

        ui::step("watching for devices, Ctrl-C to stop");
        let registry = SessionRegistry::new(tools.connector(&self.config));
        let (tx, mut rx) = mpsc::channel(32);
        let watcher = spawn_watcher(Arc::new(tools), Duration::from_secs(1), tx, self.cancel.clone());
        while let Some(event) = rx.recv().await {
            println!("{} {:?}", ">>".cyan().bold(), event);
            if let Err(e) = registry.handle(event).await {
                ui::warn(&e.to_string());
            }
        }
        watcher.await?;
        Ok(())
    }

    async fn check(&self, script: &Path, images: &Path) -> anyhow::Result<()> {
        let text = read_script(script).await?;
        let sources = FsSources::new(images);
        let report = ScriptInterpreter::new().check(&text, &sources);
        for diagnostic in &report.diagnostics {
            println!("{}:{}", script.display(), diagnostic);
        }
        if !report.is_ok() {
            bail!("{} error(s)", report.errors().count());
        }
        ui::ok(&format!(
            "{} step(s), {} warning(s)",
            report.steps,
            report.warnings().count()
        ));
        Ok(())
    }

    async fn flash(&self, script: &Path, images: &Path) -> anyhow::Result<()> {
        ui::banner();
        let text = read_script(script).await?;
        let sources = Arc::new(FsSources::new(images));
        let interpreter = ScriptInterpreter::new();
        for warning in interpreter.check(&text, sources.as_ref()).warnings() {
            ui::warn(&warning.to_string());
        }
        let plan = interpreter
            .parse(&text, sources.as_ref())
            .with_context(|| format!("{}", script.display()))?;
        print_plan(&plan);

        let destructive = plan.steps().iter().any(|s| s.step.is_destructive());
        if destructive && !self.args.yes && !ui::confirm("This plan writes or erases partitions. Continue?", false) {
            ui::warn("cancelled");
            return Ok(());
        }

        let session = self.connect(|| simulated_for_plan(&plan)).await?;
        let reporter = Arc::new(ConsoleReporter::new());
        let sinks: Vec<Arc<dyn EventSink>> = vec![reporter.clone(), Arc::new(TracingSink)];
        let executor = FlashPlanExecutor::new(self.controller(), sources, Arc::new(FanoutSink::new(sinks)))
            .with_options(self.config.executor)
            .with_cancellation(self.cancel.clone());

        let result = executor.execute(&plan, &session).await?;
        reporter.print_summary();
        info!(status = ?result.status, "flash finished");
        if !result.is_success() {
            bail!("{}", result.summary());
        }
        Ok(())
    }

    async fn backup(&self, partitions: &[String], baseband: bool, store: &Path) -> anyhow::Result<()> {
        if partitions.is_empty() && !baseband {
            bail!("name at least one partition or pass --baseband");
        }
        let session = self.connect(simulated_baseband).await?;
        let manager = BackupManager::new(Arc::new(FsBackupStore::new(store)), Arc::new(TracingSink));

        let mut taken = Vec::new();
        if baseband {
            taken.extend(manager.backup_baseband(&session).await?);
        }
        for partition in partitions {
            taken.push(manager.backup(&session, partition).await?);
        }
        for backup in &taken {
            ui::ok(&format!("{} ({} bytes) -> {}", backup.partition, backup.size, backup.checksum));
        }
        Ok(())
    }

    async fn restore(&self, checksum: &str, store: &Path) -> anyhow::Result<()> {
        let session = self.connect(simulated_baseband).await?;
        if !self.args.yes
            && !ui::confirm(&format!("Overwrite the partition backed up as {}?", checksum), false)
        {
            ui::warn("cancelled");
            return Ok(());
        }
        let manager = BackupManager::new(Arc::new(FsBackupStore::new(store)), Arc::new(TracingSink));
        let backup = manager.restore_by_checksum(&session, checksum).await?;
        ui::ok(&restore_message(&backup.partition, session.current_mode()));
        Ok(())
    }

    async fn list_backups(&self, store: &Path) -> anyhow::Result<()> {
        let store = FsBackupStore::new(store);
        let backups = store.list().await?;
        if backups.is_empty() {
            ui::warn(&format!("no backups in {}", store.dir().display()));
        }
        for b in backups {
            println!(
                "{}  {:<12} {:>10} bytes  {}",
                b.checksum.yellow(),
                b.partition,
                b.size,
                b.device_model
            );
        }
        Ok(())
    }
}

fn restore_message(partition: &str, mode: DeviceMode) -> String {
    if mode.exposes_raw_read() {
        format!("{} restored and verified", partition)
    } else {
        format!("{} restored (no read-back in {} mode)", partition, mode)
    }
}

async fn read_script(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn print_plan(plan: &FlashPlan) {
    ui::step(&format!("plan: {} step(s), starting in {}", plan.len(), plan.start_mode()));
    if !plan.devices().is_empty() {
        println!("     devices: {}", plan.devices().join(", "));
    }
    println!("{}", ui::divider());
    for planned in plan.steps() {
        let marker = if planned.step.is_destructive() { "!".red() } else { " ".normal() };
        println!(
            "{} {:>4}  {:<10} {}",
            marker,
            planned.line,
            planned.mode.to_string().bright_black(),
            planned.step
        );
    }
    println!("{}", ui::divider());
}

/// A device that matches whatever the plan expects: the first allowed model,
/// the starting mode, and partitions created on first write.
fn simulated_for_plan(plan: &FlashPlan) -> SimulatedDevice {
    let model = plan.devices().first().cloned().unwrap_or_else(|| "simulated".into());
    SimulatedDevice::new(model, plan.start_mode())
        .with_slot(Slot::A)
        .with_partition("userdata", 0)
        .with_partition("metadata", 0)
        .with_reboot_delay(1)
        .permissive()
}

fn simulated_baseband() -> SimulatedDevice {
    let sizes: BTreeMap<&str, usize> = [("modem", 8192), ("modemst1", 2048), ("modemst2", 2048), ("persist", 4096)]
        .into_iter()
        .collect();
    let mut device = SimulatedDevice::new("simulated", DeviceMode::Fastbootd).with_reboot_delay(1);
    for (i, name) in BASEBAND_PARTITIONS.iter().enumerate() {
        if let Some(size) = sizes.get(name) {
            let fill = (i as u8).wrapping_mul(37).wrapping_add(1);
            device = device.with_partition_data(name, &vec![fill; *size]);
        }
    }
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_restore_message_reflects_read_back() {
        assert_eq!(
            restore_message("modemst1", DeviceMode::Fastbootd),
            "modemst1 restored and verified"
        );
        let msg = restore_message("modemst1", DeviceMode::Bootloader);
        assert!(!msg.contains("verified"));
        assert!(msg.contains("no read-back"));
    }

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_flash_arguments() {
        let args = Args::parse_from(["toba-flash", "flash", "plan.toba", "--images", "out", "--simulate", "-y"]);
        assert!(args.simulate);
        assert!(args.yes);
        match args.command {
            Command::Flash { script, images } => {
                assert_eq!(script, PathBuf::from("plan.toba"));
                assert_eq!(images, PathBuf::from("out"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toba.toml");
        std::fs::write(&path, "command_timeout_secs = 30\n[retry]\nmax_attempts = 1\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.command_timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_simulated_baseband_layout() {
        let device = simulated_baseband();
        assert!(device.has_partition("modemst1"));
        assert!(device.has_partition("persist"));
        assert!(!device.has_partition("boot"));
        assert_eq!(device.mode(), DeviceMode::Fastbootd);
    }
}
