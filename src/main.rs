use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use light_scheduler::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Schedule configuration file (YAML)
    #[arg(short, long, global = true, default_value = "schedules.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Append commands to this file instead of talking to Bluetooth fixtures
    #[arg(long)]
    log_device: Option<PathBuf>,
    /// Seconds to scan for Bluetooth fixtures
    #[arg(long, default_value_t = 10)]
    scan_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a schedule until interrupted
    Run {
        /// Schedule to activate (defaults to `default_schedule` from the config)
        #[arg(short, long)]
        schedule: Option<String>,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Print the compiled events of every (or one) schedule
    Compile {
        #[arg(short, long)]
        schedule: Option<String>,
    },
    /// Send a single command to a lighting group
    Send {
        /// Lighting group to address
        #[arg(short, long)]
        group: String,
        /// Turn the group on
        #[arg(long, conflicts_with = "off")]
        on: bool,
        /// Turn the group off
        #[arg(long)]
        off: bool,
        /// Brightness (1-254)
        #[arg(short, long)]
        brightness: Option<u8>,
        /// Color temperature in mireds (153-500)
        #[arg(long)]
        color_temperature: Option<u16>,
        /// Relative brightness change
        #[arg(long, allow_hyphen_values = true)]
        delta: Option<i16>,
        /// Ramp up over this many minutes (requires --on)
        #[arg(long, default_value_t = 0)]
        ramp: u32,
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("light_scheduler=info,lsched=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let config = YamlConfigFile::new(&cli.config).load()?;

    match cli.command {
        Commands::Run { schedule, device } => run(config, schedule, device).await,
        Commands::Compile { schedule } => print_compiled(&config, schedule.as_deref()),
        Commands::Send {
            group,
            on,
            off,
            brightness,
            color_temperature,
            delta,
            ramp,
            device,
        } => {
            let targets = config
                .groups
                .get(&group)
                .ok_or_else(|| eyre!("Unknown lighting group '{}'", group))?;
            let state = match (on, off) {
                (true, _) => LightState::On,
                (_, true) => LightState::Off,
                _ => LightState::NoChange,
            };
            let command = Command {
                state,
                brightness,
                color_temperature,
                brightness_delta: delta,
                target_ids: targets.clone(),
                ramp_minutes: ramp,
            };
            send(&config, command, device).await
        }
    }
}

/// Connects the configured device backend
async fn open_device(config: &AppConfig, args: &DeviceArgs) -> Result<Arc<dyn DeviceInterface>> {
    match &args.log_device {
        Some(path) => {
            info!("Logging commands to {}", path.display());
            Ok(Arc::new(LogDevice::open(path).await?))
        }
        None => {
            let fixtures =
                BleFixtures::connect(&config.fixture_ids(), Duration::from_secs(args.scan_secs))
                    .await?;
            info!(
                "Fixtures ready: {}",
                fixtures.ids().collect::<Vec<_>>().join(", ")
            );
            Ok(Arc::new(fixtures))
        }
    }
}

/// Compiles the configuration, reporting schedules that were excluded
fn compile_config(config: &AppConfig) -> Compilation {
    let compilation = compile(&config.schedules, &config.groups);
    for (name, e) in &compilation.failures {
        error!("Schedule '{}' excluded: {}", name, e);
    }
    compilation
}

#[instrument(skip(config, device))]
async fn run(config: AppConfig, schedule: Option<String>, device: DeviceArgs) -> Result<()> {
    let compilation = compile_config(&config);
    let name = schedule
        .or_else(|| config.default_schedule.clone())
        .ok_or_else(|| eyre!("No schedule given and no default_schedule configured"))?;

    let device = open_device(&config, &device).await?;
    let (dispatcher, commands) = Dispatcher::new(device, config.dispatch_interval());
    commands.set_connected(true);

    let (triggers_tx, mut triggers) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(compilation.queues, Arc::new(SystemClock), triggers_tx);
    scheduler.activate(&name)?;

    let dispatch_task = tokio::spawn(dispatcher.run());
    let scheduler_task = tokio::spawn(scheduler.run());

    let forward = async {
        while let Some(trigger) = triggers.recv().await {
            if let Err(e) = commands.enqueue(trigger.command) {
                warn!("Dropping trigger '{}': {}", trigger.label, e);
            }
        }
    };

    tokio::select! {
        _ = forward => warn!("Scheduler stopped"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
        }
    }

    scheduler_task.abort();
    dispatch_task.abort();
    Ok(())
}

fn print_compiled(config: &AppConfig, only: Option<&str>) -> Result<()> {
    let compilation = compile_config(config);
    if let Some(name) = only {
        if !compilation.queues.contains_key(name) {
            return Err(eyre!("Schedule '{}' did not compile", name));
        }
    }

    let listing: BTreeMap<&str, &[CompiledEvent]> = compilation
        .queues
        .iter()
        .filter(|(name, _)| only.map_or(true, |only| only == name.as_str()))
        .map(|(name, queue)| (name.as_str(), queue.events()))
        .collect();
    print!("{}", serde_yaml::to_string(&listing)?);
    Ok(())
}

#[instrument(skip(config, device))]
async fn send(config: &AppConfig, command: Command, device: DeviceArgs) -> Result<()> {
    command.validate()?;
    let device = open_device(config, &device).await?;
    let (dispatcher, commands) = Dispatcher::new(device, config.dispatch_interval());
    commands.set_connected(true);
    let dispatch_task = tokio::spawn(dispatcher.run());

    if command.is_ramp() {
        info!("Ramping over {} minutes", command.ramp_minutes);
    }
    commands.enqueue(command)?;
    commands.wait_idle(config.dispatch_interval()).await;

    dispatch_task.abort();
    info!("Done");
    Ok(())
}
