use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use teleop_app::logging;
use teleop_controller::{
    command_channel::CommandChannel, control_loop::ControlLoop, input_source::UdpPoseReceiver,
    teleop_config::TeleopConfig, trigger_notifier::HttpTriggerNotifier,
};
use teleop_grpc::grpc_client::GrpcConnector;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a yaml config. The included config is used when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the robot control server address
    #[arg(long, global = true)]
    address: Option<String>,

    /// Override the robot control server port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log as json
    #[arg(long, global = true)]
    json: bool,

    /// Sets the level of verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Teleoperate the arm from the AR controller
    Run,
    /// Print end effector pose, joint state and gripper width
    Status,
    /// Move to joint positions, ends any running policy
    MoveJoints {
        #[arg(long, num_args = 1.., value_delimiter = ',', allow_negative_numbers = true)]
        positions: Vec<f64>,
        /// Seconds
        #[arg(long, default_value_t = 5.0)]
        duration: f64,
    },
    /// Set gripper width in meters
    Gripper { width: f64 },
    /// Print the effective configuration
    PrintConfig,
}

fn load_config(args: &Args) -> Result<TeleopConfig> {
    let mut config = match &args.config {
        Some(path) => TeleopConfig::load_yaml(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => TeleopConfig::included(),
    };
    if let Some(address) = &args.address {
        config.server.address = address.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn connect(config: &TeleopConfig) -> Result<CommandChannel> {
    let settings = config.connection_settings();
    let endpoint = settings.endpoint.clone();
    let mut channel = CommandChannel::new(Box::new(GrpcConnector), settings);
    channel
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    Ok(channel)
}

async fn run(config: TeleopConfig) -> Result<()> {
    let input = UdpPoseReceiver::bind(&config.input.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.input.listen_address))?;
    let notifier = HttpTriggerNotifier::new(&config.trigger.endpoint, config.trigger_timeout())?;
    let channel = CommandChannel::new(Box::new(GrpcConnector), config.connection_settings());
    let control_loop = ControlLoop::new(&config, channel, Box::new(input), Box::new(notifier));

    let keep_running = Arc::new(AtomicBool::new(true));
    tokio::spawn({
        let keep_running = keep_running.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to wait for Ctrl+c {}", error);
                return;
            }
            tracing::info!("Detected Ctrl+c");
            keep_running.store(false, Ordering::Relaxed);
        }
    });

    let statistics = control_loop
        .run(keep_running)
        .await
        .context("Teleoperation failed to start")?;
    tracing::info!(
        ticks = statistics.ticks,
        overruns = statistics.overruns,
        dispatch_failures = statistics.dispatch_failures,
        recoveries = statistics.recoveries,
        triggers = statistics.triggers,
        "Teleoperation finished"
    );
    Ok(())
}

async fn status(config: &TeleopConfig) -> Result<()> {
    let mut channel = connect(config).await?;
    let pose = channel.read_pose().await?;
    let joints = channel.read_joint_positions().await?;
    let velocities = channel.read_joint_velocities().await?;
    let width = channel.read_gripper_width().await?;
    channel.close().await;

    println!("position:    {:?}", pose.position.as_slice());
    println!("orientation: {:?}", pose.orientation.as_slice());
    println!("joints:      {:?}", joints);
    println!("velocities:  {:?}", velocities);
    println!("gripper:     {}", width);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.json);
    let config = load_config(&args)?;

    match args.command {
        Command::Run => run(config).await?,
        Command::Status => status(&config).await?,
        Command::MoveJoints {
            positions,
            duration,
        } => {
            if !(duration.is_finite() && duration >= 0.0) {
                anyhow::bail!("Duration must be a non negative number of seconds");
            }
            let mut channel = connect(&config).await?;
            channel
                .move_to_joint_positions(positions, Duration::from_secs_f64(duration))
                .await?;
            channel.close().await;
        }
        Command::Gripper { width } => {
            let mut channel = connect(&config).await?;
            channel.set_gripper_width(width).await?;
            channel.close().await;
        }
        Command::PrintConfig => print!("{}", config.serialize_to_yaml()?),
    }
    Ok(())
}
