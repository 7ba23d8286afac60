use anyhow::{Context, Result};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use teleop_grpc::grpc_server::{RobotControlHandler, RobotControlServer, SimulatedRobot};
use tokio::sync::Mutex;
use tonic::transport::Server;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Address to serve the simulated robot on
    #[arg(long, default_value = "0.0.0.0:4242")]
    address: SocketAddr,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Unlike `ar_teleop`, which stays at warn, the simulator logs served commands at info by default
fn simulator_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn setup_simulator_tracing(verbose: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(simulator_level(verbose).into())
        .from_env_lossy();
    Registry::default().with(filter).with(fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_simulator_tracing(args.verbose);

    let robot = Arc::new(Mutex::new(SimulatedRobot::default()));
    let handler = RobotControlHandler::new(robot);

    tracing::info!("Starting simulated robot at {}", args.address);

    Server::builder()
        .add_service(RobotControlServer::new(handler))
        .serve_with_shutdown(args.address, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Detected Ctrl+c");
            }
        })
        .await
        .with_context(|| format!("Failed to serve on {}", args.address))?;

    Ok(())
}
