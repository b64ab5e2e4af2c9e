//! wardend — multi-camera surveillance recorder
//!
//! Usage:
//!   wardend run --config-root /etc/warden
//!   wardend gc --config-root /etc/warden
//!   wardend camera ls --config-root /etc/warden
//!   wardend camera start front-door --config-root /etc/warden
//!   wardend camera stop front-door --config-root /etc/warden

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use warden_nvr::config::Config;
use warden_nvr::error::exit_code;
use warden_nvr::supervisor::{self, Supervisor};

#[derive(Parser)]
#[command(name = "wardend", about = "Multi-camera surveillance recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor in the foreground: start every configured
    /// camera, serve the control socket, and run the periodic scheduler.
    Run {
        #[arg(long, default_value = "/etc/warden")]
        config_root: PathBuf,
    },
    /// Run one retention sweep across every storage backend and exit.
    Gc {
        #[arg(long, default_value = "/etc/warden")]
        config_root: PathBuf,
    },
    /// Inspect or control individual cameras via the control socket.
    Camera {
        #[command(subcommand)]
        action: CameraAction,
        #[arg(long, default_value = "/etc/warden")]
        config_root: PathBuf,
    },
    /// Internal: runs a single camera's pipeline in this process. Spawned
    /// by the supervisor via self-re-exec; not meant to be invoked by hand.
    #[command(hide = true, name = "__run-pipeline")]
    RunPipeline {
        #[arg(long)]
        camera: String,
        #[arg(long)]
        config_root: PathBuf,
    },
}

#[derive(Subcommand)]
enum CameraAction {
    Ls,
    Start { name: String },
    Stop { name: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config_root } => run(config_root).await,
        Command::Gc { config_root } => gc(config_root).await,
        Command::Camera { action, config_root } => camera(action, config_root).await,
        Command::RunPipeline { camera, config_root } => run_pipeline(camera, config_root),
    };
    std::process::exit(code);
}

async fn run(config_root: PathBuf) -> i32 {
    if !nix::unistd::Uid::effective().is_root() {
        error!("wardend must run as root");
        return exit_code::EPERM;
    }

    let supervisor = match Supervisor::init(config_root) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to initialize supervisor");
            return exit_code::EINVAL;
        }
    };
    if supervisor.is_already_running().await {
        error!("daemon is already running");
        return exit_code::EEXIST;
    }
    match supervisor.run().await {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!(error = %e, "supervisor exited with an error");
            exit_code::EIO
        }
    }
}

async fn gc(config_root: PathBuf) -> i32 {
    let supervisor = match Supervisor::init(config_root) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return exit_code::EINVAL;
        }
    };
    match supervisor.run_retention_sweep().await {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!(error = %e, "retention sweep failed");
            exit_code::EIO
        }
    }
}

async fn camera(action: CameraAction, config_root: PathBuf) -> i32 {
    let config = match Config::load_dir(&config_root) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return exit_code::EINVAL;
        }
    };
    let socket_path = config.supervisor.socket_path.clone();

    let (object, cmd_action, id) = match &action {
        CameraAction::Ls => ("camera", "ls", None),
        CameraAction::Start { name } => ("camera", "start", Some(name.as_str())),
        CameraAction::Stop { name } => ("camera", "stop", Some(name.as_str())),
    };

    match warden_nvr::control::send_request(&socket_path, object, cmd_action, id).await {
        Ok(Some(value)) => {
            println!("{value}");
            exit_code::OK
        }
        Ok(None) => exit_code::OK,
        Err(e) => {
            error!(error = %e, "control request failed");
            exit_code::ESRCH
        }
    }
}

fn run_pipeline(camera: String, config_root: PathBuf) -> i32 {
    match supervisor::run_pipeline_child(&config_root, &camera) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, camera = %camera, "pipeline child failed to start");
            exit_code::EIO
        }
    }
}
