//! Long-running supervisor (spec §4.6): owns the set of camera child
//! processes, runs the periodic scheduler (retention sweep + watchdog),
//! and serves the control socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::control;
use crate::error::{exit_code, ControlError};
use crate::retention;

static SUPERVISOR: OnceCell<Supervisor> = OnceCell::new();

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

struct RunningCamera {
    child: Child,
}

pub struct Supervisor {
    config_root: PathBuf,
    config: Config,
    running: Mutex<HashMap<String, RunningCamera>>,
    self_exe: PathBuf,
}

impl Supervisor {
    /// Initializes the process-wide singleton. May only be called once;
    /// subsequent calls to [`Supervisor::get`] return this instance.
    pub fn init(config_root: PathBuf) -> anyhow::Result<&'static Supervisor> {
        let config = Config::load_dir(&config_root)?;
        let self_exe = std::env::current_exe()?;
        let supervisor = Supervisor {
            config_root,
            config,
            running: Mutex::new(HashMap::new()),
            self_exe,
        };
        SUPERVISOR
            .set(supervisor)
            .map_err(|_| anyhow::anyhow!("supervisor already initialized"))?;
        Ok(SUPERVISOR.get().expect("just set"))
    }

    pub fn get() -> &'static Supervisor {
        SUPERVISOR.get().expect("Supervisor::init was not called")
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts every configured camera, then blocks serving the control
    /// socket and the periodic scheduler until a termination signal.
    pub async fn run(&'static self) -> anyhow::Result<()> {
        if let Some(parent) = self.config.supervisor.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        self.write_pid_file().await?;

        for camera in &self.config.cameras {
            if let Err(e) = self.start_camera(&camera.name).await {
                warn!(camera = %camera.name, error = %e, "failed to start camera at boot");
            }
        }

        let scheduler = tokio::spawn(self.scheduler_loop());
        let control_server = tokio::spawn(control::serve(self));

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            res = scheduler => { if let Err(e) = res { warn!(error = %e, "scheduler task panicked"); } }
            res = control_server => { if let Err(e) = res { warn!(error = %e, "control server task panicked"); } }
        }

        self.stop_all().await;
        Ok(())
    }

    async fn scheduler_loop(&'static self) {
        let mut next_sweep = tokio::time::Instant::now() + RETENTION_SWEEP_INTERVAL;
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            watchdog.tick().await;
            self.watchdog_tick().await;
            if tokio::time::Instant::now() >= next_sweep {
                if let Err(e) = self.run_retention_sweep().await {
                    warn!(error = %e, "retention sweep failed");
                }
                next_sweep = tokio::time::Instant::now() + RETENTION_SWEEP_INTERVAL;
            }
        }
    }

    async fn watchdog_tick(&'static self) {
        let mut running = self.running.lock().await;
        let mut dead = Vec::new();
        for (name, camera) in running.iter_mut() {
            if let Ok(Some(status)) = camera.child.try_wait() {
                warn!(camera = %name, code = ?status.code(), "camera pipeline exited, restarting");
                dead.push(name.clone());
            }
        }
        for name in dead {
            running.remove(&name);
            drop(running);
            if let Err(e) = self.start_camera(&name).await {
                warn!(camera = %name, error = %e, "failed to restart camera");
            }
            running = self.running.lock().await;
        }
    }

    pub async fn run_retention_sweep(&'static self) -> anyhow::Result<()> {
        for (name, descriptor) in &self.config.storage {
            match descriptor {
                crate::config::StorageDescriptor::Local {
                    root,
                    retention_days,
                    ..
                } => {
                    let items = retention::local::list_expired(root, *retention_days)?;
                    info!(storage = %name, count = items.len(), "local retention sweep");
                    for item in items {
                        item.remove()?;
                    }
                }
                crate::config::StorageDescriptor::ObjectStore {
                    bucket,
                    key_prefix,
                    retention_days,
                    ..
                } => {
                    let client = self.build_s3_client(descriptor).await?;
                    let items =
                        retention::remote::list_expired(&client, bucket, key_prefix, *retention_days)
                            .await?;
                    info!(storage = %name, count = items.len(), "remote retention sweep");
                    for item in &items {
                        retention::remote::remove(&client, bucket, item).await?;
                    }
                }
                crate::config::StorageDescriptor::Broadcast { .. } => {}
            }
        }
        Ok(())
    }

    async fn build_s3_client(
        &self,
        descriptor: &crate::config::StorageDescriptor,
    ) -> anyhow::Result<aws_sdk_s3::Client> {
        let crate::config::StorageDescriptor::ObjectStore {
            region,
            access_key_id,
            secret_access_key,
            ..
        } = descriptor
        else {
            anyhow::bail!("not an object-store descriptor");
        };
        let region = aws_sdk_s3::config::Region::new(region.clone().unwrap_or_else(|| "us-east-1".into()));
        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "warden-nvr",
        );
        let timeout_config = aws_smithy_types::timeout::TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(10))
            .build();
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region)
            .credentials_provider(credentials)
            .timeout_config(timeout_config)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;
        Ok(aws_sdk_s3::Client::new(&shared_config))
    }

    pub async fn start_camera(&self, name: &str) -> Result<(), ControlError> {
        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return Ok(());
        }
        self.config
            .camera(name)
            .ok_or_else(|| ControlError::UnknownCamera(name.to_string()))?;

        let child = Command::new(&self.self_exe)
            .arg("__run-pipeline")
            .arg("--camera")
            .arg(name)
            .arg("--config-root")
            .arg(&self.config_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ControlError::Io)?;

        running.insert(name.to_string(), RunningCamera { child });
        Ok(())
    }

    /// Sends `SIGTERM` and waits for the exit code: the entire "typed IPC
    /// channel" spec.md's Design Note 9 calls for.
    pub async fn stop_camera(&self, name: &str) -> Result<i32, ControlError> {
        self.config
            .camera(name)
            .ok_or_else(|| ControlError::UnknownCamera(name.to_string()))?;
        let mut running = self.running.lock().await;
        match running.remove(name) {
            Some(camera) => Ok(Self::terminate(camera).await),
            None => Ok(exit_code::OK),
        }
    }

    async fn terminate(mut camera: RunningCamera) -> i32 {
        if let Some(pid) = camera.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match camera.child.wait().await {
            Ok(status) => status.code().unwrap_or(exit_code::EIO),
            Err(_) => exit_code::EIO,
        }
    }

    pub async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        let names: Vec<String> = running.keys().cloned().collect();
        for name in names {
            if let Some(camera) = running.remove(&name) {
                Self::terminate(camera).await;
            }
        }
    }

    /// `{name: active}` for every configured camera (spec §6 `camera ls`).
    pub async fn list_cameras(&self) -> HashMap<String, bool> {
        let running = self.running.lock().await;
        self.config
            .cameras
            .iter()
            .map(|c| (c.name.clone(), running.contains_key(&c.name)))
            .collect()
    }

    /// Checks the pid file left by a prior instance: if it names a PID that
    /// is still alive, a second `run` must refuse to start rather than
    /// overwrite the pid file and rebind the control socket out from under
    /// it (`daemon.py`'s `pidfile.is_locked()` / `os.kill(pid, 0)` check).
    pub async fn is_already_running(&self) -> bool {
        let Ok(text) = tokio::fs::read_to_string(&self.config.supervisor.pid_file).await else {
            return false;
        };
        let Ok(pid) = text.trim().parse::<i32>() else {
            return false;
        };
        kill(Pid::from_raw(pid), None).is_ok()
    }

    async fn write_pid_file(&self) -> std::io::Result<()> {
        if let Some(parent) = self.config.supervisor.pid_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(
            &self.config.supervisor.pid_file,
            std::process::id().to_string(),
        )
        .await
    }
}

/// Entry point for the hidden `__run-pipeline` subcommand: runs exactly
/// one camera's pipeline in the current (already-forked) process and
/// returns its exit code.
pub fn run_pipeline_child(config_root: &Path, camera_name: &str) -> anyhow::Result<i32> {
    let config = Config::load_dir(config_root)?;
    let camera = config
        .camera(camera_name)
        .ok_or_else(|| anyhow::anyhow!("unknown camera '{camera_name}'"))?
        .clone();
    crate::pipeline::install_signal_handler()?;
    let pipeline = crate::pipeline::CameraPipeline::new(camera);
    Ok(pipeline.run(&config.storage))
}
