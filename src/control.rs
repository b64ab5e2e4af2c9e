//! Unix control socket (spec §6): a tiny null-byte-framed JSON protocol
//! for `camera ls/start/stop` and `gc run`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::supervisor::Supervisor;

#[derive(Debug, Deserialize)]
struct Request {
    object: String,
    action: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CameraStatus {
    active: bool,
}

/// `Cameras` is a tuple variant so untagged serialization emits the map
/// itself — `{"front-door": {"active": true}, ...}` — rather than wrapping
/// it under a `cameras` key (spec §6 `camera ls`).
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    ExitCode { exitcode: i32 },
    Cameras(HashMap<String, CameraStatus>),
}

async fn read_frame(stream: &mut BufReader<UnixStream>) -> Result<Vec<u8>, ControlError> {
    let mut buf = Vec::new();
    let n = stream.read_until(0u8, &mut buf).await?;
    if n == 0 {
        return Err(ControlError::Malformed("connection closed".into()));
    }
    if buf.last() == Some(&0u8) {
        buf.pop();
    }
    Ok(buf)
}

async fn write_frame(
    stream: &mut BufReader<UnixStream>,
    response: &Response,
) -> Result<(), ControlError> {
    let mut payload = serde_json::to_vec(response).map_err(|e| ControlError::Malformed(e.to_string()))?;
    payload.push(0u8);
    stream.write_all(&payload).await?;
    Ok(())
}

/// Serves the control socket until cancelled. `0660` permissions match the
/// "no authentication beyond local-socket file permissions" non-goal in
/// spec.md §1.
pub async fn serve(supervisor: &'static Supervisor) -> anyhow::Result<()> {
    let socket_path = &supervisor.config().supervisor.socket_path;
    let _ = tokio::fs::remove_file(socket_path).await;
    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660)).await?;
    }

    info!(path = %socket_path.display(), "control socket listening");
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(handle_connection(supervisor, stream));
    }
}

async fn handle_connection(supervisor: &'static Supervisor, stream: UnixStream) {
    if let Err(e) = handle_connection_inner(supervisor, stream).await {
        warn!(error = %e, "control connection failed");
    }
}

async fn handle_connection_inner(
    supervisor: &'static Supervisor,
    stream: UnixStream,
) -> Result<(), ControlError> {
    let mut stream = BufReader::new(stream);
    let raw = read_frame(&mut stream).await?;
    let request: Request =
        serde_json::from_slice(&raw).map_err(|e| ControlError::Malformed(e.to_string()))?;

    match (request.object.as_str(), request.action.as_str()) {
        ("camera", "ls") => {
            let cameras = supervisor
                .list_cameras()
                .await
                .into_iter()
                .map(|(name, active)| (name, CameraStatus { active }))
                .collect();
            write_frame(&mut stream, &Response::Cameras(cameras)).await?;
        }
        ("camera", "start") => {
            let id = request
                .id
                .ok_or_else(|| ControlError::Malformed("missing id".into()))?;
            supervisor.start_camera(&id).await?;
            // No reply, per spec.md §6.
        }
        ("camera", "stop") => {
            let id = request
                .id
                .ok_or_else(|| ControlError::Malformed("missing id".into()))?;
            let exitcode = supervisor.stop_camera(&id).await?;
            write_frame(&mut stream, &Response::ExitCode { exitcode }).await?;
        }
        ("gc", "run") => {
            let exitcode = match supervisor.run_retention_sweep().await {
                Ok(()) => crate::error::exit_code::OK,
                Err(_) => crate::error::exit_code::EIO,
            };
            write_frame(&mut stream, &Response::ExitCode { exitcode }).await?;
        }
        _ => {
            return Err(ControlError::Malformed(format!(
                "unknown object/action '{}/{}'",
                request.object, request.action
            )))
        }
    }
    Ok(())
}

/// A single request/response round trip against the control socket, used
/// by the `camera ls|start|stop` and `gc` CLI subcommands.
pub async fn send_request(
    socket_path: &Path,
    object: &str,
    action: &str,
    id: Option<&str>,
) -> Result<Option<serde_json::Value>, ControlError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ControlError::Unreachable(e.to_string()))?;

    let request = serde_json::json!({
        "object": object,
        "action": action,
        "id": id,
    });
    let mut payload = serde_json::to_vec(&request).map_err(|e| ControlError::Malformed(e.to_string()))?;
    payload.push(0u8);
    stream.write_all(&payload).await?;

    if object == "camera" && action == "start" {
        return Ok(None);
    }

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let n = reader.read_until(0u8, &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&0u8) {
        buf.pop();
    }
    let value: serde_json::Value =
        serde_json::from_slice(&buf).map_err(|e| ControlError::Malformed(e.to_string()))?;
    Ok(Some(value))
}
