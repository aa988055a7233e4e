use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use thiserror::Error;

use crate::engine::models::ServerEndpoint;

pub const CONNECTOR_EXECUTABLE: &str = "samp.exe";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("the game is not installed")]
    NotInstalled,
    #[error("connector not found at {0}")]
    ConnectorMissing(PathBuf),
    #[error("failed to start {path}: {message}")]
    Spawn { path: PathBuf, message: String },
}

#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    connector: String,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(CONNECTOR_EXECUTABLE)
    }
}

impl ProcessLauncher {
    pub fn new(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
        }
    }

    /// Start the connector that sits next to `game_exe`, pointed at `endpoint`.
    /// Returns the child's process id; the child is not waited on.
    pub fn launch(&self, game_exe: &Path, endpoint: &ServerEndpoint) -> Result<u32, LaunchError> {
        let game_dir = game_exe.parent().ok_or(LaunchError::NotInstalled)?;
        let connector = game_dir.join(&self.connector);
        if !connector.is_file() {
            warn!("launch: connector not found at {}", connector.display());
            return Err(LaunchError::ConnectorMissing(connector));
        }

        let server = endpoint.connect_arg();
        info!("launch: starting {} {}", connector.display(), server);
        debug!("launch: cwd={}", game_dir.display());

        let mut cmd = Command::new(&connector);
        cmd.arg(&server);
        cmd.current_dir(game_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            path: connector.clone(),
            message: e.to_string(),
        })?;
        info!("launch: process {} started", child.id());
        Ok(child.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            ip: "127.0.0.1".into(),
            port: 7777,
        }
    }

    #[test]
    fn missing_connector_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("gta_sa.exe");
        fs::write(&exe, b"MZ").unwrap();
        assert_eq!(
            ProcessLauncher::default().launch(&exe, &endpoint()),
            Err(LaunchError::ConnectorMissing(tmp.path().join(CONNECTOR_EXECUTABLE)))
        );
    }

    #[cfg(unix)]
    #[test]
    fn passes_endpoint_and_runs_in_game_dir() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{Duration, Instant};

        let tmp = tempfile::tempdir().unwrap();
        let game_dir = tmp.path().canonicalize().unwrap();
        let exe = game_dir.join("gta_sa.exe");
        fs::write(&exe, b"MZ").unwrap();
        let connector = game_dir.join("connector.sh");
        fs::write(&connector, "#!/bin/sh\necho \"$1 $(pwd)\" > launched.txt\n").unwrap();
        fs::set_permissions(&connector, fs::Permissions::from_mode(0o755)).unwrap();

        ProcessLauncher::new("connector.sh")
            .launch(&exe, &endpoint())
            .unwrap();

        let marker = game_dir.join("launched.txt");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !marker.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(50));
        let written = fs::read_to_string(marker).unwrap();
        assert_eq!(
            written.trim(),
            format!("127.0.0.1:7777 {}", game_dir.display())
        );
    }
}
