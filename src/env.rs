use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Returns the root directory used by the launcher when `--app-dir` is not given.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("samp-launcher")
}

/// On-disk folders owned by one launcher instance.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn game_dir(&self) -> PathBuf {
        self.root.join("game")
    }

    pub fn game_version_dir(&self, version: &str) -> PathBuf {
        // Keep version strings from escaping the game directory.
        let safe: String = version
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                other => other,
            })
            .collect();
        let safe = if safe.trim_matches('.').is_empty() {
            "unversioned".to_owned()
        } else {
            safe
        };
        self.game_dir().join(safe)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root.join("settings")
    }

    /// Create the folder layout expected by the launcher.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        let folders = [
            self.root.clone(),
            self.downloads_dir(),
            self.game_dir(),
            self.assets_dir(),
            self.settings_dir(),
        ];
        for dir in folders {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(default_app_dir())
    }
}
