//! Persistent launcher state split across two namespaces: one private to this launcher
//! (keyed by product name) and the shared `SAMP` namespace the SA-MP client also reads.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

pub const SHARED_NAMESPACE: &str = "SAMP";
pub const DEFAULT_PRODUCT_NAME: &str = "SampLauncher";
pub const MAX_PLAYER_NAME_LEN: usize = 24;

pub(crate) const KEY_VERSION: &str = "version";
pub(crate) const KEY_GAME_PATH: &str = "gta_sa_exe";
pub(crate) const KEY_PLAYER_NAME: &str = "PlayerName";

const PRODUCT_NAME_FILE: &str = "product_name";

#[cfg(windows)]
mod registry;
#[cfg(windows)]
pub use registry::RegistryStore;

/// The backend the launcher uses on this platform: the registry on Windows, where the
/// SA-MP client reads the shared values, JSON documents elsewhere.
#[cfg(windows)]
pub type NativeStore = RegistryStore;
#[cfg(not(windows))]
pub type NativeStore = FileStore;

#[cfg(windows)]
pub fn native_store(_settings_dir: &Path, product_name: &str) -> NativeStore {
    RegistryStore::new(product_name)
}

#[cfg(not(windows))]
pub fn native_store(settings_dir: &Path, product_name: &str) -> NativeStore {
    FileStore::new(settings_dir, product_name)
}

/// Launcher namespace picked by an earlier session.
pub fn last_product_name(settings_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(settings_dir.join(PRODUCT_NAME_FILE)).ok()?;
    Some(text.trim().to_owned()).filter(|name| !name.is_empty())
}

pub fn remember_product_name(settings_dir: &Path, name: &str) -> std::io::Result<()> {
    fs::create_dir_all(settings_dir)?;
    fs::write(settings_dir.join(PRODUCT_NAME_FILE), name.trim())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Launcher,
    Shared,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Launcher => f.write_str("launcher"),
            Namespace::Shared => f.write_str("shared"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{namespace} store unavailable: {message}")]
    Unavailable { namespace: Namespace, message: String },
    #[error("invalid player name {0:?}: must be 1-{max} characters", max = MAX_PLAYER_NAME_LEN)]
    InvalidPlayerName(String),
    #[error("not an existing file: {0}")]
    InvalidInstallPath(PathBuf),
}

/// String key/value storage. Keys and values are case-sensitive.
pub trait KeyValueStore: Send {
    fn get_string(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`. A failed write leaves the previous value in place.
    fn set_string(
        &mut self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;
}

/// One JSON document per namespace, replaced atomically on every write.
#[derive(Clone, Debug)]
pub struct FileStore {
    launcher_file: PathBuf,
    shared_file: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>, product_name: &str) -> Self {
        let root = root.as_ref();
        Self {
            launcher_file: root
                .join("launcher")
                .join(format!("{}.json", sanitize(product_name))),
            shared_file: root.join("shared").join(format!("{SHARED_NAMESPACE}.json")),
        }
    }

    fn file(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::Launcher => &self.launcher_file,
            Namespace::Shared => &self.shared_file,
        }
    }

    fn load(&self, namespace: Namespace) -> Result<BTreeMap<String, String>, StoreError> {
        let path = self.file(namespace);
        let unavailable = |message: String| StoreError::Unavailable { namespace, message };
        match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| unavailable(format!("{} is not valid: {e}", path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(unavailable(format!("cannot read {}: {err}", path.display()))),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get_string(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .load(namespace)?
            .get(key)
            .map(|value| value.trim().to_owned()))
    }

    fn set_string(
        &mut self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let path = self.file(namespace).to_path_buf();
        let unavailable = |message: String| StoreError::Unavailable { namespace, message };

        let mut values = self.load(namespace)?;
        values.insert(key.to_owned(), value.trim().to_owned());
        let text = serde_json::to_string_pretty(&values)
            .map_err(|e| unavailable(format!("cannot encode values: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| unavailable(format!("cannot create {}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            unavailable(format!("cannot write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            unavailable(format!("cannot replace {}: {e}", path.display()))
        })?;
        debug!("storage: {namespace}/{key} updated");
        Ok(())
    }
}

pub(crate) fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ').to_owned();
    if cleaned.is_empty() {
        DEFAULT_PRODUCT_NAME.to_owned()
    } else {
        cleaned
    }
}

/// Canonical absolute path, without the `\\?\` prefix Windows adds, since other
/// tools read the stored value.
fn resolve(path: &Path) -> Option<PathBuf> {
    let canonical = path.canonicalize().ok()?;
    #[cfg(windows)]
    {
        let text = canonical.to_string_lossy();
        if let Some(stripped) = text.strip_prefix(r"\\?\") {
            return Some(PathBuf::from(stripped));
        }
    }
    Some(canonical)
}

/// Typed accessors for the values the launcher keeps.
pub struct StateStore<S> {
    backend: S,
}

impl<S: KeyValueStore> StateStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    fn read(&self, namespace: Namespace, key: &str) -> Option<String> {
        match self.backend.get_string(namespace, key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(err) => {
                warn!("storage: reading {namespace}/{key} failed: {err}");
                None
            }
        }
    }

    pub fn version(&self) -> Option<String> {
        self.read(Namespace::Launcher, KEY_VERSION)
    }

    pub fn set_version(&mut self, version: &str) -> Result<(), StoreError> {
        self.backend
            .set_string(Namespace::Launcher, KEY_VERSION, version)
    }

    /// Persist the absolute path of an existing game executable.
    pub fn save_install_path(&mut self, path: &Path) -> Result<PathBuf, StoreError> {
        let absolute =
            resolve(path).ok_or_else(|| StoreError::InvalidInstallPath(path.to_path_buf()))?;
        if !absolute.is_file() {
            return Err(StoreError::InvalidInstallPath(absolute));
        }
        self.backend.set_string(
            Namespace::Shared,
            KEY_GAME_PATH,
            &absolute.to_string_lossy(),
        )?;
        Ok(absolute)
    }

    /// The stored executable path, only while it still points at a file.
    pub fn install_path(&self) -> Option<PathBuf> {
        let stored = PathBuf::from(self.read(Namespace::Shared, KEY_GAME_PATH)?);
        match resolve(&stored) {
            Some(path) if path.is_file() => Some(path),
            _ => {
                debug!("storage: stored game path {} is gone", stored.display());
                None
            }
        }
    }

    pub fn save_player_name(&mut self, name: &str) -> Result<String, StoreError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_PLAYER_NAME_LEN {
            return Err(StoreError::InvalidPlayerName(name.to_owned()));
        }
        self.backend
            .set_string(Namespace::Shared, KEY_PLAYER_NAME, name)?;
        Ok(name.to_owned())
    }

    pub fn player_name(&self) -> Option<String> {
        self.read(Namespace::Shared, KEY_PLAYER_NAME)
    }
}

#[cfg(test)]
type Shared<T> = std::sync::Arc<std::sync::Mutex<T>>;

/// In-process backend for tests. Clones share their values.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Shared<std::collections::HashMap<(Namespace, String), String>>,
    rejected: Shared<Vec<String>>,
}

#[cfg(test)]
impl MemoryStore {
    /// Make every later write to `key` fail.
    pub fn reject_writes_to(&self, key: &str) {
        self.rejected.lock().unwrap().push(key.to_owned());
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get_string(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&(namespace, key.to_owned()))
            .cloned())
    }

    fn set_string(
        &mut self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        if self.rejected.lock().unwrap().iter().any(|k| k == key) {
            return Err(StoreError::Unavailable {
                namespace,
                message: format!("writes to {key} disabled"),
            });
        }
        self.values
            .lock()
            .unwrap()
            .insert((namespace, key.to_owned()), value.trim().to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(root: &Path) -> StateStore<FileStore> {
        StateStore::new(FileStore::new(root, "Test Launcher"))
    }

    #[test]
    fn namespaces_are_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(tmp.path(), "My/Launcher");
        store.set_string(Namespace::Launcher, "version", " 1.0 ").unwrap();
        store.set_string(Namespace::Shared, "PlayerName", "Carl").unwrap();

        assert_eq!(
            store.get_string(Namespace::Launcher, "version").unwrap(),
            Some("1.0".into())
        );
        assert_eq!(store.get_string(Namespace::Shared, "version").unwrap(), None);
        assert!(tmp.path().join("launcher").join("My_Launcher.json").is_file());
        assert!(tmp.path().join("shared").join("SAMP.json").is_file());
    }

    #[test]
    fn keys_are_case_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(tmp.path(), "L");
        store.set_string(Namespace::Shared, "PlayerName", "Carl").unwrap();
        assert_eq!(store.get_string(Namespace::Shared, "playername").unwrap(), None);
    }

    #[test]
    fn version_round_trips_through_launcher_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = file_store(tmp.path());
        assert_eq!(store.version(), None);
        store.set_version("2.0\n").unwrap();
        assert_eq!(store.version(), Some("2.0".into()));
    }

    #[test]
    fn install_path_is_validated_and_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = file_store(&tmp.path().join("state"));
        let exe = tmp.path().join("game").join("gta_sa.exe");
        fs::create_dir_all(exe.parent().unwrap()).unwrap();

        assert_eq!(
            store.save_install_path(&exe),
            Err(StoreError::InvalidInstallPath(exe.clone()))
        );
        assert!(matches!(
            store.save_install_path(exe.parent().unwrap()),
            Err(StoreError::InvalidInstallPath(_))
        ));

        fs::write(&exe, b"MZ").unwrap();
        let dotted = tmp.path().join("game").join(".").join("gta_sa.exe");
        let saved = store.save_install_path(&dotted).unwrap();
        assert!(saved.is_absolute());
        assert_eq!(store.install_path(), Some(saved));

        fs::remove_file(&exe).unwrap();
        assert_eq!(store.install_path(), None);
    }

    #[test]
    fn rejected_player_name_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = file_store(tmp.path());
        assert_eq!(store.save_player_name("  Carl_Johnson "), Ok("Carl_Johnson".into()));

        let too_long = "A".repeat(25);
        assert_eq!(
            store.save_player_name(&too_long),
            Err(StoreError::InvalidPlayerName(too_long.clone()))
        );
        assert!(matches!(
            store.save_player_name("   "),
            Err(StoreError::InvalidPlayerName(_))
        ));
        assert_eq!(store.player_name(), Some("Carl_Johnson".into()));

        assert!(store.save_player_name(&"B".repeat(24)).is_ok());
    }

    #[test]
    fn failed_write_leaves_prior_state() {
        let mut store = StateStore::new(MemoryStore::default());
        store.set_version("1.0").unwrap();
        store.backend.reject_writes_to(KEY_VERSION);
        assert!(matches!(
            store.set_version("2.0"),
            Err(StoreError::Unavailable { .. })
        ));
        assert_eq!(store.version(), Some("1.0".into()));
    }

    #[test]
    fn product_name_is_remembered_trimmed() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = tmp.path().join("settings");
        assert_eq!(last_product_name(&settings), None);
        remember_product_name(&settings, " Grove Street RP ").unwrap();
        assert_eq!(last_product_name(&settings), Some("Grove Street RP".into()));
        fs::write(settings.join(PRODUCT_NAME_FILE), "  \n").unwrap();
        assert_eq!(last_product_name(&settings), None);
    }

    #[test]
    fn corrupt_document_is_unavailable_not_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(tmp.path(), "L");
        store.set_string(Namespace::Launcher, "version", "1.0").unwrap();
        fs::write(&store.launcher_file, b"{not json").unwrap();
        assert!(matches!(
            store.get_string(Namespace::Launcher, "version"),
            Err(StoreError::Unavailable { .. })
        ));
        assert!(store.set_string(Namespace::Launcher, "version", "2.0").is_err());
        assert_eq!(fs::read(&store.launcher_file).unwrap(), b"{not json");
    }
}
