//! `HKEY_CURRENT_USER` backend. `samp.exe` reads `PlayerName` and `gta_sa_exe` from
//! `SOFTWARE\SAMP`, so the shared namespace has to live there on Windows.

use std::io;

use log::debug;
use winreg::RegKey;
use winreg::enums::HKEY_CURRENT_USER;

use super::{KeyValueStore, Namespace, SHARED_NAMESPACE, StoreError, sanitize};

#[derive(Clone, Debug)]
pub struct RegistryStore {
    launcher_key: String,
    shared_key: String,
}

impl RegistryStore {
    pub fn new(product_name: &str) -> Self {
        Self::with_keys(
            format!(r"SOFTWARE\{}", sanitize(product_name)),
            format!(r"SOFTWARE\{SHARED_NAMESPACE}"),
        )
    }

    fn with_keys(launcher_key: String, shared_key: String) -> Self {
        Self {
            launcher_key,
            shared_key,
        }
    }

    fn key(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Launcher => &self.launcher_key,
            Namespace::Shared => &self.shared_key,
        }
    }
}

impl KeyValueStore for RegistryStore {
    fn get_string(&self, namespace: Namespace, key: &str) -> Result<Option<String>, StoreError> {
        let unavailable = |err: io::Error| StoreError::Unavailable {
            namespace,
            message: format!(r"HKCU\{}\{key}: {err}", self.key(namespace)),
        };
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let subkey = match hkcu.open_subkey(self.key(namespace)) {
            Ok(subkey) => subkey,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(unavailable(err)),
        };
        match subkey.get_value::<String, _>(key) {
            Ok(value) => Ok(Some(value.trim().to_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(unavailable(err)),
        }
    }

    /// A single `set_value` per write, so the old value survives a failed write.
    fn set_string(
        &mut self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let path = self.key(namespace);
        let unavailable = |err: io::Error| StoreError::Unavailable {
            namespace,
            message: format!(r"HKCU\{path}\{key}: {err}"),
        };
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (subkey, _) = hkcu.create_subkey(path).map_err(unavailable)?;
        subkey.set_value(key, &value.trim()).map_err(unavailable)?;
        debug!("storage: HKCU\\{path}\\{key} updated");
        Ok(())
    }
}
