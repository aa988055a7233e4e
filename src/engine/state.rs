use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::engine::models::Manifest;
use crate::integrity::IntegrityError;
use crate::networking::FetchError;
use crate::process::LaunchError;
use crate::storage::StoreError;
use crate::transfer::TransferError;

/// Where the update workflow currently is. `Idle` is both the start and the resting state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingVersion,
    UpToDate,
    Downloading,
    Verifying,
    VerifyFailed,
    Extracting,
    ExtractFailed,
    Locating,
    LocateFailed,
    Installed,
    DownloadFailed,
    DownloadCanceled,
    PersistFailed,
    ManifestUnavailable,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::UpToDate
                | UpdateState::VerifyFailed
                | UpdateState::ExtractFailed
                | UpdateState::LocateFailed
                | UpdateState::Installed
                | UpdateState::DownloadFailed
                | UpdateState::DownloadCanceled
                | UpdateState::PersistFailed
                | UpdateState::ManifestUnavailable
        )
    }
}

// Requests from the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserAction {
    CheckForUpdate,
    CancelDownload,
    StartConnect { player_name: String },
    SaveSettings { player_name: String },
}

/// How one update attempt ended. Exactly one is emitted per attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Installed { version: String, executable: PathBuf },
    ManifestUnavailable(FetchError),
    DownloadFailed(TransferError),
    DownloadCanceled,
    VerifyFailed(IntegrityError),
    ExtractFailed(ArchiveError),
    LocateFailed { searched: PathBuf },
    PersistFailed(StoreError),
}

impl UpdateOutcome {
    pub fn state(&self) -> UpdateState {
        match self {
            UpdateOutcome::UpToDate { .. } => UpdateState::UpToDate,
            UpdateOutcome::Installed { .. } => UpdateState::Installed,
            UpdateOutcome::ManifestUnavailable(_) => UpdateState::ManifestUnavailable,
            UpdateOutcome::DownloadFailed(_) => UpdateState::DownloadFailed,
            UpdateOutcome::DownloadCanceled => UpdateState::DownloadCanceled,
            UpdateOutcome::VerifyFailed(_) => UpdateState::VerifyFailed,
            UpdateOutcome::ExtractFailed(_) => UpdateState::ExtractFailed,
            UpdateOutcome::LocateFailed { .. } => UpdateState::LocateFailed,
            UpdateOutcome::PersistFailed(_) => UpdateState::PersistFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::UpToDate { .. } | UpdateOutcome::Installed { .. }
        )
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::UpToDate { version } => write!(f, "version {version} is up to date"),
            UpdateOutcome::Installed {
                version,
                executable,
            } => write!(f, "installed version {version} at {}", executable.display()),
            UpdateOutcome::ManifestUnavailable(err) => {
                write!(f, "could not read the release manifest: {err}")
            }
            UpdateOutcome::DownloadFailed(err) => write!(f, "download failed: {err}"),
            UpdateOutcome::DownloadCanceled => f.write_str("download canceled"),
            UpdateOutcome::VerifyFailed(err) => write!(f, "package verification failed: {err}"),
            UpdateOutcome::ExtractFailed(err) => write!(f, "extraction failed: {err}"),
            UpdateOutcome::LocateFailed { searched } => write!(
                f,
                "game executable not found under {}",
                searched.display()
            ),
            UpdateOutcome::PersistFailed(err) => write!(f, "could not save install state: {err}"),
        }
    }
}

/// A request that was refused or could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Notice {
    #[error("an update is already in progress")]
    UpdateInProgress,
    #[error("no download is running")]
    NothingToCancel,
    #[error("enter a player name first")]
    PlayerNameRequired,
    #[error("the server is offline")]
    ServerOffline,
    #[error("the game is not installed; check for updates first")]
    NotInstalled,
    #[error("no server address is known yet")]
    ManifestMissing,
    #[error("settings not saved: {0}")]
    Settings(StoreError),
    #[error("launch failed: {0}")]
    Launch(LaunchError),
}

/// Everything the controller reports to its subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LauncherEvent {
    State(UpdateState),
    Progress(u8),
    Outcome(UpdateOutcome),
    ManifestLoaded(Box<Manifest>),
    SettingsSaved(String),
    Launched { pid: u32 },
    Notice(Notice),
}
