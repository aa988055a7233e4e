use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::archive::{self, ArchiveError};
use crate::assets::{self, ManifestAssets};
use crate::engine::models::{Manifest, ServerEndpoint};
use crate::engine::state::{LauncherEvent, Notice, UpdateOutcome, UpdateState, UserAction};
use crate::env::Layout;
use crate::integrity::{self, HashAlgorithm, IntegrityError};
use crate::locator::{self, GAME_EXECUTABLE};
use crate::networking::probe::{self, DEFAULT_PROBE_TIMEOUT, ServerStatus};
use crate::networking::{FetchError, NetworkClient, Timeouts};
use crate::process::ProcessLauncher;
use crate::storage::{self, DEFAULT_PRODUCT_NAME, KeyValueStore, StateStore};
use crate::transfer::{TransferError, TransferEvent, TransferManager};
use crate::util::file_name_from_url;

pub mod models;
pub mod state;

const DEFAULT_ARCHIVE_NAME: &str = "download.zip";
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(15);
const NO_SERVER: &str = "no server configured";
const TRANSFER_QUEUE: usize = 64;
const WORKER_QUEUE: usize = 8;

/// Resolved launcher settings.
#[derive(Clone, Debug)]
pub struct LauncherConfig {
    pub manifest_url: String,
    pub layout: Layout,
    /// Launcher namespace name; the server hostname is used when unset.
    pub product_name: Option<String>,
    pub probe_timeout: Duration,
    pub timeouts: Timeouts,
    pub status_interval: Duration,
}

impl LauncherConfig {
    pub fn new(manifest_url: impl Into<String>, layout: Layout) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            layout,
            product_name: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            timeouts: Timeouts::default(),
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

/// A running controller plus what was learned while starting it.
pub struct Session {
    pub handle: LauncherHandle,
    pub events: mpsc::UnboundedReceiver<LauncherEvent>,
    pub manifest: Option<Manifest>,
    pub assets: ManifestAssets,
    pub product_name: String,
}

/// Fetch the manifest, probe its server, open the state store and start the controller.
/// Nothing here is fatal: a missing manifest only means the first check fetches it again.
pub async fn start_session(config: &LauncherConfig) -> Session {
    if let Err(err) = config.layout.ensure_dirs() {
        warn!(
            "bootstrap: could not create {}: {err}",
            config.layout.root().display()
        );
    }
    let network = NetworkClient::new(config.timeouts);
    let manifest = match network.fetch_manifest(&config.manifest_url).await {
        Ok(manifest) => {
            info!("bootstrap: remote version {}", manifest.version);
            Some(manifest)
        }
        Err(err) => {
            warn!("bootstrap: manifest unavailable: {err}");
            None
        }
    };
    let status = match &manifest {
        Some(manifest) => {
            let server = &manifest.server_game;
            probe::probe(&server.ip, server.port, config.probe_timeout).await
        }
        None => ServerStatus::offline(NO_SERVER),
    };

    let settings_dir = config.layout.settings_dir();
    let remembered = storage::last_product_name(&settings_dir);
    let product_name =
        resolve_product_name(config.product_name.as_deref(), &status, remembered.as_deref());
    info!("bootstrap: settings namespace {product_name:?}");
    if remembered.as_deref() != Some(product_name.as_str())
        && let Err(err) = storage::remember_product_name(&settings_dir, &product_name)
    {
        warn!("bootstrap: could not remember settings namespace: {err}");
    }
    let store = StateStore::new(storage::native_store(&settings_dir, &product_name));

    let assets = match &manifest {
        Some(manifest) => {
            assets::refresh_manifest_assets(network.http(), &config.layout.assets_dir(), manifest)
                .await
        }
        None => ManifestAssets::default(),
    };

    let (handle, events) = spawn(config, network, store, manifest.clone(), status);
    Session {
        handle,
        events,
        manifest,
        assets,
        product_name,
    }
}

/// Configured name, else the live server hostname, else the name the last session used.
fn resolve_product_name(
    configured: Option<&str>,
    status: &ServerStatus,
    remembered: Option<&str>,
) -> String {
    let configured = configured.map(str::trim).filter(|name| !name.is_empty());
    let probed = Some(status.hostname.trim()).filter(|name| status.online && !name.is_empty());
    configured
        .or(probed)
        .or(remembered)
        .unwrap_or(DEFAULT_PRODUCT_NAME)
        .to_owned()
}

/// Start the controller and its status prober on the current runtime.
pub fn spawn<S>(
    config: &LauncherConfig,
    network: NetworkClient,
    store: StateStore<S>,
    manifest: Option<Manifest>,
    status: ServerStatus,
) -> (LauncherHandle, mpsc::UnboundedReceiver<LauncherEvent>)
where
    S: KeyValueStore + 'static,
{
    let (action_tx, action_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (transfer_tx, transfer_rx) = mpsc::channel(TRANSFER_QUEUE);
    let (worker_tx, worker_rx) = mpsc::channel(WORKER_QUEUE);
    let (status_tx, status_rx) = watch::channel(status);
    let (endpoint_tx, endpoint_rx) =
        watch::channel(manifest.as_ref().map(|m| m.server_game.clone()));
    let refresh = Arc::new(Notify::new());

    tokio::spawn(run_prober(
        endpoint_rx,
        status_tx,
        refresh.clone(),
        config.status_interval,
        config.probe_timeout,
    ));

    let engine = LauncherEngine {
        state: UpdateState::Idle,
        transfers: TransferManager::new(network.http().clone()),
        network,
        store,
        process: ProcessLauncher::default(),
        layout: config.layout.clone(),
        manifest_url: config.manifest_url.clone(),
        manifest,
        attempt: None,
        status: status_rx.clone(),
        endpoint: endpoint_tx,
        events: event_tx,
        worker_tx,
        transfer_tx,
    };
    tokio::spawn(engine.run(action_rx, transfer_rx, worker_rx));

    let handle = LauncherHandle {
        actions: action_tx,
        status: status_rx,
        refresh,
    };
    (handle, event_rx)
}

/// What the presentation layer holds on to. Cheap to clone.
#[derive(Clone)]
pub struct LauncherHandle {
    actions: mpsc::UnboundedSender<UserAction>,
    status: watch::Receiver<ServerStatus>,
    refresh: Arc<Notify>,
}

impl LauncherHandle {
    pub fn check_for_update(&self) {
        self.send(UserAction::CheckForUpdate);
    }

    pub fn start_connect(&self, player_name: impl Into<String>) {
        self.send(UserAction::StartConnect {
            player_name: player_name.into(),
        });
    }

    pub fn save_settings(&self, player_name: impl Into<String>) {
        self.send(UserAction::SaveSettings {
            player_name: player_name.into(),
        });
    }

    pub fn cancel_download(&self) {
        self.send(UserAction::CancelDownload);
    }

    /// Ask the prober for a fresh snapshot now instead of at the next interval.
    pub fn refresh_status(&self) {
        self.refresh.notify_one();
    }

    pub fn server_status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    fn send(&self, action: UserAction) {
        if self.actions.send(action).is_err() {
            warn!("engine: controller has stopped; action dropped");
        }
    }
}

async fn run_prober(
    mut endpoint: watch::Receiver<Option<ServerEndpoint>>,
    status: watch::Sender<ServerStatus>,
    refresh: Arc<Notify>,
    interval: Duration,
    wait: Duration,
) {
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = refresh.notified() => {}
            changed = endpoint.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let target = endpoint.borrow_and_update().clone();
        let snapshot = match target {
            Some(server) => probe::probe(&server.ip, server.port, wait).await,
            None => ServerStatus::offline(NO_SERVER),
        };
        if status.send(snapshot).is_err() {
            break;
        }
    }
    debug!("probe: status worker stopped");
}

/// Results handed back by blocking and network workers.
#[derive(Debug)]
enum WorkerEvent {
    Manifest(Result<Manifest, FetchError>),
    Verified(Result<String, IntegrityError>),
    Extracted(Result<PathBuf, ArchiveError>),
    Located {
        root: PathBuf,
        found: Option<PathBuf>,
    },
}

/// The update currently being carried out.
#[derive(Clone, Debug)]
struct Attempt {
    version: String,
    expected_sha256: String,
    archive: PathBuf,
    install_dir: PathBuf,
}

struct LauncherEngine<S> {
    state: UpdateState,
    network: NetworkClient,
    store: StateStore<S>,
    transfers: TransferManager,
    process: ProcessLauncher,
    layout: Layout,
    manifest_url: String,
    manifest: Option<Manifest>,
    attempt: Option<Attempt>,
    status: watch::Receiver<ServerStatus>,
    endpoint: watch::Sender<Option<ServerEndpoint>>,
    events: mpsc::UnboundedSender<LauncherEvent>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    transfer_tx: mpsc::Sender<TransferEvent>,
}

impl<S: KeyValueStore> LauncherEngine<S> {
    async fn run(
        mut self,
        mut actions: mpsc::UnboundedReceiver<UserAction>,
        mut transfers: mpsc::Receiver<TransferEvent>,
        mut workers: mpsc::Receiver<WorkerEvent>,
    ) {
        debug!("engine: ready");
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action),
                    None => break,
                },
                Some(event) = transfers.recv() => self.on_transfer(event),
                Some(event) = workers.recv() => self.on_worker(event),
            }
        }
        self.transfers.cancel();
        debug!("engine: stopped");
    }

    fn handle_action(&mut self, action: UserAction) {
        match action {
            UserAction::CheckForUpdate => self.check_for_update(),
            UserAction::CancelDownload => self.cancel_download(),
            UserAction::StartConnect { player_name } => self.start_connect(&player_name),
            UserAction::SaveSettings { player_name } => self.save_settings(&player_name),
        }
    }

    fn emit(&self, event: LauncherEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, notice: Notice) {
        warn!("engine: {notice}");
        self.emit(LauncherEvent::Notice(notice));
    }

    fn set_state(&mut self, state: UpdateState) {
        debug!("engine: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(LauncherEvent::State(state));
    }

    /// Report the end of an attempt and go back to rest.
    fn finish(&mut self, outcome: UpdateOutcome) {
        debug_assert!(outcome.state().is_terminal());
        if outcome.is_success() {
            info!("update: {outcome}");
        } else {
            warn!("update: {outcome}");
        }
        self.attempt = None;
        self.set_state(outcome.state());
        self.emit(LauncherEvent::Outcome(outcome));
        self.set_state(UpdateState::Idle);
    }

    /// The running attempt, if the workflow is still at `expected`.
    fn attempt_at(&self, expected: UpdateState) -> Option<Attempt> {
        if self.state != expected {
            debug!(
                "engine: stale worker result for {expected:?} while {:?}",
                self.state
            );
            return None;
        }
        self.attempt.clone()
    }

    fn check_for_update(&mut self) {
        if self.state != UpdateState::Idle {
            self.notice(Notice::UpdateInProgress);
            return;
        }
        info!("action: CheckForUpdate");
        self.set_state(UpdateState::CheckingVersion);
        match self.manifest.clone() {
            Some(manifest) => self.compare_versions(manifest),
            None => self.fetch_manifest(),
        }
    }

    fn fetch_manifest(&self) {
        let network = self.network.clone();
        let url = self.manifest_url.clone();
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let result = network.fetch_manifest(&url).await;
            let _ = tx.send(WorkerEvent::Manifest(result)).await;
        });
    }

    fn compare_versions(&mut self, manifest: Manifest) {
        let remote = manifest.version.trim().to_owned();
        let installed = self.store.version();
        if installed.as_deref() == Some(remote.as_str()) {
            self.finish(UpdateOutcome::UpToDate { version: remote });
            return;
        }
        info!(
            "update: installed {} remote {remote}",
            installed.as_deref().unwrap_or("none")
        );
        self.begin_download(&manifest, remote);
    }

    fn begin_download(&mut self, manifest: &Manifest, version: String) {
        let url = manifest.game.download_url.trim();
        let archive = self
            .layout
            .downloads_dir()
            .join(file_name_from_url(url, DEFAULT_ARCHIVE_NAME));
        if self
            .transfers
            .start(url, &archive, self.transfer_tx.clone())
            .is_none()
        {
            self.finish(UpdateOutcome::DownloadFailed(TransferError::Busy));
            return;
        }
        self.attempt = Some(Attempt {
            install_dir: self.layout.game_version_dir(&version),
            version,
            expected_sha256: manifest.game.sha256.trim().to_owned(),
            archive,
        });
        self.set_state(UpdateState::Downloading);
    }

    fn cancel_download(&mut self) {
        if self.state != UpdateState::Downloading {
            self.notice(Notice::NothingToCancel);
            return;
        }
        warn!("action: CancelDownload");
        self.transfers.cancel();
    }

    fn on_transfer(&mut self, event: TransferEvent) {
        if self.state != UpdateState::Downloading {
            debug!("engine: ignoring {event:?} while {:?}", self.state);
            return;
        }
        match event {
            TransferEvent::Progress(percent) => self.emit(LauncherEvent::Progress(percent)),
            TransferEvent::Completed(archive) => self.verify(archive),
            TransferEvent::Failed(err) => self.finish(UpdateOutcome::DownloadFailed(err)),
            TransferEvent::Canceled => self.finish(UpdateOutcome::DownloadCanceled),
        }
    }

    fn verify(&mut self, archive: PathBuf) {
        let Some(attempt) = self.attempt.clone() else {
            return;
        };
        self.set_state(UpdateState::Verifying);
        let path = archive.clone();
        self.run_blocking(
            move || integrity::verify_file(&archive, HashAlgorithm::Sha256, &attempt.expected_sha256),
            move |joined| {
                WorkerEvent::Verified(joined.unwrap_or_else(|err| {
                    Err(IntegrityError::HashComputationFailed {
                        path,
                        message: err.to_string(),
                    })
                }))
            },
        );
    }

    fn extract(&mut self, attempt: Attempt) {
        self.set_state(UpdateState::Extracting);
        let fallback = attempt.install_dir.clone();
        self.run_blocking(
            move || {
                let dest = &attempt.install_dir;
                let result = prepare_install_dir(dest)
                    .and_then(|()| archive::extract(&attempt.archive, dest));
                if result.is_err() {
                    let _ = fs::remove_dir_all(dest);
                }
                remove_archive(&attempt.archive);
                result
            },
            move |joined| {
                WorkerEvent::Extracted(joined.unwrap_or_else(|err| {
                    Err(ArchiveError::Io {
                        path: fallback,
                        message: err.to_string(),
                    })
                }))
            },
        );
    }

    fn locate(&mut self, root: PathBuf) {
        self.set_state(UpdateState::Locating);
        let searched = root.clone();
        self.run_blocking(
            move || locator::find_executable(&root, GAME_EXECUTABLE),
            move |joined| WorkerEvent::Located {
                root: searched,
                found: joined.ok().flatten(),
            },
        );
    }

    /// Path first, version second: a version is never recorded without a valid path.
    fn persist(&mut self, attempt: Attempt, executable: &Path) {
        let executable = match self.store.save_install_path(executable) {
            Ok(path) => path,
            Err(err) => {
                self.finish(UpdateOutcome::PersistFailed(err));
                return;
            }
        };
        if let Err(err) = self.store.set_version(&attempt.version) {
            self.finish(UpdateOutcome::PersistFailed(err));
            return;
        }
        self.finish(UpdateOutcome::Installed {
            version: attempt.version,
            executable,
        });
    }

    fn on_worker(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Manifest(result) => {
                if self.state != UpdateState::CheckingVersion {
                    debug!("engine: stale manifest result while {:?}", self.state);
                    return;
                }
                match result {
                    Ok(manifest) => {
                        info!("manifest: remote version {}", manifest.version);
                        self.endpoint
                            .send_replace(Some(manifest.server_game.clone()));
                        self.manifest = Some(manifest.clone());
                        self.emit(LauncherEvent::ManifestLoaded(Box::new(manifest.clone())));
                        self.compare_versions(manifest);
                    }
                    Err(err) => self.finish(UpdateOutcome::ManifestUnavailable(err)),
                }
            }
            WorkerEvent::Verified(result) => {
                let Some(attempt) = self.attempt_at(UpdateState::Verifying) else {
                    return;
                };
                match result {
                    Ok(digest) => {
                        info!("verify: sha256 {digest} matches");
                        self.extract(attempt);
                    }
                    Err(err) => {
                        remove_archive(&attempt.archive);
                        self.finish(UpdateOutcome::VerifyFailed(err));
                    }
                }
            }
            WorkerEvent::Extracted(result) => {
                if self.attempt_at(UpdateState::Extracting).is_none() {
                    return;
                }
                match result {
                    Ok(root) => self.locate(root),
                    Err(err) => self.finish(UpdateOutcome::ExtractFailed(err)),
                }
            }
            WorkerEvent::Located { root, found } => {
                let Some(attempt) = self.attempt_at(UpdateState::Locating) else {
                    return;
                };
                match found {
                    Some(executable) => self.persist(attempt, &executable),
                    None => self.finish(UpdateOutcome::LocateFailed { searched: root }),
                }
            }
        }
    }

    fn run_blocking<T, F, W>(&self, job: F, wrap: W)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        W: FnOnce(Result<T, JoinError>) -> WorkerEvent + Send + 'static,
    {
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(job).await;
            let _ = tx.send(wrap(joined)).await;
        });
    }

    fn save_settings(&mut self, player_name: &str) {
        match self.store.save_player_name(player_name) {
            Ok(saved) => {
                info!("settings: player name {saved:?} saved");
                self.emit(LauncherEvent::SettingsSaved(saved));
            }
            Err(err) => self.notice(Notice::Settings(err)),
        }
    }

    fn start_connect(&mut self, player_name: &str) {
        if self.state != UpdateState::Idle {
            self.notice(Notice::UpdateInProgress);
            return;
        }
        if player_name.trim().is_empty() {
            self.notice(Notice::PlayerNameRequired);
            return;
        }
        let Some(endpoint) = self.manifest.as_ref().map(|m| m.server_game.clone()) else {
            self.notice(Notice::ManifestMissing);
            return;
        };
        if !self.status.borrow().online {
            self.notice(Notice::ServerOffline);
            return;
        }
        let Some(executable) = self.store.install_path() else {
            self.notice(Notice::NotInstalled);
            return;
        };
        if let Err(err) = self.store.save_player_name(player_name) {
            self.notice(Notice::Settings(err));
            return;
        }
        info!("action: StartConnect to {}", endpoint.connect_arg());
        match self.process.launch(&executable, &endpoint) {
            Ok(pid) => self.emit(LauncherEvent::Launched { pid }),
            Err(err) => self.notice(Notice::Launch(err)),
        }
    }
}

fn prepare_install_dir(dest: &Path) -> Result<(), ArchiveError> {
    if dest.exists() {
        debug!("extract: clearing {}", dest.display());
        fs::remove_dir_all(dest).map_err(|e| ArchiveError::Io {
            path: dest.to_path_buf(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn remove_archive(archive: &Path) {
    match fs::remove_file(archive) {
        Ok(()) => debug!("engine: removed {}", archive.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("engine: could not remove {}: {err}", archive.display()),
    }
}
