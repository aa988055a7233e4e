use std::fs;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::engine::models::Manifest;
use crate::util::file_name_from_url;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "ico"];
pub const BACKGROUND_STEM: &str = "background";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("request for {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} is not an image (content type {content_type:?})")]
    NotAnImage { url: String, content_type: String },
    #[error("file error at {path}: {message}")]
    Filesystem { path: PathBuf, message: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Download an image into `folder` without overwriting anything already there.
/// The name comes from `filename` or the URL, stripped of directory parts.
pub async fn save_image_from_url(
    client: &Client,
    url: &str,
    folder: &Path,
    filename: Option<&str>,
) -> Result<PathBuf, AssetError> {
    let fs_err = |path: &Path, e: std::io::Error| AssetError::Filesystem {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let request_err = |e: reqwest::Error| AssetError::Request {
        url: url.to_owned(),
        message: e.to_string(),
    };

    fs::create_dir_all(folder).map_err(|e| fs_err(folder, e))?;
    let name = filename
        .map(str::to_owned)
        .unwrap_or_else(|| file_name_from_url(url, "downloaded_image.png"));
    let name = Path::new(&name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unnamed_image.png".to_owned());

    let response = client
        .get(url)
        .send()
        .await
        .map_err(request_err)?
        .error_for_status()
        .map_err(request_err)?;

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !content_type.contains("image") && !has_image_extension(&name) {
        return Err(AssetError::NotAnImage {
            url: url.to_owned(),
            content_type,
        });
    }

    let path = unique_path(folder, &name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| fs_err(&path, e))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(request_err(err));
            }
        };
        file.write_all(&chunk).await.map_err(|e| fs_err(&path, e))?;
    }
    file.flush().await.map_err(|e| fs_err(&path, e))?;
    info!("assets: saved {}", path.display());
    Ok(path)
}

/// Delete every regular file in `folder` whose stem is not `keep_stem`.
pub fn clean_assets(folder: &Path, keep_stem: &str) -> CleanReport {
    let mut report = CleanReport::default();
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("assets: nothing to clean in {}: {err}", folder.display());
            return report;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        if path.file_stem().is_some_and(|stem| stem == keep_stem) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.deleted += 1,
            Err(err) => {
                warn!("assets: could not delete {}: {err}", path.display());
                report.failed += 1;
            }
        }
    }
    if report.deleted > 0 || report.failed > 0 {
        info!(
            "assets: cleaned {} (deleted {}, failed {})",
            folder.display(),
            report.deleted,
            report.failed
        );
    }
    report
}

/// Local copies of the images a manifest points at.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestAssets {
    pub background: Option<PathBuf>,
    pub icon: Option<PathBuf>,
}

/// Clear stale assets and download the manifest's background and server icon.
/// Failures are logged and leave the corresponding entry empty.
pub async fn refresh_manifest_assets(
    client: &Client,
    folder: &Path,
    manifest: &Manifest,
) -> ManifestAssets {
    clean_assets(folder, BACKGROUND_STEM);
    let background_name = background_file_name(&manifest.background_image);
    ManifestAssets {
        background: fetch_optional(
            client,
            &manifest.background_image,
            folder,
            Some(&background_name),
        )
        .await,
        icon: fetch_optional(client, &manifest.icon_server, folder, None).await,
    }
}

async fn fetch_optional(
    client: &Client,
    url: &str,
    folder: &Path,
    filename: Option<&str>,
) -> Option<PathBuf> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    match save_image_from_url(client, url, folder, filename).await {
        Ok(path) => Some(path),
        Err(err) => {
            warn!("assets: {err}");
            None
        }
    }
}

fn background_file_name(url: &str) -> String {
    let from_url = file_name_from_url(url, "background.png");
    let ext = Path::new(&from_url)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "png".to_owned());
    format!("{BACKGROUND_STEM}.{ext}")
}

fn has_image_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// `name`, or `stem(1).ext`, `stem(2).ext`, ... whichever is free first.
fn unique_path(folder: &Path, name: &str) -> PathBuf {
    let candidate = folder.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| folder.join(format!("{stem}({n}){ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
