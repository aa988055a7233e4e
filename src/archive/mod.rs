use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;
use zip::read::ZipArchive;
use zip::result::ZipError;

pub mod rar;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    #[error("unsupported archive format {0:?} (expected .zip or .rar)")]
    UnsupportedFormat(String),
    #[error("archive not found: {0}")]
    SourceMissing(PathBuf),
    #[error("corrupt archive member {member}: {message}")]
    Corrupt { member: String, message: String },
    #[error("not a readable archive: {0}")]
    Invalid(String),
    #[error("extraction produced no files in {0}")]
    EmptyResult(PathBuf),
    #[error("no RAR decoder found (install one of: {0})")]
    MissingDecoder(String),
    #[error("RAR decoder failed: {0}")]
    Decoder(String),
    #[error("permission denied at {path}: {message}")]
    PermissionDenied { path: PathBuf, message: String },
    #[error("I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl ArchiveError {
    fn io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::PermissionDenied => ArchiveError::PermissionDenied { path, message },
            io::ErrorKind::NotFound => ArchiveError::SourceMissing(path),
            _ => ArchiveError::Io { path, message },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Result<Self, ArchiveError> {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "zip" => Ok(ArchiveKind::Zip),
            "rar" | "cbr" => Ok(ArchiveKind::Rar),
            _ => Err(ArchiveError::UnsupportedFormat(format!(".{ext}"))),
        }
    }
}

/// Extract `archive` into `dest` and return `dest`. Blocking; run it off the async path.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
    extract_with(archive, dest, rar::DEFAULT_DECODERS)
}

pub(crate) fn extract_with(
    archive: &Path,
    dest: &Path,
    rar_decoders: &[rar::Decoder],
) -> Result<PathBuf, ArchiveError> {
    let kind = ArchiveKind::from_path(archive)?;
    if !archive.is_file() {
        return Err(ArchiveError::SourceMissing(archive.to_path_buf()));
    }
    fs::create_dir_all(dest).map_err(|e| ArchiveError::io(dest, e))?;
    info!(
        "archive: extracting {} as {:?} into {}",
        archive.display(),
        kind,
        dest.display()
    );

    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest)?,
        ArchiveKind::Rar => rar::extract(archive, dest, rar_decoders)?,
    }

    let mut entries = fs::read_dir(dest).map_err(|e| ArchiveError::io(dest, e))?;
    if entries.next().is_none() {
        warn!("archive: {} is empty after extraction", dest.display());
        return Err(ArchiveError::EmptyResult(dest.to_path_buf()));
    }
    Ok(dest.to_path_buf())
}

fn open_zip(archive_path: &Path) -> Result<ZipArchive<fs::File>, ArchiveError> {
    let file = fs::File::open(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    ZipArchive::new(file).map_err(|e| ArchiveError::Invalid(e.to_string()))
}

/// Read every member to the end so CRC checks run, naming the first bad one.
fn test_zip(archive: &mut ZipArchive<fs::File>) -> Result<(), ArchiveError> {
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ArchiveError::Corrupt {
            member: format!("#{i}"),
            message: e.to_string(),
        })?;
        if entry.is_dir() {
            continue;
        }
        let member = entry.name().to_owned();
        io::copy(&mut entry, &mut io::sink()).map_err(|e| ArchiveError::Corrupt {
            member,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let mut archive = open_zip(archive_path)?;
    test_zip(&mut archive)?;
    debug!("archive: {} members passed CRC checks", archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| zip_member_error(i, e))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("archive: skipping unsafe member path {:?}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| ArchiveError::io(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        let mut out_file =
            fs::File::create(&out_path).map_err(|e| ArchiveError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| ArchiveError::io(&out_path, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

fn zip_member_error(index: usize, err: ZipError) -> ArchiveError {
    ArchiveError::Corrupt {
        member: format!("#{index}"),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_zip, zip_bytes};

    #[test]
    fn extracts_nested_members() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("game.zip");
        write_zip(
            &archive,
            &[
                ("GTA San Andreas/", b""),
                ("GTA San Andreas/gta_sa.exe", b"MZ"),
                ("GTA San Andreas/models/gta3.img", b"img"),
            ],
        );
        let dest = tmp.path().join("out");
        assert_eq!(extract(&archive, &dest).unwrap(), dest);
        assert_eq!(
            fs::read(dest.join("GTA San Andreas").join("gta_sa.exe")).unwrap(),
            b"MZ"
        );
        assert!(dest.join("GTA San Andreas/models/gta3.img").is_file());
    }

    #[test]
    fn zero_entry_zip_is_empty_result() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("empty.zip");
        write_zip(&archive, &[]);
        let dest = tmp.path().join("out");
        assert_eq!(
            extract(&archive, &dest),
            Err(ArchiveError::EmptyResult(dest.clone()))
        );
    }

    #[test]
    fn unsafe_only_members_are_empty_result() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x")]);
        let dest = tmp.path().join("out");
        assert!(matches!(
            extract(&archive, &dest),
            Err(ArchiveError::EmptyResult(_))
        ));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn names_first_corrupt_member() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bad.zip");
        let payload = b"this payload will be damaged";
        let mut bytes = zip_bytes(&[("ok.txt", b"fine"), ("broken.txt", payload)]);
        let at = bytes
            .windows(payload.len())
            .position(|w| w == payload)
            .unwrap();
        bytes[at] ^= 0xff;
        fs::write(&archive, bytes).unwrap();

        let dest = tmp.path().join("out");
        match extract(&archive, &dest) {
            Err(ArchiveError::Corrupt { member, .. }) => assert_eq!(member, "broken.txt"),
            other => panic!("expected corrupt archive, got {other:?}"),
        }
        assert!(!dest.join("ok.txt").exists());
    }

    #[test]
    fn garbage_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("junk.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        assert!(matches!(
            extract(&archive, &tmp.path().join("out")),
            Err(ArchiveError::Invalid(_))
        ));
    }

    #[test]
    fn classifies_format_and_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("out");
        assert_eq!(
            extract(&tmp.path().join("game.7z"), &dest),
            Err(ArchiveError::UnsupportedFormat(".7z".into()))
        );
        assert_eq!(
            extract(&tmp.path().join("game.zip"), &dest),
            Err(ArchiveError::SourceMissing(tmp.path().join("game.zip")))
        );
        assert_eq!(ArchiveKind::from_path(Path::new("a.CBR")), Ok(ArchiveKind::Rar));
    }
}
