use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

pub const GAME_EXECUTABLE: &str = "gta_sa.exe";

/// First regular file named `target` under `root`, walking in name order.
/// Unreadable subtrees are skipped.
pub fn find_executable(root: &Path, target: &str) -> Option<PathBuf> {
    if !root.exists() {
        return None;
    }
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("locator: skipping unreadable entry: {err}");
                None
            }
        });

    for entry in walker {
        if entry.file_type().is_file() && file_name_matches(entry.path(), target) {
            let found = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            debug!("locator: found {}", found.display());
            return Some(found);
        }
    }
    debug!("locator: {target} not found under {}", root.display());
    None
}

fn file_name_matches(path: &Path, target: &str) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if cfg!(target_os = "windows") {
        name.eq_ignore_ascii_case(target)
    } else {
        name == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_single_match_at_depth_three() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a").join("b").join("c");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(GAME_EXECUTABLE), b"MZ").unwrap();
        fs::write(tmp.path().join("a").join("readme.txt"), b"hi").unwrap();

        let found = find_executable(tmp.path(), GAME_EXECUTABLE).unwrap();
        assert_eq!(found, dir.join(GAME_EXECUTABLE).canonicalize().unwrap());
    }

    #[test]
    fn empty_tree_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(find_executable(tmp.path(), GAME_EXECUTABLE), None);
        assert_eq!(
            find_executable(&tmp.path().join("missing"), GAME_EXECUTABLE),
            None
        );
    }

    #[test]
    fn directories_with_target_name_do_not_match() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(GAME_EXECUTABLE)).unwrap();
        assert_eq!(find_executable(tmp.path(), GAME_EXECUTABLE), None);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subtrees_are_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("a_locked");
        fs::create_dir_all(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let open = tmp.path().join("b_open");
        fs::create_dir_all(&open).unwrap();
        fs::write(open.join(GAME_EXECUTABLE), b"MZ").unwrap();

        let found = find_executable(tmp.path(), GAME_EXECUTABLE);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(found, Some(open.join(GAME_EXECUTABLE).canonicalize().unwrap()));
    }
}
