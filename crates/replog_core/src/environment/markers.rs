//! Small state files of the environment: generation id, offline state and
//! rotation time markers, and the atomic write they all go through.

use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const GENERATION_ID_FILE_PREFIX: &str = "generation";
const GENERATION_ID_FILE_SUFFIX: &str = ".id";
const ROTATION_TIME_FILE_PREFIX: &str = "rotationtime";
const ROTATION_TIME_FILE_SUFFIX: &str = ".ms";
const TEMP_SUFFIX: &str = ".tmp";

/// Name of the file marking a replica offline.
pub const REPLICA_OFFLINE_STATE_FILENAME: &str = "offline.state";

/// Writes `contents` to `path` through a temporary file renamed over it, so
/// that a crash leaves either the old or the new content.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> ChangelogResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    let mut file = File::create(&temp).map_err(|e| ChangelogError::io("create", &temp, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| ChangelogError::io("write", &temp, e))?;
    drop(file);

    fs::rename(&temp, path).map_err(|e| ChangelogError::io("rename", &temp, e))?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

/// Makes the entries of `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_directory(dir: &Path) -> ChangelogResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| ChangelogError::io("sync directory", dir, e))
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_dir: &Path) -> ChangelogResult<()> {
    // NTFS journals metadata
    Ok(())
}

/// Lists `(path, value)` for the files of `dir` named `<prefix><value><suffix>`.
fn markers(dir: &Path, prefix: &str, suffix: &str) -> ChangelogResult<Vec<(PathBuf, String)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ChangelogError::io("list", dir, e)),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ChangelogError::io("list", dir, e))?;
        let name = entry.file_name();
        let Some(value) = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.strip_suffix(suffix))
        else {
            continue;
        };
        found.push((entry.path(), value.to_string()));
    }
    Ok(found)
}

fn remove_file(path: &Path) -> ChangelogResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChangelogError::io("delete", path, e)),
    }
}

fn parse_i64(path: &Path, value: &str) -> ChangelogResult<i64> {
    value.parse().map_err(|_| {
        ChangelogError::invalid_format(format!("invalid number in file name {}", path.display()))
    })
}

/// Reads the generation id of the domain stored in `domain_dir`.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed, holds a malformed
/// marker, or holds several markers.
pub(crate) fn read_generation_id(domain_dir: &Path) -> ChangelogResult<Option<i64>> {
    let found = markers(domain_dir, GENERATION_ID_FILE_PREFIX, GENERATION_ID_FILE_SUFFIX)?;
    match found.as_slice() {
        [] => Ok(None),
        [(path, value)] => parse_i64(path, value).map(Some),
        _ => Err(ChangelogError::invalid_format(format!(
            "several generation id files in {}",
            domain_dir.display()
        ))),
    }
}

/// Replaces the generation id marker of a domain.
///
/// An existing marker is renamed to the new one so that the domain holds a
/// marker at every point, even if the process dies midway.
pub(crate) fn write_generation_id(domain_dir: &Path, generation_id: i64) -> ChangelogResult<()> {
    let path = domain_dir.join(format!(
        "{GENERATION_ID_FILE_PREFIX}{generation_id}{GENERATION_ID_FILE_SUFFIX}"
    ));
    let mut found = markers(domain_dir, GENERATION_ID_FILE_PREFIX, GENERATION_ID_FILE_SUFFIX)?;
    let current = found.iter().position(|(old, _)| *old == path);
    let replaced = match current {
        Some(index) => Some(found.swap_remove(index).0),
        None => found.pop().map(|(old, _)| old),
    };
    match replaced {
        Some(old) if old != path => {
            fs::rename(&old, &path).map_err(|e| ChangelogError::io("rename", &old, e))?;
            sync_directory(domain_dir)?;
        }
        Some(_) => {}
        None => write_atomically(&path, b"")?,
    }
    for (stale, _) in found {
        remove_file(&stale)?;
    }
    Ok(())
}

/// Removes the generation id marker of a domain.
pub(crate) fn remove_generation_id(domain_dir: &Path) -> ChangelogResult<()> {
    for (old, _) in markers(domain_dir, GENERATION_ID_FILE_PREFIX, GENERATION_ID_FILE_SUFFIX)? {
        remove_file(&old)?;
    }
    Ok(())
}

/// Reads the CSN at which the replica stored in `server_dir` went offline.
pub(crate) fn read_offline_csn(server_dir: &Path) -> ChangelogResult<Option<Csn>> {
    let path = server_dir.join(REPLICA_OFFLINE_STATE_FILENAME);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ChangelogError::io("read", &path, e)),
    };
    let line = text.lines().next().unwrap_or_default().trim();
    line.parse().map(Some).map_err(|_| {
        ChangelogError::invalid_format(format!("invalid CSN '{line}' in {}", path.display()))
    })
}

/// Marks the replica stored in `server_dir` offline since `csn`.
pub(crate) fn write_offline_csn(server_dir: &Path, csn: &Csn) -> ChangelogResult<()> {
    write_atomically(
        &server_dir.join(REPLICA_OFFLINE_STATE_FILENAME),
        format!("{csn}\n").as_bytes(),
    )
}

/// Marks the replica stored in `server_dir` online.
pub(crate) fn remove_offline_csn(server_dir: &Path) -> ChangelogResult<()> {
    remove_file(&server_dir.join(REPLICA_OFFLINE_STATE_FILENAME))
}

/// Reads the last rotation time persisted in `dir`, the most recent one if
/// a crash left several markers.
pub(crate) fn read_rotation_time(dir: &Path) -> ChangelogResult<Option<i64>> {
    let mut latest = None;
    for (path, value) in markers(dir, ROTATION_TIME_FILE_PREFIX, ROTATION_TIME_FILE_SUFFIX)? {
        let time = parse_i64(&path, &value)?;
        latest = latest.max(Some(time));
    }
    Ok(latest)
}

/// Persists the last rotation time in `dir`, replacing the previous marker.
pub(crate) fn write_rotation_time(dir: &Path, time: i64) -> ChangelogResult<()> {
    let path = dir.join(format!(
        "{ROTATION_TIME_FILE_PREFIX}{time}{ROTATION_TIME_FILE_SUFFIX}"
    ));
    write_atomically(&path, b"")?;
    for (old, _) in markers(dir, ROTATION_TIME_FILE_PREFIX, ROTATION_TIME_FILE_SUFFIX)? {
        if old != path {
            remove_file(&old)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("domains.state");
        write_atomically(&path, b"1:dc=a\n").unwrap();
        write_atomically(&path, b"1:dc=b\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1:dc=b\n");
        assert!(!dir.path().join("domains.state.tmp").exists());
    }

    #[test]
    fn generation_id_replaced() {
        let dir = tempdir().unwrap();
        assert_eq!(read_generation_id(dir.path()).unwrap(), None);
        write_generation_id(dir.path(), 42).unwrap();
        assert!(dir.path().join("generation42.id").exists());
        write_generation_id(dir.path(), -1).unwrap();
        assert!(!dir.path().join("generation42.id").exists());
        assert_eq!(read_generation_id(dir.path()).unwrap(), Some(-1));
        remove_generation_id(dir.path()).unwrap();
        assert_eq!(read_generation_id(dir.path()).unwrap(), None);
    }

    #[test]
    fn generation_id_replacement_keeps_one_marker() {
        let dir = tempdir().unwrap();
        write_generation_id(dir.path(), 7).unwrap();
        write_generation_id(dir.path(), 8).unwrap();
        write_generation_id(dir.path(), 8).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["generation8.id".to_string()]);

        // leftovers of an interrupted replacement are cleaned up
        fs::write(dir.path().join("generation3.id"), b"").unwrap();
        write_generation_id(dir.path(), 9).unwrap();
        assert_eq!(read_generation_id(dir.path()).unwrap(), Some(9));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn several_generation_ids_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("generation1.id"), b"").unwrap();
        fs::write(dir.path().join("generation2.id"), b"").unwrap();
        assert!(read_generation_id(dir.path()).is_err());
    }

    #[test]
    fn offline_state_round_trip() {
        let dir = tempdir().unwrap();
        let csn = Csn::new(1_000, 3, 7);
        assert_eq!(read_offline_csn(dir.path()).unwrap(), None);
        write_offline_csn(dir.path(), &csn).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(REPLICA_OFFLINE_STATE_FILENAME)).unwrap(),
            format!("{csn}\n")
        );
        assert_eq!(read_offline_csn(dir.path()).unwrap(), Some(csn));
        remove_offline_csn(dir.path()).unwrap();
        remove_offline_csn(dir.path()).unwrap();
        assert_eq!(read_offline_csn(dir.path()).unwrap(), None);
    }

    #[test]
    fn rotation_time_keeps_one_marker() {
        let dir = tempdir().unwrap();
        assert_eq!(read_rotation_time(dir.path()).unwrap(), None);
        write_rotation_time(dir.path(), 100).unwrap();
        write_rotation_time(dir.path(), 250).unwrap();
        assert_eq!(read_rotation_time(dir.path()).unwrap(), Some(250));
        assert!(dir.path().join("rotationtime250.ms").exists());
        assert!(!dir.path().join("rotationtime100.ms").exists());
    }

    #[test]
    fn rotation_time_survives_interrupted_replacement() {
        let dir = tempdir().unwrap();
        write_rotation_time(dir.path(), 100).unwrap();
        // new marker written, old one not removed yet
        fs::write(dir.path().join("rotationtime300.ms"), b"").unwrap();
        assert_eq!(read_rotation_time(dir.path()).unwrap(), Some(300));

        write_rotation_time(dir.path(), 400).unwrap();
        assert_eq!(read_rotation_time(dir.path()).unwrap(), Some(400));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
