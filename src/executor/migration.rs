//! File migration into the shared `stage`/`prime` directories, and the
//! collision-safe shared-area cleanup that reverses it (§4.5).

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tracing::warn;
use walkdir::WalkDir;

use crate::errors::PartsError;

/// Everything a single migration pass moved, kept for the destination
/// step's state record (`StepState.common.files`/`.directories`) and for
/// later shared-area subtraction.
#[derive(Debug, Default, Clone)]
pub struct MigratedSet {
    pub files: BTreeSet<String>,
    pub directories: BTreeSet<String>,
}

/// Copy every entry under `src_root` into `dest_root`, preserving relative
/// path, symlink targets, and permission bits. A destination path that
/// already exists and was not migrated by `owner_name` itself is a true
/// collision and fails the whole migration (§4.5: "resolved by the
/// organize step; true collisions fail the action"), naming the other
/// part via `other_owners` (rel path -> the part that tracks it in its own
/// state) when the caller has that information.
pub fn migrate_tree(
    src_root: &Path,
    dest_root: &Path,
    owner_name: &str,
    already_owned: &BTreeSet<String>,
    other_owners: &HashMap<String, String>,
) -> Result<MigratedSet, PartsError> {
    let mut migrated = MigratedSet::default();
    if !src_root.is_dir() {
        return Ok(migrated);
    }

    fs::create_dir_all(dest_root)?;

    for entry in WalkDir::new(src_root).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let dest_path = dest_root.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
            migrated.directories.insert(rel);
            continue;
        }

        if dest_path.exists() && !already_owned.contains(&rel) {
            let second = other_owners
                .get(&rel)
                .cloned()
                .unwrap_or_else(|| "an unknown part".to_string());
            return Err(PartsError::FileCollision {
                first: owner_name.to_string(),
                second,
                path: rel,
            });
        }

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            if dest_path.exists() || dest_path.is_symlink() {
                fs::remove_file(&dest_path)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
            #[cfg(unix)]
            {
                let perms = fs::metadata(entry.path())?.permissions();
                fs::set_permissions(&dest_path, fs::Permissions::from_mode(perms.mode()))?;
            }
        }
        migrated.files.insert(rel);
    }

    Ok(migrated)
}

/// Remove the paths this part contributed to `shared_dir`, minus whatever
/// any *other* part's tracked set still claims (§4.5 steps 2-4).
pub fn clean_shared_area(
    shared_dir: &Path,
    own_files: &BTreeSet<String>,
    own_directories: &BTreeSet<String>,
    other_parts_files: &[&BTreeSet<String>],
    other_parts_directories: &[&BTreeSet<String>],
) -> Result<(), PartsError> {
    let mut files_to_remove: BTreeSet<String> = own_files.clone();
    let mut dirs_to_remove: BTreeSet<String> = own_directories.clone();

    for other in other_parts_files {
        for f in *other {
            files_to_remove.remove(f);
        }
    }
    for other in other_parts_directories {
        for d in *other {
            dirs_to_remove.remove(d);
        }
    }

    for rel in &files_to_remove {
        let path = shared_dir.join(rel);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("file already absent during shared cleanup: {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut sorted_dirs: Vec<&String> = dirs_to_remove.iter().collect();
    sorted_dirs.sort_unstable_by(|a, b| b.cmp(a));
    for rel in sorted_dirs {
        let path = shared_dir.join(rel);
        match fs::read_dir(&path) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    if let Err(e) = fs::remove_dir(&path) {
                        warn!("could not remove empty directory {}: {e}", path.display());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("directory already absent during shared cleanup: {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn migrate_tree_copies_files_and_records_relative_paths() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        fs::create_dir_all(src.path().join("usr/bin")).unwrap();
        fs::write(src.path().join("usr/bin/foo"), b"hi").unwrap();

        let migrated = migrate_tree(src.path(), dest.path(), "p1", &BTreeSet::new(), &HashMap::new()).unwrap();
        assert!(migrated.files.contains("usr/bin/foo"));
        assert!(migrated.directories.contains("usr"));
        assert!(migrated.directories.contains("usr/bin"));
        assert_eq!(fs::read(dest.path().join("usr/bin/foo")).unwrap(), b"hi");
    }

    #[test]
    fn migrate_tree_fails_on_true_collision_naming_the_other_part() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        fs::write(dest.path().join("foo"), b"existing").unwrap();
        fs::write(src.path().join("foo"), b"new").unwrap();
        let mut owners = HashMap::new();
        owners.insert("foo".to_string(), "p1".to_string());

        let err = migrate_tree(src.path(), dest.path(), "p2", &BTreeSet::new(), &owners).unwrap_err();
        match err {
            PartsError::FileCollision { first, second, path } => {
                assert_eq!(first, "p2");
                assert_eq!(second, "p1");
                assert_eq!(path, "foo");
            }
            other => panic!("expected FileCollision, got {other:?}"),
        }
    }

    #[test]
    fn clean_shared_area_keeps_paths_claimed_by_other_parts() {
        let shared = tempdir().unwrap();
        fs::write(shared.path().join("etc_foo"), b"x").unwrap();
        let mut own = BTreeSet::new();
        own.insert("etc_foo".to_string());
        let mut other = BTreeSet::new();
        other.insert("etc_foo".to_string());

        clean_shared_area(shared.path(), &own, &BTreeSet::new(), &[&other], &[]).unwrap();
        assert!(shared.path().join("etc_foo").exists());
    }

    #[test]
    fn clean_shared_area_removes_paths_owned_only_by_this_part() {
        let shared = tempdir().unwrap();
        fs::write(shared.path().join("etc_foo"), b"x").unwrap();
        let mut own = BTreeSet::new();
        own.insert("etc_foo".to_string());

        clean_shared_area(shared.path(), &own, &BTreeSet::new(), &[], &[]).unwrap();
        assert!(!shared.path().join("etc_foo").exists());
    }

    #[test]
    fn clean_shared_area_removes_empty_directories_in_reverse_order() {
        let shared = tempdir().unwrap();
        fs::create_dir_all(shared.path().join("usr/bin")).unwrap();
        let mut dirs = BTreeSet::new();
        dirs.insert("usr".to_string());
        dirs.insert("usr/bin".to_string());

        clean_shared_area(shared.path(), &BTreeSet::new(), &dirs, &[], &[]).unwrap();
        assert!(!shared.path().join("usr").exists());
    }
}
