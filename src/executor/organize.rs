//! `organize` mapping application: rewrites a part's install-tree layout
//! according to its declared glob → destination map, before STAGE/PRIME see
//! it (§4.4 BUILD, §9 Open Question 2).

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use glob::Pattern;

use crate::errors::PartsError;
use crate::parts::OrganizeMap;

/// Apply `organize` against `install_dir` in place: for each `(glob, dest)`
/// pair, move every matching file under `install_dir` to `dest` (relative
/// to `install_dir`; a trailing `/` renames-into a directory, otherwise the
/// path is a plain rename).
///
/// `overwrite` controls whether a destination that already exists may be
/// replaced. When `false` (ordinary BUILD), any collision is a hard error.
/// When `true` (BUILD's `update-build` path), a destination may only be
/// overwritten if it is already a member of `previously_organized` — the
/// engine's tightened reading of the original's blanket `overwrite=True`,
/// so `update-build` can reshape its own prior output without clobbering
/// content organize never produced (DESIGN.md Open Question 2).
pub fn organize_files(
    install_dir: &Path,
    organize: &OrganizeMap,
    overwrite: bool,
    previously_organized: &BTreeSet<String>,
    part_name: &str,
) -> Result<BTreeSet<String>, PartsError> {
    let mut touched = BTreeSet::new();

    for (glob_src, dest) in organize.iter() {
        let pattern = Pattern::new(glob_src)
            .map_err(|e| PartsError::PartSpecificationError {
                part_name: part_name.to_string(),
                message: format!("invalid organize glob {glob_src:?}: {e}"),
            })?;

        let matches = collect_matches(install_dir, &pattern)?;
        for src_path in matches {
            let rel_src = src_path
                .strip_prefix(install_dir)
                .unwrap_or(&src_path)
                .to_string_lossy()
                .replace('\\', "/");

            let dest_rel = if dest.ends_with('/') {
                let file_name = src_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                format!("{dest}{file_name}")
            } else {
                dest.clone()
            };
            let dest_path = install_dir.join(&dest_rel);

            if dest_path.exists() {
                let may_overwrite = overwrite && previously_organized.contains(&dest_rel);
                if !may_overwrite {
                    return Err(PartsError::OrganizeCollision {
                        part_name: part_name.to_string(),
                        path: dest_rel,
                    });
                }
                if dest_path.is_dir() {
                    fs::remove_dir_all(&dest_path)?;
                } else {
                    fs::remove_file(&dest_path)?;
                }
            }

            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&src_path, &dest_path)?;
            touched.insert(dest_rel);
            let _ = rel_src;
        }
    }

    Ok(touched)
}

fn collect_matches(install_dir: &Path, pattern: &Pattern) -> Result<Vec<std::path::PathBuf>, PartsError> {
    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(install_dir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(install_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if pattern.matches(&rel) {
            matches.push(entry.path().to_path_buf());
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn organize_moves_matching_file_to_destination() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        fs::write(dir.path().join("usr/bin/foo"), b"x").unwrap();
        let organize = OrganizeMap(vec![("usr/bin/foo".to_string(), "bin/foo".to_string())]);

        let touched = organize_files(dir.path(), &organize, false, &BTreeSet::new(), "p1").unwrap();
        assert!(touched.contains("bin/foo"));
        assert!(dir.path().join("bin/foo").exists());
        assert!(!dir.path().join("usr/bin/foo").exists());
    }

    #[test]
    fn organize_rejects_collision_without_overwrite() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("src"), b"x").unwrap();
        fs::write(dir.path().join("dest"), b"already here").unwrap();
        let organize = OrganizeMap(vec![("src".to_string(), "dest".to_string())]);

        let err = organize_files(dir.path(), &organize, false, &BTreeSet::new(), "p1").unwrap_err();
        assert!(matches!(err, PartsError::OrganizeCollision { .. }));
    }

    #[test]
    fn organize_overwrite_restricted_to_previously_organized_paths() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("src"), b"x").unwrap();
        fs::write(dir.path().join("dest"), b"untracked").unwrap();
        let organize = OrganizeMap(vec![("src".to_string(), "dest".to_string())]);

        let err = organize_files(dir.path(), &organize, true, &BTreeSet::new(), "p1").unwrap_err();
        assert!(matches!(err, PartsError::OrganizeCollision { .. }));

        let mut tracked = BTreeSet::new();
        tracked.insert("dest".to_string());
        fs::write(dir.path().join("src"), b"x").unwrap();
        let touched = organize_files(dir.path(), &organize, true, &tracked, "p1").unwrap();
        assert!(touched.contains("dest"));
    }
}
