//! Overlayfs-semantics helpers: whiteout detection, OCI whiteout
//! translation, and visibility filtering across a layer stack (§4.2).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// True iff `path` is a character-0/0 device file, the kernel overlayfs
/// convention for "this path is deleted in this layer".
pub fn is_whiteout_file(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_char_device() => meta.rdev() == 0,
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Translate a path that is a whiteout in the kernel's native (char 0/0
/// device) form into its OCI `.wh.<name>` marker form, for migration into
/// stage/prime where a real overlay mount isn't available.
pub fn oci_whiteout(relpath: &Path) -> PathBuf {
    let file_name = relpath
        .file_name()
        .map(|n| format!(".wh.{}", n.to_string_lossy()))
        .unwrap_or_else(|| ".wh.".to_string());
    match relpath.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from(file_name),
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// True iff `name` is an opaque-directory marker (`.wh..wh..opq`), which
/// hides everything beneath it from lower layers.
fn is_opaque_marker(name: &str) -> bool {
    name == ".wh..wh..opq"
}

/// The set of paths (relative to `srcdir`) that would be visible if
/// `srcdir` were mounted as the top of an overlay stack rooted at
/// `destdir`: every regular entry, minus whiteouts (which are themselves
/// excluded, and whose non-whiteout siblings they would hide in a true
/// overlay mount — this engine models a single-layer view per step, so the
/// subtraction is limited to what the top layer itself marks).
pub fn visible_in_layer(srcdir: &Path, _destdir: &Path) -> std::io::Result<BTreeSet<PathBuf>> {
    let mut visible = BTreeSet::new();
    let mut whiteouts = BTreeSet::new();

    for entry in walkdir::WalkDir::new(srcdir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(srcdir).unwrap_or(entry.path()).to_path_buf();
        let name = entry.file_name().to_string_lossy();

        if is_opaque_marker(&name) {
            continue;
        }
        if is_whiteout_file(entry.path()) {
            if let Some(stripped) = name.strip_prefix(".wh.") {
                if let Some(parent) = rel.parent() {
                    whiteouts.insert(parent.join(stripped));
                } else {
                    whiteouts.insert(PathBuf::from(stripped));
                }
            }
            continue;
        }
        visible.insert(rel);
    }

    for w in &whiteouts {
        visible.remove(w);
    }
    Ok(visible)
}
