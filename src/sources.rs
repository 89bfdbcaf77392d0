//! The source-handler interface (§6): fetch/update of a part's `source`
//! into a destination directory. VCS and tarball handlers are external
//! collaborators out of scope; this crate carries the interface plus the
//! `local` handler, since it requires no network access and every
//! scenario in §8 exercises it.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::errors::PartsError;

/// What PULL (and `update-pull`/`update-build`) need from a source.
pub trait SourceHandler {
    /// Fetch into `dest`, which the caller has already ensured is empty.
    fn pull(&self, dest: &Path) -> Result<(), PartsError>;

    /// True iff the upstream source has changed since `since`.
    fn check_if_outdated(&self, since: DateTime<Utc>) -> Result<bool, PartsError>;

    /// Refresh `dest` in place without clearing it first (used by
    /// `update-pull` and `update-build`'s local-copy refresh).
    fn update(&self, dest: &Path) -> Result<(), PartsError>;
}

/// `source-type: local` (or a bare local path with no declared type): the
/// source is a directory on the same filesystem, recursively copied.
pub struct LocalSource {
    root: std::path::PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        LocalSource { root: root.into() }
    }
}

impl SourceHandler for LocalSource {
    fn pull(&self, dest: &Path) -> Result<(), PartsError> {
        crate::executor::migration::migrate_tree(&self.root, dest, "source", &Default::default(), &Default::default())?;
        Ok(())
    }

    fn check_if_outdated(&self, since: DateTime<Utc>) -> Result<bool, PartsError> {
        let mut newest: Option<DateTime<Utc>> = None;
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(std::io::Error::other)?;
            let modified: DateTime<Utc> = entry.metadata().map_err(std::io::Error::other)?.modified()?.into();
            if newest.is_none_or(|n| modified > n) {
                newest = Some(modified);
            }
        }
        Ok(newest.is_some_and(|n| n > since))
    }

    fn update(&self, dest: &Path) -> Result<(), PartsError> {
        self.pull(dest)
    }
}

/// Resolve a part's declared `source-type` (or infer `local` when the
/// source looks like a filesystem path) to a handler. Returns `None` when
/// the part declares no `source` at all.
pub fn resolve(source: Option<&str>, source_type: Option<&str>) -> Option<Box<dyn SourceHandler>> {
    let source = source?;
    match source_type {
        Some("local") | None => Some(Box::new(LocalSource::new(source))),
        Some(other) => {
            tracing::warn!("no builtin source handler for source-type {other:?}, treating as local");
            Some(Box::new(LocalSource::new(source)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn local_source_pull_copies_tree() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hi").unwrap();

        let handler = LocalSource::new(src.path());
        handler.pull(dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hi");
    }

    #[test]
    fn check_if_outdated_true_for_timestamp_far_in_the_past() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hi").unwrap();
        let handler = LocalSource::new(src.path());
        let ancient = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert!(handler.check_if_outdated(ancient).unwrap());
    }

    #[test]
    fn resolve_returns_none_without_a_declared_source() {
        assert!(resolve(None, None).is_none());
    }
}
