//! The package repository interface (§6): resolve and fetch a part's
//! declared `stage-packages`/`overlay-packages` (system packages) and
//! `stage-snaps`/`build-snaps` (snapshot packages). The real repositories
//! (apt, snapd) are external collaborators; this crate carries the
//! interface plus a null implementation for parts that declare none.

use std::path::Path;

use crate::errors::PartsError;

/// System-package fetch/unpack, keyed by package name as declared in a
/// part's `stage-packages`/`overlay-packages` list.
pub trait PackageRepository {
    /// Resolve `names` to concrete package references and download them
    /// into `cache_dir`, returning the resolved list for the state's
    /// assets field. Fails with `StagePackageNotFound`/`OverlayPackageNotFound`
    /// (caller's choice) for any name the repository cannot resolve.
    fn fetch(&self, names: &[String], cache_dir: &Path) -> Result<Vec<String>, PartsError>;

    /// Unpack previously fetched packages from `cache_dir` into `dest`.
    fn unpack(&self, cache_dir: &Path, dest: &Path) -> Result<(), PartsError>;

    /// The sorted list of packages this repository considers installed on
    /// the build host, for the BUILD step's machine manifest (§6). Distinct
    /// from `fetch`'s return value, which is scoped to one part's declared
    /// packages; this is host-wide.
    fn get_installed_packages(&self) -> Result<Vec<String>, PartsError>;
}

/// A repository with no packages available; used when a part declares no
/// stage/overlay packages, and as the crate's default until a real
/// apt/snapd-backed repository is wired in by the embedding application.
pub struct NullPackageRepository;

impl PackageRepository for NullPackageRepository {
    fn fetch(&self, names: &[String], _cache_dir: &Path) -> Result<Vec<String>, PartsError> {
        if names.is_empty() {
            Ok(Vec::new())
        } else {
            Err(PartsError::custom(format!(
                "no package repository configured to resolve: {}",
                names.join(", ")
            )))
        }
    }

    fn unpack(&self, _cache_dir: &Path, _dest: &Path) -> Result<(), PartsError> {
        Ok(())
    }

    fn get_installed_packages(&self) -> Result<Vec<String>, PartsError> {
        Ok(Vec::new())
    }
}

pub mod snaps {
    use super::*;

    /// Snapshot-package ("snap") fetch, mirroring `PackageRepository` but
    /// keyed by snap name with channel/revision resolution left opaque to
    /// the core (the engine only needs "fetch into a directory").
    pub trait SnapRepository {
        fn fetch(&self, names: &[String], cache_dir: &Path) -> Result<Vec<String>, PartsError>;

        /// The sorted list of snaps installed on the build host, for the
        /// BUILD step's machine manifest (§6).
        fn get_installed_snaps(&self) -> Result<Vec<String>, PartsError>;
    }

    pub struct NullSnapRepository;

    impl SnapRepository for NullSnapRepository {
        fn fetch(&self, names: &[String], _cache_dir: &Path) -> Result<Vec<String>, PartsError> {
            if names.is_empty() {
                Ok(Vec::new())
            } else {
                Err(PartsError::custom(format!(
                    "no snap repository configured to resolve: {}",
                    names.join(", ")
                )))
            }
        }

        fn get_installed_snaps(&self) -> Result<Vec<String>, PartsError> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn null_repository_accepts_empty_package_list() {
        let dir = tempdir().unwrap();
        let repo = NullPackageRepository;
        assert_eq!(repo.fetch(&[], dir.path()).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn null_repository_rejects_declared_packages() {
        let dir = tempdir().unwrap();
        let repo = NullPackageRepository;
        let err = repo.fetch(&["libfoo-dev".to_string()], dir.path()).unwrap_err();
        assert!(matches!(err, PartsError::Custom { .. }));
    }
}
