//! Scoped overlay mount contexts (§4.2).
//!
//! The actual chroot/overlayfs syscalls are an external collaborator
//! (out of scope per the top-level spec); this module owns only the
//! *scoping* discipline — stack the right layers, guarantee teardown on
//! every exit path including panics and early returns, and forbid nesting.
//! Callers supply a `MountBackend` that does the real mount/unmount work.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::errors::PartsError;
use crate::parts::Part;

/// The real mount/unmount mechanics, injected so this crate stays testable
/// without root privileges or a real overlayfs.
pub trait MountBackend {
    fn mount(&self, lower_dirs: &[PathBuf], upper_dir: &Path, target: &Path) -> Result<(), PartsError>;
    fn unmount(&self, target: &Path) -> Result<(), PartsError>;
}

/// A backend that performs no real mount, only validates the scoping
/// discipline; used in tests and as the engine's default until a real
/// overlayfs backend is wired in by the embedding application.
#[derive(Debug, Default)]
pub struct NoopMountBackend;

impl MountBackend for NoopMountBackend {
    fn mount(&self, _lower_dirs: &[PathBuf], _upper_dir: &Path, _target: &Path) -> Result<(), PartsError> {
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> Result<(), PartsError> {
        Ok(())
    }
}

/// Guards against two overlapping mount scopes in the same thread; the
/// spec forbids nested overlay mounts within a single action.
#[derive(Default)]
pub struct MountGuardState {
    active: Cell<bool>,
}

impl MountGuardState {
    pub fn new() -> Self {
        MountGuardState { active: Cell::new(false) }
    }

    fn enter(&self) -> Result<(), PartsError> {
        if self.active.get() {
            return Err(PartsError::NestedMountScope(
                "an overlay mount scope is already active".to_string(),
            ));
        }
        self.active.set(true);
        Ok(())
    }

    fn exit(&self) {
        self.active.set(false);
    }
}

/// Stacks every part's layer at or below `top_part` (in `sorted_parts`
/// order) and mounts them read-only with `top_part`'s layer as the upper
/// directory, for running a part's build or overlay script with visibility
/// into everything the stack has produced so far. Unmounts on drop.
pub struct LayerMounter<'a> {
    backend: &'a dyn MountBackend,
    guard: &'a MountGuardState,
    target: PathBuf,
}

impl<'a> LayerMounter<'a> {
    pub fn new(
        backend: &'a dyn MountBackend,
        guard: &'a MountGuardState,
        sorted_parts: &[Part],
        top_part: &Part,
        target: impl Into<PathBuf>,
    ) -> Result<Self, PartsError> {
        guard.enter()?;
        let target = target.into();

        let mut lower_dirs = Vec::new();
        for p in sorted_parts {
            lower_dirs.push(p.layer_dir());
            if p.name == top_part.name {
                break;
            }
        }
        let upper_dir = top_part.layer_dir();

        if let Err(e) = backend.mount(&lower_dirs, &upper_dir, &target) {
            guard.exit();
            return Err(e);
        }

        Ok(LayerMounter { backend, guard, target })
    }
}

impl Drop for LayerMounter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.unmount(&self.target) {
            error!("failed to unmount layer scope at {}: {e}", self.target.display());
        }
        self.guard.exit();
    }
}

/// Mounts the package-install cache writable atop the current layer stack,
/// so `install_packages`/`fetch_packages` can populate it inside an
/// overlay-visible build. Otherwise identical scoping discipline to
/// `LayerMounter`.
pub struct PackageCacheMounter<'a> {
    backend: &'a dyn MountBackend,
    guard: &'a MountGuardState,
    target: PathBuf,
}

impl<'a> PackageCacheMounter<'a> {
    pub fn new(
        backend: &'a dyn MountBackend,
        guard: &'a MountGuardState,
        packages_dir: &Path,
        target: impl Into<PathBuf>,
    ) -> Result<Self, PartsError> {
        guard.enter()?;
        let target = target.into();
        if let Err(e) = backend.mount(&[], packages_dir, &target) {
            guard.exit();
            return Err(e);
        }
        Ok(PackageCacheMounter { backend, guard, target })
    }
}

impl Drop for PackageCacheMounter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.unmount(&self.target) {
            warn!("failed to unmount package cache scope at {}: {e}", self.target.display());
        }
        self.guard.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::PartSpec;

    #[test]
    fn nested_layer_mount_is_rejected() {
        let backend = NoopMountBackend;
        let guard = MountGuardState::new();
        let parts = vec![Part::new("p1", PartSpec::nil(None), "/work")];
        let outer = LayerMounter::new(&backend, &guard, &parts, &parts[0], "/mnt").unwrap();
        let inner = LayerMounter::new(&backend, &guard, &parts, &parts[0], "/mnt2");
        assert!(inner.is_err());
        drop(outer);
    }

    #[test]
    fn guard_releases_after_drop_allowing_reentry() {
        let backend = NoopMountBackend;
        let guard = MountGuardState::new();
        let parts = vec![Part::new("p1", PartSpec::nil(None), "/work")];
        {
            let _m = LayerMounter::new(&backend, &guard, &parts, &parts[0], "/mnt").unwrap();
        }
        let _m2 = LayerMounter::new(&backend, &guard, &parts, &parts[0], "/mnt").unwrap();
    }
}
