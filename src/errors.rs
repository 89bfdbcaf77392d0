//! Error types for the Part Lifecycle crate.
//!
//! This module defines a unified error enumeration used across part
//! specification loading, sequencing, overlay consistency, and step
//! execution. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants cover validation, I/O, package/overlay resolution, and
//!   engine-internal invariant violations.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the Part Lifecycle library.
///
/// - Used across part loading, sequencing, and part-handler execution.
/// - Implements `std::error::Error` via `thiserror`.
pub enum PartsError {
    /// The `after` dependency graph contains a cycle.
    #[error("circular dependency chain found in parts definition: {0}")]
    PartDependencyCycle(String),

    /// A part was referenced by name that does not exist in the project.
    #[error("a part named {0:?} is not defined in the parts list")]
    InvalidPartName(String),

    /// The requested target architecture is not supported.
    #[error("invalid architecture: {0:?}")]
    InvalidArchitecture(String),

    /// A part's declarative spec failed validation.
    #[error("part {part_name:?} has invalid specification: {message}")]
    PartSpecificationError { part_name: String, message: String },

    /// A declared stage-package could not be resolved by the package repository.
    #[error("stage package not found for part {part_name:?}: {package_name}")]
    StagePackageNotFound {
        part_name: String,
        package_name: String,
    },

    /// A declared overlay-package could not be resolved by the package repository.
    #[error("overlay package not found for part {part_name:?}: {package_name}")]
    OverlayPackageNotFound {
        part_name: String,
        package_name: String,
    },

    /// The requested action cannot be performed on this step/part combination.
    #[error("cannot perform action: {0}")]
    InvalidAction(String),

    /// Two parts migrated the same path to a shared stage/prime directory
    /// and organize could not resolve the collision.
    #[error("file collision between parts {first:?} and {second:?} at {path}")]
    FileCollision {
        first: String,
        second: String,
        path: String,
    },

    /// `organize` attempted to overwrite a path outside the set it
    /// previously produced (see DESIGN.md, BUILD-update overwrite scope).
    #[error("organize for part {part_name:?} may not overwrite {path:?}: not part of the prior build's output")]
    OrganizeCollision { part_name: String, path: String },

    /// Nested overlay mount scopes were attempted within a single action.
    #[error("nested overlay mount scope attempted for part {0:?}")]
    NestedMountScope(String),

    /// Could not determine the host's `os-release` ID while resolving a base.
    #[error("could not determine os-release ID: {0}")]
    OsReleaseIdError(String),

    /// I/O error from the filesystem or a spawned scriptlet.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A part's spec or a state file failed to (de)serialize.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic custom error for miscellaneous failures, carrying an optional
    /// resolution hint the way the original `PartsError.resolution` does.
    #[error("{brief}{}", .resolution.as_ref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Custom {
        brief: String,
        details: Option<String>,
        resolution: Option<String>,
    },
}

impl PartsError {
    /// Build a bare custom error with just a brief message.
    pub fn custom(brief: impl Into<String>) -> Self {
        PartsError::Custom {
            brief: brief.into(),
            details: None,
            resolution: None,
        }
    }

    /// Build a custom error with a brief message and a resolution hint.
    pub fn custom_with_resolution(brief: impl Into<String>, resolution: impl Into<String>) -> Self {
        PartsError::Custom {
            brief: brief.into(),
            details: None,
            resolution: Some(resolution.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_part_and_package_names() {
        let err = PartsError::StagePackageNotFound {
            part_name: "foo".into(),
            package_name: "libbar-dev".into(),
        };
        assert_eq!(
            err.to_string(),
            "stage package not found for part \"foo\": libbar-dev"
        );
    }

    #[test]
    fn custom_with_resolution_appends_hint() {
        let err = PartsError::custom_with_resolution("build failed", "check override-build");
        assert_eq!(err.to_string(), "build failed (check override-build)");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PartsError = io.into();
        assert!(matches!(err, PartsError::IoError(_)));
    }
}
