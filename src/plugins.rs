//! The plugin interface (§6): narrow surface the Part Handler consumes to
//! turn a part's `build` step into actual compiled output. Concrete plugins
//! (cmake, autotools, ...) are an external collaborator; this crate carries
//! only the interface plus the two builtins every craft-parts-style engine
//! ships (`nil`, `dump`).

use std::path::Path;

use crate::errors::PartsError;
use crate::parts::PartSpec;

/// What a plugin needs from its part to run a build, without handing it the
/// whole `Part` (the plugin must not reach into state or overlay internals).
pub struct PluginContext<'a> {
    pub part_name: &'a str,
    pub spec: &'a PartSpec,
    pub build_dir: &'a Path,
    pub install_dir: &'a Path,
}

/// A single plugin's build behavior. `build` is the only required
/// operation; craft-parts plugins also declare build-package/build-snap
/// lists, but those are read directly off `PartSpec` by the Part Handler
/// and do not need a trait method here.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Run the build, leaving results in `ctx.install_dir`.
    fn build(&self, ctx: &PluginContext<'_>) -> Result<(), PartsError>;
}

/// `plugin: nil` — a part with no build step; `install_dir` is whatever was
/// already placed there (or nothing at all, for a pure metadata part).
pub struct NilPlugin;

impl Plugin for NilPlugin {
    fn name(&self) -> &'static str {
        "nil"
    }

    fn build(&self, _ctx: &PluginContext<'_>) -> Result<(), PartsError> {
        Ok(())
    }
}

/// `plugin: dump` — copies the entire build tree into the install tree
/// verbatim, the simplest plugin with an actual file-moving effect.
pub struct DumpPlugin;

impl Plugin for DumpPlugin {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn build(&self, ctx: &PluginContext<'_>) -> Result<(), PartsError> {
        crate::executor::migration::migrate_tree(
            ctx.build_dir,
            ctx.install_dir,
            ctx.part_name,
            &Default::default(),
            &Default::default(),
        )?;
        Ok(())
    }
}

/// Resolves a plugin name to an implementation. Unknown names fall back to
/// `nil` plus a warning rather than failing the whole plan, since a part
/// relying entirely on `override-build` never needs a real plugin.
pub fn resolve(plugin_name: &str) -> Box<dyn Plugin> {
    match plugin_name {
        "dump" => Box::new(DumpPlugin),
        "nil" => Box::new(NilPlugin),
        other => {
            tracing::warn!("no builtin plugin named {other:?}, falling back to nil");
            Box::new(NilPlugin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn nil_plugin_build_is_a_no_op() {
        let dir = tempdir().unwrap();
        let spec = PartSpec::nil(None);
        let ctx = PluginContext {
            part_name: "p1",
            spec: &spec,
            build_dir: dir.path(),
            install_dir: dir.path(),
        };
        assert!(NilPlugin.build(&ctx).is_ok());
    }

    #[test]
    fn dump_plugin_copies_build_tree_into_install_tree() {
        let build = tempdir().unwrap();
        let install = tempdir().unwrap();
        std::fs::write(build.path().join("foo"), b"hi").unwrap();
        let spec = PartSpec::nil(None);
        let ctx = PluginContext {
            part_name: "p1",
            spec: &spec,
            build_dir: build.path(),
            install_dir: install.path(),
        };
        DumpPlugin.build(&ctx).unwrap();
        assert_eq!(std::fs::read(install.path().join("foo")).unwrap(), b"hi");
    }

    #[test]
    fn resolve_falls_back_to_nil_for_unknown_plugin() {
        assert_eq!(resolve("unknown-plugin").name(), "nil");
    }
}
