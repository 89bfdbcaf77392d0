//! The `Part` model: identity, declarative spec, derived directories, and
//! the `after`-dependency topological sort that gives every other component
//! a single canonical part order to work from (§3).

pub mod spec;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub use spec::{OrganizeMap, PartSpec, PartsDocument};

use crate::errors::PartsError;

/// A single declarative unit of build work, plus the directories derived
/// from its name and the project's work root.
#[derive(Debug)]
pub struct Part {
    pub name: String,
    pub spec: PartSpec,
    work_root: PathBuf,
    /// Recomputed during planning (`Sequencer::ensure_overlay_consistency`);
    /// the only field on `Part` that isn't fixed at load time, hence the
    /// interior mutability rather than requiring `&mut Part` everywhere.
    layer_hash: RefCell<Vec<u8>>,
}

impl Part {
    pub fn new(name: impl Into<String>, spec: PartSpec, work_root: impl Into<PathBuf>) -> Self {
        Part {
            name: name.into(),
            spec,
            work_root: work_root.into(),
            layer_hash: RefCell::new(Vec::new()),
        }
    }

    pub fn layer_hash(&self) -> Vec<u8> {
        self.layer_hash.borrow().clone()
    }

    pub fn set_layer_hash(&self, hash: Vec<u8>) {
        *self.layer_hash.borrow_mut() = hash;
    }

    fn part_dir(&self) -> PathBuf {
        self.work_root.join("parts").join(&self.name)
    }

    pub fn src_dir(&self) -> PathBuf {
        self.part_dir().join("src")
    }
    pub fn build_dir(&self) -> PathBuf {
        self.part_dir().join("build")
    }
    pub fn install_dir(&self) -> PathBuf {
        self.part_dir().join("install")
    }
    pub fn layer_dir(&self) -> PathBuf {
        self.part_dir().join("layer")
    }
    pub fn state_dir(&self) -> PathBuf {
        self.part_dir().join("state")
    }
    pub fn run_dir(&self) -> PathBuf {
        self.part_dir().join("run")
    }
    pub fn packages_dir(&self) -> PathBuf {
        self.part_dir().join("packages")
    }
    pub fn snaps_dir(&self) -> PathBuf {
        self.part_dir().join("snaps")
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.work_root.join("stage")
    }
    pub fn prime_dir(&self) -> PathBuf {
        self.work_root.join("prime")
    }
    pub fn overlay_dir(&self) -> PathBuf {
        self.work_root.join("overlay")
    }

    pub fn layer_hash_file(&self) -> PathBuf {
        self.state_dir().join("layer_hash")
    }

    /// True iff this part's own spec declares overlay parameters.
    pub fn has_overlay(&self) -> bool {
        self.spec.has_overlay()
    }

    /// All directories the part handler must ensure exist before running a
    /// step (§4.4 `_make_dirs`).
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.src_dir(),
            self.build_dir(),
            self.install_dir(),
            self.layer_dir(),
            self.state_dir(),
            self.run_dir(),
            self.stage_dir(),
            self.prime_dir(),
        ]
    }
}

/// True iff `part`, or any part at or before it in `sorted_parts`, declares
/// overlay parameters. Used by the sequencer to decide whether BUILD must
/// run inside a layer-mount scope (§4.4 "has overlay visibility").
pub fn has_overlay_visibility(part: &Part, sorted_parts: &[Part]) -> bool {
    for p in sorted_parts {
        if p.has_overlay() {
            return true;
        }
        if p.name == part.name {
            break;
        }
    }
    false
}

/// Parts (in `sorted_parts` order) that declare overlay parameters directly.
pub fn parts_with_overlay<'a>(sorted_parts: &'a [Part]) -> Vec<&'a Part> {
    sorted_parts.iter().filter(|p| p.has_overlay()).collect()
}

/// The direct `after` dependencies of `part_name`, in `sorted_parts` order.
pub fn part_dependencies<'a>(part_name: &str, sorted_parts: &'a [Part]) -> Vec<&'a Part> {
    let Some(part) = sorted_parts.iter().find(|p| p.name == part_name) else {
        return Vec::new();
    };
    sorted_parts
        .iter()
        .filter(|p| part.spec.after.iter().any(|dep| dep == &p.name))
        .collect()
}

/// Filter `sorted_parts` down to the named subset, preserving the canonical
/// sorted order (not the order `names` were given in). `None`/empty selects
/// every part.
pub fn part_list_by_name<'a>(names: Option<&[String]>, sorted_parts: &'a [Part]) -> Vec<&'a Part> {
    match names {
        None => sorted_parts.iter().collect(),
        Some(names) if names.is_empty() => sorted_parts.iter().collect(),
        Some(names) => sorted_parts
            .iter()
            .filter(|p| names.iter().any(|n| n == &p.name))
            .collect(),
    }
}

/// Topologically sort parts by their `after` dependency graph, breaking ties
/// by declaration order (stable Kahn's algorithm). Returns
/// `PartDependencyCycle` if the graph has a cycle.
pub fn sort_parts(parts: Vec<Part>) -> Result<Vec<Part>, PartsError> {
    let index_of: HashMap<&str, usize> = parts
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    for part in &parts {
        for dep in &part.spec.after {
            if !index_of.contains_key(dep.as_str()) {
                return Err(PartsError::PartSpecificationError {
                    part_name: part.name.clone(),
                    message: format!("part {dep:?} listed in 'after' is not defined"),
                });
            }
        }
    }

    let n = parts.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, part) in parts.iter().enumerate() {
        for dep in &part.spec.after {
            let dep_idx = index_of[dep.as_str()];
            dependents[dep_idx].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    let mut visited = HashSet::new();

    while !ready.is_empty() {
        ready.sort_unstable();
        let i = ready.remove(0);
        visited.insert(i);
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != n {
        let stuck: Vec<&str> = (0..n)
            .filter(|i| !visited.contains(i))
            .map(|i| parts[i].name.as_str())
            .collect();
        return Err(PartsError::PartDependencyCycle(stuck.join(", ")));
    }

    let mut parts: Vec<Option<Part>> = parts.into_iter().map(Some).collect();
    Ok(order.into_iter().map(|i| parts[i].take().unwrap()).collect())
}

/// Canonicalize a path as a `/`-separated relative string, for use as keys
/// in migrated-file sets (platform-stable regardless of `Path` separator).
pub fn relative_str(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str, after: &[&str]) -> Part {
        let mut spec = PartSpec::nil(None);
        spec.after = after.iter().map(|s| s.to_string()).collect();
        Part::new(name, spec, "/work")
    }

    #[test]
    fn sort_parts_is_stable_for_independent_parts() {
        let parts = vec![part("p1", &[]), part("p2", &[]), part("p3", &[])];
        let sorted = sort_parts(parts).unwrap();
        let names: Vec<&str> = sorted.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn sort_parts_respects_after() {
        let parts = vec![part("p1", &["p2"]), part("p2", &[])];
        let sorted = sort_parts(parts).unwrap();
        let names: Vec<&str> = sorted.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p2", "p1"]);
    }

    #[test]
    fn sort_parts_detects_cycle() {
        let parts = vec![part("p1", &["p2"]), part("p2", &["p1"])];
        let err = sort_parts(parts).unwrap_err();
        assert!(matches!(err, PartsError::PartDependencyCycle(_)));
    }

    #[test]
    fn has_overlay_visibility_true_for_self_or_predecessor() {
        let mut spec_overlay = PartSpec::nil(None);
        spec_overlay.overlay_packages = vec!["foo".to_string()];
        let parts = vec![
            Part::new("p1", spec_overlay, "/work"),
            Part::new("p2", PartSpec::nil(None), "/work"),
        ];
        assert!(has_overlay_visibility(&parts[0], &parts));
        assert!(has_overlay_visibility(&parts[1], &parts));
    }

    #[test]
    fn part_directories_are_nested_under_work_root() {
        let p = Part::new("p1", PartSpec::nil(None), "/work");
        assert_eq!(p.src_dir(), PathBuf::from("/work/parts/p1/src"));
        assert_eq!(p.stage_dir(), PathBuf::from("/work/stage"));
    }
}
