//! Include/exclude glob fileset resolution, shared by the overlay filter
//! (`overlay-files`) and anything else that resolves a glob list into a
//! path predicate (§6 parts YAML schema: "an entry prefixed `-` excludes").

use glob::Pattern;

/// A resolved include/exclude glob list. An empty include list means
/// "everything is included" (the craft-parts default), matching the spec's
/// "all fields optional" rule for `overlay-files`.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl FileFilter {
    /// Partition `entries` into include/exclude glob patterns. Invalid
    /// glob syntax is skipped rather than failing the whole filter, since a
    /// single malformed entry should not block every other rule.
    pub fn from_entries(entries: &[String]) -> Self {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for entry in entries {
            if let Some(raw) = entry.strip_prefix('-') {
                if let Ok(p) = Pattern::new(raw) {
                    excludes.push(p);
                }
            } else if let Ok(p) = Pattern::new(entry) {
                includes.push(p);
            }
        }
        FileFilter { includes, excludes }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// True iff `relpath` (a `/`-separated path relative to the fileset's
    /// root) is selected: matches an include pattern (or no includes are
    /// declared) and matches no exclude pattern.
    pub fn matches(&self, relpath: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|p| p.matches(relpath));
        if !included {
            return false;
        }
        !self.excludes.iter().any(|p| p.matches(relpath))
    }

    /// Same as `matches`, except whiteout markers are always selected
    /// regardless of the configured globs (§4.2 "whiteout-aware overlay
    /// filtering" — a deletion marker must survive filtering or the
    /// deletion it represents would silently disappear).
    pub fn matches_with_whiteout_carveout(&self, relpath: &str, is_whiteout: bool) -> bool {
        is_whiteout || self.matches(relpath)
    }
}
