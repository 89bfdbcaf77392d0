//! The overlay layer-hash chain (§3 "LayerHash", §4.2).
//!
//! `LayerHash(part) = sha1(sha1(sha1(previous ++ sorted(overlay_packages)) ++ overlay_files) ++ overlay_script)`
//! Pure over the part's spec and the previous part's hash; callers thread
//! the chain starting from a caller-supplied `base_layer_hash`.

use std::fs;

use sha1::{Digest, Sha1};

use crate::parts::{Part, PartSpec};

/// Compute `h = LayerHash(part)` given the previous part's hash in the
/// stack (or the project's `base_layer_hash` for the first part).
pub fn compute_layer_digest(spec: &PartSpec, previous_hash: &[u8]) -> Vec<u8> {
    let mut sorted_packages = spec.overlay_packages.clone();
    sorted_packages.sort();

    let mut stage1 = Sha1::new();
    stage1.update(previous_hash);
    for pkg in &sorted_packages {
        stage1.update(pkg.as_bytes());
        stage1.update(b"\0");
    }
    let digest1 = stage1.finalize();

    let mut stage2 = Sha1::new();
    stage2.update(digest1);
    for entry in &spec.overlay_files {
        stage2.update(entry.as_bytes());
        stage2.update(b"\0");
    }
    let digest2 = stage2.finalize();

    let mut stage3 = Sha1::new();
    stage3.update(digest2);
    if let Some(script) = &spec.overlay_script {
        stage3.update(script.as_bytes());
    }
    stage3.finalize().to_vec()
}

/// Persist `hash` as lowercase hex at `<part>/state/layer_hash`.
pub fn save_layer_hash(part: &Part, hash: &[u8]) -> Result<(), crate::errors::PartsError> {
    let path = part.layer_hash_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, hex::encode(hash))?;
    part.set_layer_hash(hash.to_vec());
    Ok(())
}

/// Load the persisted layer hash for `part`, if any.
pub fn load_layer_hash(part: &Part) -> Option<Vec<u8>> {
    let text = fs::read_to_string(part.layer_hash_file()).ok()?;
    hex::decode(text.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_layer_digest_is_pure_and_deterministic() {
        let spec = PartSpec::nil(None);
        let h1 = compute_layer_digest(&spec, b"base");
        let h2 = compute_layer_digest(&spec, b"base");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 20);
    }

    #[test]
    fn changing_overlay_script_changes_hash() {
        let mut spec = PartSpec::nil(None);
        let base = compute_layer_digest(&spec, b"");
        spec.overlay_script = Some("echo hi".to_string());
        let changed = compute_layer_digest(&spec, b"");
        assert_ne!(base, changed);
    }

    #[test]
    fn overlay_package_order_does_not_affect_hash() {
        let mut a = PartSpec::nil(None);
        a.overlay_packages = vec!["b".to_string(), "a".to_string()];
        let mut b = PartSpec::nil(None);
        b.overlay_packages = vec!["a".to_string(), "b".to_string()];
        assert_eq!(compute_layer_digest(&a, b"x"), compute_layer_digest(&b, b"x"));
    }

    #[test]
    fn chain_depends_on_previous_hash() {
        let spec = PartSpec::nil(None);
        let h_base_a = compute_layer_digest(&spec, b"a");
        let h_base_b = compute_layer_digest(&spec, b"b");
        assert_ne!(h_base_a, h_base_b);
    }

    use quickcheck::TestResult;

    quickcheck::quickcheck! {
        /// §8 S5: recomputing a part's layer hash from the same inputs is
        /// pure, for any overlay packages/files/script and any previous hash.
        fn prop_layer_hash_is_pure(previous: Vec<u8>, packages: Vec<String>, files: Vec<String>, script: Option<String>) -> bool {
            let mut spec = PartSpec::nil(None);
            spec.overlay_packages = packages;
            spec.overlay_files = files;
            spec.overlay_script = script;
            compute_layer_digest(&spec, &previous) == compute_layer_digest(&spec, &previous)
        }
    }

    quickcheck::quickcheck! {
        /// §8 S5: two distinct previous hashes never collide for the same
        /// spec, so a part always notices when an earlier part's layer changed.
        fn prop_layer_hash_depends_on_base(a: Vec<u8>, b: Vec<u8>) -> TestResult {
            if a == b {
                return TestResult::discard();
            }
            let spec = PartSpec::nil(None);
            TestResult::from_bool(compute_layer_digest(&spec, &a) != compute_layer_digest(&spec, &b))
        }
    }
}
