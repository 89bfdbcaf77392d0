//! Machine manifest capture (§6 "Machine manifest"): a snapshot of the
//! build host recorded into `BuildState.assets` so a staged/primed tree can
//! later be traced back to the environment that produced it.

use std::process::Command;

/// Collapse the `uname` invocation's stdout the way the original's
/// `get_machine_manifest` does: decode as UTF-8, falling back to a
/// byte-preserving single-byte decode for hosts whose locale emits
/// something else, then collapse internal whitespace runs to a single
/// space and trim the ends.
fn decode_and_collapse(bytes: &[u8]) -> String {
    let decoded = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            // `uname`'s output is never legitimately non-UTF-8 outside of a
            // mangled locale; WINDOWS_1252 decodes every byte without loss
            // the way the original's `surrogateescape` round-trips
            // otherwise-undecodable bytes, at the cost of misrendering any
            // individual byte above 0x7F as the wrong glyph.
            let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            cow.into_owned()
        }
    };
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Run `uname` with the six flags the original queries, returning the
/// collapsed, whitespace-joined output. Missing `uname` (non-Unix hosts,
/// minimal containers) is tolerated: the manifest simply records an empty
/// string rather than failing the BUILD step over a diagnostic field.
fn uname_string() -> String {
    let output = Command::new("uname")
        .args([
            "--kernel-name",
            "--kernel-release",
            "--kernel-version",
            "--machine",
            "--processor",
            "--hardware-platform",
            "--operating-system",
        ])
        .output();
    match output {
        Ok(out) if out.status.success() => decode_and_collapse(&out.stdout),
        _ => String::new(),
    }
}

/// Build the `{ uname, installed-packages, installed-snaps }` manifest
/// written into a BUILD step's state assets (§6). `installed_packages` and
/// `installed_snaps` are sorted by the caller's repository before this is
/// called; this function only assembles the document.
pub fn machine_manifest(installed_packages: &[String], installed_snaps: &[String]) -> serde_json::Value {
    let mut packages = installed_packages.to_vec();
    packages.sort();
    let mut snaps = installed_snaps.to_vec();
    snaps.sort();
    serde_json::json!({
        "uname": uname_string(),
        "installed-packages": packages,
        "installed-snaps": snaps,
    })
}
