//! Overlay layer-hash chain and scoped mount contexts (§4.2).

pub mod fs;
pub mod layer_hash;
pub mod mount;

pub use fs::{is_whiteout_file, oci_whiteout, visible_in_layer};
pub use layer_hash::{compute_layer_digest, load_layer_hash, save_layer_hash};
pub use mount::{LayerMounter, MountBackend, MountGuardState, NoopMountBackend, PackageCacheMounter};
