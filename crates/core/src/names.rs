//! Deterministic object naming. Repeated reconciliation must target the
//! same objects, so every name is a pure function of owner and role,
//! clamped to the 63-character DNS label limit.

use crate::{OwnerRef, Role};

/// Prefix for objects belonging to this system.
pub const PORTAGE_PREFIX: &str = "portage-";

/// Prefix for the transfer endpoint's own objects (service, job, key).
pub const XFER_PREFIX: &str = "portage-xfer-";

const MAX_NAME_LEN: usize = 63;

/// Clamp a name to 63 characters. Over-long names keep a truncated stem
/// and gain a stable 8-hex-digit suffix so distinct inputs stay distinct.
pub fn clamp(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let digest = fnv1a(name.as_bytes());
    let stem: String = name.chars().take(MAX_NAME_LEN - 9).collect();
    format!("{}-{:08x}", stem.trim_end_matches('-'), digest as u32)
}

// 64-bit FNV-1a over the full (unclamped) name.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

pub fn service_name(owner: &OwnerRef, role: Role) -> String {
    clamp(&format!("{}{}-{}", XFER_PREFIX, role.short(), owner.name))
}

pub fn job_name(owner: &OwnerRef, role: Role) -> String {
    clamp(&format!("{}{}-{}", XFER_PREFIX, role.short(), owner.name))
}

pub fn key_secret_name(owner: &OwnerRef) -> String {
    clamp(&format!("{}{}", XFER_PREFIX, owner.name))
}

pub fn work_volume_name(owner: &OwnerRef, role: Role) -> String {
    clamp(&format!("{}{}-{}", PORTAGE_PREFIX, owner.name, role.short()))
}

/// Value for the `app.kubernetes.io/name` selector label.
pub fn selector_value(owner: &OwnerRef, role: Role) -> String {
    clamp(&format!("{}-{}", role.short(), owner.name))
}
