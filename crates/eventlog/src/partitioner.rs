//! Stable key to partition mapping shared by every backend

use sha2::{Digest, Sha256};

/// Map a partition key onto `[0, partitions)`.
///
/// The mapping only depends on the key bytes, so the same key always lands on
/// the same partition across processes and restarts.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}
