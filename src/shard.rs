//! Deterministic shard-id derivation for cluster placement.

use uuid::Uuid;

/// Fixed namespace UUID for shard-id hashing.
const SHARD_NAMESPACE: Uuid = Uuid::from_bytes([
    0xc7, 0x19, 0x2e, 0x8d, 0x5a, 0xf3, 0x4b, 0x77, 0x8e, 0x01, 0x6f, 0xb2, 0x93, 0x4c, 0xd1, 0x65,
]);

/// Map a seed string onto one of `shard_count` routing buckets.
///
/// Pure function of its arguments: the same `(seed, shard_count)` always
/// yields the same shard, on every process and every run. Commands are
/// routed with the target instance ID as the seed, so all traffic for one
/// aggregate lands on one shard and is processed through one serialized
/// lane regardless of command type.
///
/// A `shard_count` of zero is treated as one.
///
/// # Examples
///
/// ```
/// use gridlane::shard_id;
///
/// assert_eq!(shard_id("balloon-7", 100), shard_id("balloon-7", 100));
/// assert!(shard_id("balloon-7", 100) < 100);
/// ```
pub fn shard_id(seed: &str, shard_count: u32) -> u32 {
    let digest = Uuid::new_v5(&SHARD_NAMESPACE, seed.as_bytes());
    let bytes = digest.as_bytes();
    let hash = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    hash % shard_count.max(1)
}
