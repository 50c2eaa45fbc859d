//! Shard placement

use crate::error::{Error, Result};
use crate::models::UserId;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Maps a user to one of `N` shards with a stable hash.
///
/// Placement depends only on the user id and the shard count, so it survives
/// restarts and is identical on every node. Changing the count moves users;
/// rebalancing existing rows is not handled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Configuration(
                "shard count must be at least 1".to_string(),
            ));
        }
        Ok(Self { shard_count })
    }

    pub const fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard for `user_id`, in `0..shard_count`
    pub fn route(&self, user_id: &UserId) -> u32 {
        fnv1a_32(user_id.as_str().as_bytes()) % self.shard_count
    }
}

pub(crate) fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
