//! Key-range sharding for parallel stage processes.
//!
//! Shards coordinate only through disjoint natural-key ranges: each
//! process claims one [`ShardPlan`] and is the sole writer for keys inside
//! it. Planning is a pure function over the sorted key list so it can be
//! tested without spawning anything.

/// A half-open key range `[start_key, end_key)` owned by one process.
///
/// `None` bounds are unbounded: shard 0 starts at the beginning of the key
/// space and the last shard runs to the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub shard_id: u32,
    pub start_key: Option<String>,
    pub end_key: Option<String>,
}

impl ShardPlan {
    /// The whole key space as a single shard.
    pub fn full() -> Self {
        Self {
            shard_id: 0,
            start_key: None,
            end_key: None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        if let Some(start) = &self.start_key {
            if key < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &self.end_key {
            if key >= end.as_str() {
                return false;
            }
        }
        true
    }
}

/// Partition a sorted key list into `shards` contiguous, disjoint plans.
///
/// Every key falls into exactly one plan; outer bounds stay open so keys
/// that arrive after planning still land in a shard.
pub fn plan_shards(sorted_keys: &[String], shards: u32) -> Vec<ShardPlan> {
    if shards <= 1 || sorted_keys.len() <= 1 {
        return vec![ShardPlan::full()];
    }

    let shards = (shards as usize).min(sorted_keys.len());
    let chunk = sorted_keys.len().div_ceil(shards);

    let mut plans = Vec::with_capacity(shards);
    for i in 0..shards {
        let start_key = if i == 0 {
            None
        } else {
            Some(sorted_keys[i * chunk].clone())
        };
        let end_key = if (i + 1) * chunk >= sorted_keys.len() {
            None
        } else {
            Some(sorted_keys[(i + 1) * chunk].clone())
        };

        plans.push(ShardPlan {
            shard_id: i as u32,
            start_key,
            end_key,
        });

        // Fewer boundaries than requested shards once chunks run out.
        if (i + 1) * chunk >= sorted_keys.len() {
            break;
        }
    }

    plans
}
