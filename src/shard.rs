use std::sync::atomic::{AtomicU32, Ordering};

/// Round-robin shard numbers over `[1, max]`.
///
/// The counter lives with the owning engine and restarts at 1 with it.
/// Assignment only spreads new events across shards; which process polls
/// which shard is decided at deployment.
#[derive(Debug)]
pub struct ShardAssigner {
    current: AtomicU32,
    max: AtomicU32,
}

impl ShardAssigner {
    pub fn new(max: u32) -> Self {
        Self {
            current: AtomicU32::new(1),
            max: AtomicU32::new(max.max(1)),
        }
    }

    /// Shard for the next event: the current value, after which the
    /// counter moves to the next shard, wrapping past `max` to 1.
    pub fn next(&self) -> u32 {
        let max = self.max.load(Ordering::Acquire);
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current >= max { 1 } else { current + 1 })
            })
            .unwrap_or(1);
        previous.clamp(1, max)
    }

    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    /// Change the shard count; zero is treated as one.
    pub fn set_max(&self, max: u32) {
        self.max.store(max.max(1), Ordering::Release);
    }

    /// Parse an option value. An absent option means one shard; `None`
    /// marks a value that is present but not a positive number.
    pub fn parse_max(value: Option<&str>) -> Option<u32> {
        match value {
            None => Some(1),
            Some(v) => v.trim().parse::<u32>().ok().filter(|v| *v > 0),
        }
    }
}

impl Default for ShardAssigner {
    fn default() -> Self {
        Self::new(1)
    }
}
