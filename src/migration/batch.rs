use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub initial_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Batches slower than this halve the next batch.
    pub slow_batch_ms: u64,
    /// Batches faster than this grow the next batch by half.
    pub fast_batch_ms: u64,
    /// Pause between batches so other work in the context can run.
    pub yield_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            initial_size: 100,
            min_size: 10,
            max_size: 1_000,
            slow_batch_ms: 200,
            fast_batch_ms: 50,
            yield_ms: 2,
        }
    }
}

impl BatchSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size == 0 {
            return Err("batch.min_size must be at least 1".into());
        }
        if self.min_size > self.max_size {
            return Err("batch.min_size exceeds batch.max_size".into());
        }
        if self.fast_batch_ms > self.slow_batch_ms {
            return Err("batch.fast_batch_ms exceeds batch.slow_batch_ms".into());
        }
        Ok(())
    }
}

/// Sizes copy and verification batches from the time the previous one took.
#[derive(Debug, Clone)]
pub struct AdaptiveBatcher {
    settings: BatchSettings,
    current: usize,
}

impl AdaptiveBatcher {
    pub fn new(settings: BatchSettings) -> Self {
        let current = settings
            .initial_size
            .clamp(settings.min_size.max(1), settings.max_size.max(1));
        Self { settings, current }
    }

    pub fn size(&self) -> usize {
        self.current
    }

    pub fn yield_delay(&self) -> Duration {
        Duration::from_millis(self.settings.yield_ms)
    }

    /// Feed back how long a batch of `items` took.
    pub fn observe(&mut self, items: usize, elapsed_ms: u64) {
        let previous = self.current;
        if elapsed_ms > self.settings.slow_batch_ms {
            self.current = (self.current / 2).max(self.settings.min_size.max(1));
        } else if elapsed_ms < self.settings.fast_batch_ms && items >= self.current {
            let grown = self.current.saturating_add((self.current / 2).max(1));
            self.current = grown.min(self.settings.max_size.max(1));
        }
        if previous != self.current {
            debug!(
                "batch of {items} took {elapsed_ms}ms; next batch size {} (was {previous})",
                self.current
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_batches_shrink_to_floor() {
        let mut batcher = AdaptiveBatcher::new(BatchSettings::default());
        for _ in 0..10 {
            batcher.observe(batcher.size(), 500);
        }
        assert_eq!(batcher.size(), 10);
    }

    #[test]
    fn test_fast_full_batches_grow_to_ceiling() {
        let mut batcher = AdaptiveBatcher::new(BatchSettings::default());
        batcher.observe(100, 1);
        assert_eq!(batcher.size(), 150);
        for _ in 0..20 {
            batcher.observe(batcher.size(), 1);
        }
        assert_eq!(batcher.size(), 1_000);
    }

    #[test]
    fn test_short_tail_batch_does_not_grow() {
        let mut batcher = AdaptiveBatcher::new(BatchSettings::default());
        batcher.observe(7, 1);
        assert_eq!(batcher.size(), 100);
        batcher.observe(100, 120);
        assert_eq!(batcher.size(), 100);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let settings = BatchSettings {
            min_size: 50,
            max_size: 10,
            ..BatchSettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(BatchSettings::default().validate().is_ok());
    }

    #[test]
    fn test_default_yields_between_batches() {
        let batcher = AdaptiveBatcher::new(BatchSettings::default());
        assert_eq!(batcher.yield_delay(), Duration::from_millis(2));
    }
}
