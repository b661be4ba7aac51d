use std::collections::HashMap;

use crate::domain::Platform;

/// Counts consecutive parse failures per platform. A run of parse errors
/// usually means the upstream page layout changed.
#[derive(Debug)]
pub struct ParseAlarm {
    threshold: u32,
    consecutive: HashMap<Platform, u32>,
}

impl ParseAlarm {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: HashMap::new(),
        }
    }

    /// Returns the current streak when it reaches the threshold (and every
    /// further multiple of it), i.e. when administrators should be told.
    pub fn record_failure(&mut self, platform: Platform) -> Option<u32> {
        let n = self.consecutive.entry(platform).or_insert(0);
        *n += 1;
        (*n % self.threshold == 0).then_some(*n)
    }

    pub fn record_success(&mut self, platform: Platform) {
        self.consecutive.remove(&platform);
    }

    pub fn streak(&self, platform: Platform) -> u32 {
        self.consecutive.get(&platform).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_at_threshold_and_its_multiples() {
        let mut a = ParseAlarm::new(3);
        assert_eq!(a.record_failure(Platform::Yahoo), None);
        assert_eq!(a.record_failure(Platform::Yahoo), None);
        assert_eq!(a.record_failure(Platform::Yahoo), Some(3));
        assert_eq!(a.record_failure(Platform::Yahoo), None);
        assert_eq!(a.record_failure(Platform::Yahoo), None);
        assert_eq!(a.record_failure(Platform::Yahoo), Some(6));
    }

    #[test]
    fn success_resets_only_that_platform() {
        let mut a = ParseAlarm::new(2);
        a.record_failure(Platform::Yahoo);
        a.record_failure(Platform::Mercari);
        a.record_success(Platform::Yahoo);
        assert_eq!(a.streak(Platform::Yahoo), 0);
        assert_eq!(a.record_failure(Platform::Yahoo), None);
        assert_eq!(a.record_failure(Platform::Mercari), Some(2));
    }
}
