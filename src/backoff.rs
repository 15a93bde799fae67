//! Fibonacci backoff shared by cluster-slot discovery and pub/sub reconnect
//! (§7): up to 7 attempts, delays 1,1,2,3,5,8,13 seconds.

use std::time::Duration;

pub struct FibonacciBackoff {
    prev: u64,
    curr: u64,
    attempt: u32,
}

impl FibonacciBackoff {
    pub const MAX_ATTEMPTS: u32 = 7;

    pub fn new() -> Self {
        Self {
            prev: 0,
            curr: 1,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.prev = 0;
        self.curr = 1;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= Self::MAX_ATTEMPTS
    }

    /// Advances the sequence and returns the next delay in seconds.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.curr;
        let next = self.prev + self.curr;
        self.prev = self.curr;
        self.curr = next;
        self.attempt += 1;
        Duration::from_secs(delay)
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_matches_spec() {
        let mut backoff = FibonacciBackoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8, 13]);
        assert!(backoff.exhausted());
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
        assert_eq!(backoff.attempt(), 1);
    }
}
