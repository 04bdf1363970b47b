//! Per-peer reconnect delay with escalating wait and jitter.

use std::time::Duration;

use rand::Rng;

/// Wait before the first reconnect attempt, in time units.
pub const INITIAL_WAIT: u32 = 13;
/// Upper bound for the wait, in time units.
pub const MAX_WAIT: u32 = 60;
/// Jitter is drawn in hundredths of a unit from `0..JITTER_STEPS`.
const JITTER_STEPS: u32 = 255;

/// A reconnect timer that has been requested but not yet fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    pub generation: u64,
    pub delay: Duration,
}

/// Tracks the reconnect wait for one peer.
///
/// The scheduler never sleeps itself; it hands out `Armed` timers that the
/// event loop is expected to run, and recognises its own timer by
/// generation when it fires.  Generations are supplied by the caller and
/// must never repeat for the lifetime of the process.
#[derive(Debug)]
pub struct BackoffScheduler {
    unit: Duration,
    wait: u32,
    pending: Option<u64>,
}

impl BackoffScheduler {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            wait: INITIAL_WAIT,
            pending: None,
        }
    }

    /// Arms the next reconnect timer and escalates the wait for the one after.
    pub fn schedule<R: Rng>(&mut self, rng: &mut R, generation: u64) -> Armed {
        let jitter = rng.random_range(0..JITTER_STEPS);
        let units = self.wait as f64 + f64::from(jitter) / 100.0;
        if self.wait < MAX_WAIT {
            self.wait += 1;
        }
        self.pending = Some(generation);
        Armed {
            generation,
            delay: self.unit.mul_f64(units),
        }
    }

    /// Forgets the pending timer, if any, without touching the wait.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Cancels any pending timer and resets the wait.  Returns whether a
    /// timer was pending.
    pub fn disable(&mut self) -> bool {
        self.wait = INITIAL_WAIT;
        self.cancel()
    }

    /// Consumes a fired timer; stale generations are rejected.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.pending == Some(generation) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Wait, in whole units, that the next `schedule` call will use.
    pub fn current_wait(&self) -> u32 {
        self.wait
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn scheduler() -> BackoffScheduler {
        BackoffScheduler::new(Duration::from_secs(1))
    }

    #[test]
    fn waits_escalate_and_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = scheduler();
        let mut waits = Vec::new();
        for generation in 0..80 {
            waits.push(backoff.current_wait());
            backoff.schedule(&mut rng, generation);
        }
        assert_eq!(waits[0], INITIAL_WAIT);
        assert_eq!(waits[1], INITIAL_WAIT + 1);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*waits.last().unwrap(), MAX_WAIT);
        assert!(waits.iter().all(|w| *w <= MAX_WAIT));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let mut backoff = scheduler();
            let armed = backoff.schedule(&mut rng, 1);
            let jitter = armed.delay.as_secs_f64() - f64::from(INITIAL_WAIT);
            assert!(jitter >= 0.0, "negative jitter {jitter}");
            assert!(jitter < 2.55, "jitter too large {jitter}");
        }
    }

    #[test]
    fn disable_resets_wait_and_cancels() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = scheduler();
        for generation in 0..5 {
            backoff.schedule(&mut rng, generation);
        }
        assert!(backoff.is_armed());
        assert!(backoff.disable());
        assert!(!backoff.is_armed());
        assert_eq!(backoff.current_wait(), INITIAL_WAIT);
        assert!(!backoff.disable());
    }

    #[test]
    fn stale_generations_do_not_fire() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = scheduler();
        let first = backoff.schedule(&mut rng, 1);
        backoff.disable();
        let second = backoff.schedule(&mut rng, 2);
        assert!(!backoff.fire(first.generation));
        assert!(backoff.fire(second.generation));
        assert!(!backoff.fire(second.generation));
    }

    #[test]
    fn unit_scales_delay() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut backoff = BackoffScheduler::new(Duration::from_millis(1));
        let armed = backoff.schedule(&mut rng, 1);
        assert!(armed.delay >= Duration::from_millis(13));
        assert!(armed.delay < Duration::from_micros(15_550));
    }
}
