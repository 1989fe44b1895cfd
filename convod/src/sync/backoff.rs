use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before retry `attempt`, never shorter than a server-provided
    /// `retry_after` but still bounded by the configured maximum.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_for_with_rng(attempt, retry_after, &mut rng)
    }

    pub fn delay_for_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let delay = self.delay_with_rng(attempt, rng);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max)),
            None => delay,
        }
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn doubles_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(1), false);
        let mut rng = StdRng::seed_from_u64(3);
        let delays: Vec<u128> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![250, 500, 1_000, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let ceiling = Duration::from_millis((100u64 << attempt).min(800));
            assert!(delay <= ceiling);
        }
    }

    #[test]
    fn retry_after_raises_the_floor_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_for_with_rng(0, Some(Duration::from_secs(2)), &mut rng),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.delay_for_with_rng(0, Some(Duration::from_secs(60)), &mut rng),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff.delay_for_with_rng(1, None, &mut rng),
            Duration::from_millis(200)
        );
    }
}
