use std::collections::VecDeque;
use std::time::{Duration, Instant};

use alloy::network::Ethereum;
use alloy::providers::RootProvider;
use parking_lot::Mutex;

/// Learned rate limits never leave this band.
pub(crate) const MIN_RPS: f64 = 1.0;
pub(crate) const MAX_RPS: f64 = 500.0;
const INITIAL_RPS: f64 = 25.0;

/// Consecutive successes required before a limit raise is considered.
const SUCCESS_WINDOW: u32 = 100;
/// The raise only fires when the endpoint was actually pushed this hard.
const RAISE_UTILIZATION: f64 = 0.8;

const LATENCY_SAMPLES: usize = 50;
const RPS_WINDOW: Duration = Duration::from_secs(1);

const DEACTIVATION_BASE: Duration = Duration::from_millis(100);
const DEACTIVATION_FACTOR: f64 = 1.5;
const DEACTIVATION_CAP: Duration = Duration::from_secs(5);

/// Successes needed before a reactivated endpoint stops being treated as
/// warming up.
const WARMUP_SUCCESSES: u32 = 5;
/// In-flight cap while warming up.
const WARMUP_CONNECTIONS: u32 = 3;

/// Per-endpoint routing state: liveness, learned rate limit, and a latency
/// window the scheduler ranks buckets by.
pub(crate) struct Bucket {
    pub host: String,
    pub provider: RootProvider<Ethereum>,
    state: Mutex<BucketState>,
}

struct BucketState {
    active: bool,
    warming_up: bool,
    active_connections: u32,
    rps_limit: f64,
    consecutive_successes: u32,
    deactivation_delay: Duration,
    reactivate_at: Option<Instant>,
    /// Recent `(latency, success)` outcomes.
    samples: VecDeque<(Duration, bool)>,
    /// Request start times inside the sliding RPS window.
    request_times: VecDeque<Instant>,
}

impl Bucket {
    pub fn new(url: &str) -> eyre::Result<Self> {
        let parsed: alloy::transports::http::reqwest::Url = url
            .parse()
            .map_err(|e| eyre::eyre!("invalid rpc url '{url}': {e}"))?;
        let host = parsed.host_str().unwrap_or(url).to_string();
        let provider = RootProvider::new_http(parsed);
        Ok(Bucket {
            host,
            provider,
            state: Mutex::new(BucketState {
                active: true,
                warming_up: false,
                active_connections: 0,
                rps_limit: INITIAL_RPS,
                consecutive_successes: 0,
                deactivation_delay: DEACTIVATION_BASE,
                reactivate_at: None,
                samples: VecDeque::with_capacity(LATENCY_SAMPLES),
                request_times: VecDeque::new(),
            }),
        })
    }

    /// Whether the scheduler may dispatch here right now. Reactivates the
    /// bucket (into warm-up) once its penalty delay has elapsed.
    pub fn is_available(&self, now: Instant) -> bool {
        let mut s = self.state.lock();
        if !s.active {
            match s.reactivate_at {
                Some(at) if at <= now => {
                    s.active = true;
                    s.warming_up = true;
                    s.consecutive_successes = 0;
                }
                _ => return false,
            }
        }
        if s.warming_up && s.active_connections >= WARMUP_CONNECTIONS {
            return false;
        }
        while let Some(front) = s.request_times.front() {
            if now.duration_since(*front) > RPS_WINDOW {
                s.request_times.pop_front();
            } else {
                break;
            }
        }
        (s.request_times.len() as f64) < s.rps_limit
    }

    pub fn begin_request(&self, now: Instant) {
        let mut s = self.state.lock();
        s.active_connections += 1;
        s.request_times.push_back(now);
    }

    pub fn record_success(&self, latency: Duration, now: Instant) {
        let mut s = self.state.lock();
        s.active_connections = s.active_connections.saturating_sub(1);
        push_sample(&mut s.samples, latency, true);
        s.consecutive_successes += 1;
        s.deactivation_delay = DEACTIVATION_BASE;
        if s.warming_up && s.consecutive_successes >= WARMUP_SUCCESSES {
            s.warming_up = false;
        }
        if s.consecutive_successes >= SUCCESS_WINDOW {
            let observed = observed_rps(&mut s.request_times, now);
            if observed >= RAISE_UTILIZATION * s.rps_limit {
                s.rps_limit = (s.rps_limit * 1.05).min(MAX_RPS);
            }
            s.consecutive_successes = 0;
        }
    }

    /// `penalize` marks 429/timeout-class failures that deactivate the
    /// bucket and lower its learned limit.
    pub fn record_failure(&self, latency: Duration, penalize: bool, now: Instant) {
        let mut s = self.state.lock();
        s.active_connections = s.active_connections.saturating_sub(1);
        push_sample(&mut s.samples, latency, false);
        s.consecutive_successes = 0;
        if penalize {
            s.active = false;
            s.warming_up = false;
            s.rps_limit = (s.rps_limit * 0.95).max(MIN_RPS);
            s.reactivate_at = Some(now + s.deactivation_delay);
            let next = s.deactivation_delay.as_secs_f64() * DEACTIVATION_FACTOR;
            s.deactivation_delay = Duration::from_secs_f64(next).min(DEACTIVATION_CAP);
        }
    }

    /// Mean latency over recent successful samples; `None` until the bucket
    /// has served something.
    pub fn average_latency(&self) -> Option<Duration> {
        let s = self.state.lock();
        let successes: Vec<Duration> = s
            .samples
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(latency, _)| *latency)
            .collect();
        if successes.is_empty() {
            return None;
        }
        Some(successes.iter().sum::<Duration>() / successes.len() as u32)
    }

    pub fn active_connections(&self) -> u32 {
        self.state.lock().active_connections
    }

    #[cfg(test)]
    pub fn rps_limit(&self) -> f64 {
        self.state.lock().rps_limit
    }
}

fn push_sample(samples: &mut VecDeque<(Duration, bool)>, latency: Duration, ok: bool) {
    if samples.len() == LATENCY_SAMPLES {
        samples.pop_front();
    }
    samples.push_back((latency, ok));
}

fn observed_rps(request_times: &mut VecDeque<Instant>, now: Instant) -> f64 {
    while let Some(front) = request_times.front() {
        if now.duration_since(*front) > RPS_WINDOW {
            request_times.pop_front();
        } else {
            break;
        }
    }
    request_times.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> Bucket {
        Bucket::new("http://localhost:8545").unwrap()
    }

    #[test]
    fn test_rate_limit_failure_deactivates_and_lowers_limit() {
        let b = bucket();
        let now = Instant::now();
        assert!(b.is_available(now));

        b.begin_request(now);
        b.record_failure(Duration::from_millis(50), true, now);

        assert!(!b.is_available(now));
        assert!((b.rps_limit() - INITIAL_RPS * 0.95).abs() < 1e-9);

        // penalty delay elapsed: reactivates into warm-up
        assert!(b.is_available(now + Duration::from_millis(150)));
    }

    #[test]
    fn test_deactivation_delay_backs_off_and_caps() {
        let b = bucket();
        let mut now = Instant::now();
        let mut last_gap = Duration::ZERO;
        for _ in 0..20 {
            b.begin_request(now);
            b.record_failure(Duration::from_millis(10), true, now);
            // find when it comes back
            let mut gap = Duration::from_millis(10);
            while !b.is_available(now + gap) {
                gap += Duration::from_millis(10);
                assert!(gap < Duration::from_secs(10));
            }
            assert!(gap >= last_gap);
            last_gap = gap;
            now += gap;
        }
        assert!(last_gap <= DEACTIVATION_CAP + Duration::from_millis(20));
    }

    #[test]
    fn test_rps_limit_floor() {
        let b = bucket();
        let now = Instant::now();
        for _ in 0..200 {
            b.begin_request(now);
            b.record_failure(Duration::from_millis(10), true, now);
        }
        assert!(b.rps_limit() >= MIN_RPS);
    }

    #[test]
    fn test_limit_raise_requires_utilization() {
        let b = bucket();
        let mut now = Instant::now();
        // successes spread out (low observed rps): no raise
        for _ in 0..SUCCESS_WINDOW {
            b.begin_request(now);
            b.record_success(Duration::from_millis(10), now);
            now += Duration::from_secs(2);
        }
        assert!((b.rps_limit() - INITIAL_RPS).abs() < 1e-9);

        // burst at the limit inside one window: raise fires
        for _ in 0..SUCCESS_WINDOW {
            b.begin_request(now);
            b.record_success(Duration::from_millis(10), now);
        }
        assert!(b.rps_limit() > INITIAL_RPS);
    }

    #[test]
    fn test_rps_window_bounds_availability() {
        let b = bucket();
        let now = Instant::now();
        for _ in 0..(INITIAL_RPS as usize) {
            assert!(b.is_available(now));
            b.begin_request(now);
        }
        // at the learned limit inside the window
        assert!(!b.is_available(now));
        // window slides
        assert!(b.is_available(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_average_latency_ignores_failures() {
        let b = bucket();
        let now = Instant::now();
        b.begin_request(now);
        b.record_success(Duration::from_millis(100), now);
        b.begin_request(now);
        b.record_failure(Duration::from_secs(5), false, now);
        assert_eq!(b.average_latency(), Some(Duration::from_millis(100)));
    }
}
