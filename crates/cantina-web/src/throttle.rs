//! Per-topic outbound throttling (spec.md §4.8, §9): a token bucket per
//! outbound event name plus consecutive-duplicate suppression, so a busy
//! internal topic can't flood every connected dashboard.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::time::Instant;

/// Default broadcast rate per outbound topic.
pub const DEFAULT_RATE_PER_SECOND: f64 = 4.0;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_payload: Option<Value>,
}

pub struct Throttle {
    rate_per_second: f64,
    buckets: Mutex<HashMap<&'static str, Bucket>>,
}

impl Throttle {
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            rate_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `payload` should be broadcast on `event` right now:
    /// the bucket has a token available *and* the payload differs from the
    /// last one broadcast for this event.
    pub fn allow(&self, event: &'static str, payload: &Value) -> bool {
        let mut guard = self.buckets.lock().expect("throttle bucket lock poisoned");
        let now = Instant::now();
        let bucket = guard.entry(event).or_insert_with(|| Bucket {
            tokens: self.rate_per_second,
            last_refill: now,
            last_payload: None,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.rate_per_second);
        bucket.last_refill = now;

        if bucket.last_payload.as_ref() == Some(payload) {
            return false;
        }
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        bucket.last_payload = Some(payload.clone());
        true
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn identical_consecutive_payloads_are_suppressed() {
        let throttle = Throttle::new(10.0);
        let payload = serde_json::json!({"mode": "IDLE"});
        assert!(throttle.allow("system_status", &payload));
        assert!(!throttle.allow("system_status", &payload));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let throttle = Throttle::new(1.0);
        let a = serde_json::json!({"n": 1});
        let b = serde_json::json!({"n": 2});
        let c = serde_json::json!({"n": 3});
        assert!(throttle.allow("music_status", &a));
        assert!(!throttle.allow("music_status", &b), "bucket should be empty immediately after");
        tokio::time::advance(std::time::Duration::from_millis(1100)).await;
        assert!(throttle.allow("music_status", &c));
    }

    #[tokio::test(start_paused = true)]
    async fn different_topics_have_independent_buckets() {
        let throttle = Throttle::new(1.0);
        let a = serde_json::json!({"n": 1});
        assert!(throttle.allow("music_status", &a));
        assert!(throttle.allow("voice_status", &a));
    }
}
