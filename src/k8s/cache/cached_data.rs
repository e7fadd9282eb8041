use super::config::MAX_DURATION_SECS;
use std::time::{Duration, Instant};

/// Longest TTL an entry keeps; longer ones are clamped so expiry never overflows
pub const MAX_ENTRY_TTL: Duration = Duration::from_secs(MAX_DURATION_SECS);

/// One slot in the cache
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_ENTRY_TTL)).unwrap_or(now);
        Self {
            value,
            inserted_at: now,
            expires_at,
            last_access: now,
            access_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.inserted_at)
    }

    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.is_expired_at(now) {
            None
        } else {
            Some(self.expires_at - now)
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }
}
