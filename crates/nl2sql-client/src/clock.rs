/// Source of wall-clock time in milliseconds, used to time stage steps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System clock backed by `chrono::Utc`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
    }
}
