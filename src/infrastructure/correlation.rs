use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Cross-system correlation identifier. Opaque to everything but the
/// generator; rendered as an ISO-8601 timestamp with microsecond precision.
pub type CorrelationId = String;

/// Issues correlation ids that are strictly increasing in issuance order and
/// collision-free under bursty creation within the same millisecond.
///
/// The wall clock is sampled once at construction and extended with the
/// monotonic clock, so ids keep increasing even if the system clock steps
/// backwards. Uniqueness holds per process for operational timeframes; there
/// is no coordination with other processes.
pub struct CorrelationGenerator {
    base_micros: i64,
    started: Instant,
    last_issued: AtomicI64,
}

impl CorrelationGenerator {
    pub fn new() -> Self {
        let base_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self {
            base_micros,
            started: Instant::now(),
            last_issued: AtomicI64::new(0),
        }
    }

    pub fn generate(&self) -> CorrelationId {
        let now = self.base_micros + self.started.elapsed().as_micros() as i64;
        // fetch_update yields the value that was replaced; the id issued to
        // this caller is the stored successor, not the predecessor.
        let issued = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|previous| now.max(previous + 1))
            .unwrap_or(now);
        render_micros(issued)
    }
}

impl Default for CorrelationGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn render_micros(micros: i64) -> String {
    let ts: DateTime<Utc> = DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now);
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
