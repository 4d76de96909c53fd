//! Minute-grid scheduling for the reconciliation cycles.
//!
//! Each cycle runs in its own task: sleep until the next wall-clock slot,
//! run the cycle to completion, repeat. Because a task awaits its cycle
//! before computing the next slot, two instances of the same cycle can
//! never overlap; a slot that passes while a cycle is still running is
//! skipped.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

/// A wall-clock firing rule: fire whenever `minute % period == offset`,
/// at zero seconds.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub period_minutes: u32,
    pub offset_minutes: u32,
}

impl Schedule {
    pub fn new(period_minutes: u32, offset_minutes: u32) -> Self {
        Self {
            period_minutes,
            offset_minutes,
        }
    }

    /// Time until the next slot strictly after `now`.
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Duration {
        let period = i64::from(self.period_minutes) * 60;
        let offset = i64::from(self.offset_minutes) * 60;

        let now_secs = now.timestamp();
        let next = (now_secs - offset).div_euclid(period) * period + period + offset;

        Duration::from_secs((next - now_secs) as u64)
    }
}

/// Drive `cycle` on `schedule` until the task is aborted. Cycle failures
/// are logged; the loop keeps going.
pub async fn run_cycle<F, Fut>(name: &'static str, schedule: Schedule, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        let delay = schedule.delay_until_next(Utc::now());
        debug!(cycle = name, delay_secs = delay.as_secs(), "sleeping until next slot");
        tokio::time::sleep(delay).await;

        if let Err(e) = cycle().await {
            error!(cycle = name, error = %format!("{e:#}"), "cycle failed");
        }
    }
}
