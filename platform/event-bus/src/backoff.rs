//! Redelivery backoff schedule lookup
//!
//! Consumers negatively acknowledge failed messages with a delay picked from a
//! configured schedule, indexed by how many times the bus has delivered the
//! message so far.

use std::time::Duration;

/// Delay to request for a message that has been delivered `delivered` times.
///
/// Returns `schedule[min(delivered - 1, len - 1)]`. An empty schedule (or a
/// zero entry) yields `None` so the bus applies its default redelivery timing.
pub fn backoff_for_attempt(schedule: &[Duration], delivered: u64) -> Option<Duration> {
    let last = schedule.len().checked_sub(1)?;
    let idx = usize::try_from(delivered.saturating_sub(1))
        .unwrap_or(usize::MAX)
        .min(last);

    let delay = schedule[idx];
    if delay.is_zero() {
        None
    } else {
        Some(delay)
    }
}
