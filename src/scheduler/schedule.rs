use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::storage::Source;

/// Largest exponent used when doubling the poll interval after failures.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Failure backoff: `interval * 2^failures`, capped at `max_backoff`, spread by
/// `±jitter`.
///
/// The result always lies in `[interval, max(interval, max_backoff)]`: a
/// failing source is never polled sooner than a healthy one, and jitter never
/// pushes past the ceiling.
pub fn backoff_delay<R: Rng + ?Sized>(
    interval: Duration,
    failures: u32,
    max_backoff: Duration,
    jitter: f64,
    rng: &mut R,
) -> Duration {
    let ceiling = max_backoff.max(interval);
    let factor = 2u32.saturating_pow(failures.min(MAX_BACKOFF_EXPONENT));
    let base = interval.saturating_mul(factor).min(ceiling);
    let spread = jitter.clamp(0.0, 0.99);
    let scale = rng.random_range(1.0 - spread..=1.0 + spread);
    let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(ceiling);
    jittered.clamp(interval, ceiling)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `start + delay`, saturating at the largest representable instant.
fn due_after(start: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Where a source is in its poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle { next_due_at: DateTime<Utc> },
    /// A poll is in flight; never dispatched again until its result is recorded
    Polling,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    interval: Duration,
    enabled: bool,
}

/// Per-source schedule state, owned by the scheduler's coordinator task.
#[derive(Debug)]
pub struct ScheduleBook {
    slots: HashMap<i64, Slot>,
    default_interval: Duration,
    max_backoff: Duration,
    jitter: f64,
}

impl ScheduleBook {
    pub fn new(default_interval: Duration, max_backoff: Duration, jitter: f64) -> Self {
        Self {
            slots: HashMap::new(),
            default_interval,
            max_backoff,
            jitter,
        }
    }

    fn interval_for(&self, source: &Source) -> Duration {
        let default_secs = i64::try_from(self.default_interval.as_secs()).unwrap_or(i64::MAX);
        u64::try_from(source.interval_or(default_secs))
            .map(Duration::from_secs)
            .unwrap_or(self.default_interval)
    }

    /// Reconcile with the current source list.
    ///
    /// New sources become due at `last_polled_at + interval` (or now if never
    /// polled or overdue); removed sources are forgotten; a source that went
    /// from disabled to enabled becomes due immediately. Interval changes apply
    /// from the next recorded result.
    pub fn sync(&mut self, sources: &[Source], now: DateTime<Utc>) {
        let mut live = HashMap::with_capacity(sources.len());

        for source in sources {
            let interval = self.interval_for(source);
            let slot = match self.slots.remove(&source.id) {
                Some(mut slot) => {
                    if source.enabled && !slot.enabled {
                        if let SlotState::Idle { .. } = slot.state {
                            slot.state = SlotState::Idle { next_due_at: now };
                        }
                    }
                    slot.enabled = source.enabled;
                    slot.interval = interval;
                    slot
                }
                None => {
                    let next_due_at = source
                        .last_polled_at
                        .and_then(|ts| DateTime::from_timestamp(ts, 0))
                        .map(|last| due_after(last, interval))
                        .filter(|due| *due > now)
                        .unwrap_or(now);
                    Slot {
                        state: SlotState::Idle { next_due_at },
                        interval,
                        enabled: source.enabled,
                    }
                }
            };
            live.insert(source.id, slot);
        }

        // In-flight polls of deleted sources stay tracked until their result lands
        for (id, slot) in self.slots.drain() {
            if slot.state == SlotState::Polling {
                live.insert(
                    id,
                    Slot {
                        enabled: false,
                        ..slot
                    },
                );
            }
        }

        self.slots = live;
    }

    /// Enabled, idle sources whose due time has passed, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<i64> {
        let mut due: Vec<(DateTime<Utc>, i64)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.enabled)
            .filter_map(|(id, slot)| match slot.state {
                SlotState::Idle { next_due_at } if next_due_at <= now => Some((next_due_at, *id)),
                _ => None,
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Move an idle source to `Polling`. Returns false if it is unknown or
    /// already in flight.
    pub fn mark_polling(&mut self, id: i64) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.state != SlotState::Polling => {
                slot.state = SlotState::Polling;
                true
            }
            _ => false,
        }
    }

    /// Successful poll (including not-modified): due again one interval from now.
    pub fn record_success(&mut self, id: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let slot = self.slots.get_mut(&id)?;
        let next_due_at = due_after(now, slot.interval);
        slot.state = SlotState::Idle { next_due_at };
        Some(next_due_at)
    }

    /// Failed poll: due again after the jittered exponential backoff for
    /// `failures` consecutive failures.
    pub fn record_failure<R: Rng + ?Sized>(
        &mut self,
        id: i64,
        failures: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<DateTime<Utc>> {
        let (max_backoff, jitter) = (self.max_backoff, self.jitter);
        let slot = self.slots.get_mut(&id)?;
        let delay = backoff_delay(slot.interval, failures, max_backoff, jitter, rng);
        let next_due_at = due_after(now, delay);
        slot.state = SlotState::Idle { next_due_at };
        Some(next_due_at)
    }

    /// Make an idle source due now. Returns false if it is unknown or polling.
    pub fn poll_now(&mut self, id: i64, now: DateTime<Utc>) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.state != SlotState::Polling => {
                slot.state = SlotState::Idle { next_due_at: now };
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, id: i64) -> Option<SlotState> {
        self.slots.get(&id).map(|slot| slot.state)
    }

    pub fn next_due_at(&self, id: i64) -> Option<DateTime<Utc>> {
        match self.state(id)? {
            SlotState::Idle { next_due_at } => Some(next_due_at),
            SlotState::Polling => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state == SlotState::Polling)
            .count()
    }

    /// Number of tracked sources, including deleted ones still in flight.
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }
}
