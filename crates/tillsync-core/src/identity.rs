//! Externally visible identity numbers (`reg_no`).
//!
//! An identity packs `[discriminant][sequence slot][time ticks]` into a
//! positive `i64`. Ticks come from the wall clock at the requested
//! resolution; a per-resolution high-water mark bumps a tick that would
//! repeat, so concurrent callers never see the same value.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::EntityKind;

/// Ticks occupy the low fifteen decimal digits.
const TICK_SLOT: i64 = 1_000_000_000_000_000;
/// Width of the optional sequence slot between discriminant and ticks.
const SEQUENCE_SLOT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Minutes,
    Seconds,
    Micros,
}

impl Resolution {
    pub const DEFAULT: Resolution = Resolution::Micros;

    fn index(self) -> usize {
        match self {
            Resolution::Minutes => 0,
            Resolution::Seconds => 1,
            Resolution::Micros => 2,
        }
    }

    fn ticks_since(self, epoch: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
        let elapsed = now - epoch;
        match self {
            Resolution::Minutes => Some(elapsed.num_minutes()),
            Resolution::Seconds => Some(elapsed.num_seconds()),
            Resolution::Micros => elapsed.num_microseconds(),
        }
    }
}

impl FromStr for Resolution {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(Resolution::Minutes),
            "seconds" => Ok(Resolution::Seconds),
            "micros" => Ok(Resolution::Micros),
            other => Err(SequencerError::UnknownResolution(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("unknown time resolution `{0}` (expected minutes, seconds or micros)")]
    UnknownResolution(String),
    #[error("sequence value {0} does not fit the two-digit sequence slot")]
    SequenceOutOfRange(u64),
    #[error("identity for discriminant {0} does not fit in an i64")]
    Overflow(u32),
    #[error("clock reads earlier than the identity epoch")]
    ClockBeforeEpoch,
}

#[derive(Debug)]
pub struct IdentitySequencer {
    epoch: DateTime<Utc>,
    high_water: [AtomicI64; 3],
}

impl Default for IdentitySequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySequencer {
    pub fn new() -> Self {
        Self::with_epoch(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        )
    }

    pub fn with_epoch(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            high_water: [AtomicI64::new(-1), AtomicI64::new(-1), AtomicI64::new(-1)],
        }
    }

    /// Identity for the first creation of a record of `kind`.
    pub fn next_for(&self, kind: EntityKind) -> Result<i64, SequencerError> {
        self.generate(kind.discriminant(), None, None)
    }

    /// `resolution` must be one of `minutes`, `seconds`, `micros`; `None`
    /// selects [`Resolution::DEFAULT`].
    pub fn generate(
        &self,
        discriminant: u32,
        sequence: Option<u64>,
        resolution: Option<&str>,
    ) -> Result<i64, SequencerError> {
        self.generate_at(discriminant, sequence, resolution, Utc::now())
    }

    pub fn generate_at(
        &self,
        discriminant: u32,
        sequence: Option<u64>,
        resolution: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64, SequencerError> {
        let resolution = match resolution {
            Some(raw) => raw.parse::<Resolution>()?,
            None => Resolution::DEFAULT,
        };
        let sequence = sequence.unwrap_or(0);
        if sequence >= SEQUENCE_SLOT {
            return Err(SequencerError::SequenceOutOfRange(sequence));
        }

        let prefix = i64::from(discriminant)
            .checked_mul(SEQUENCE_SLOT as i64)
            .and_then(|p| p.checked_add(sequence as i64))
            .and_then(|p| p.checked_mul(TICK_SLOT))
            .ok_or(SequencerError::Overflow(discriminant))?;

        let observed = resolution
            .ticks_since(self.epoch, now)
            .filter(|t| *t >= 0)
            .ok_or(SequencerError::ClockBeforeEpoch)?;
        let tick = self.claim_tick(resolution, observed);
        if tick >= TICK_SLOT {
            return Err(SequencerError::Overflow(discriminant));
        }

        prefix
            .checked_add(tick)
            .ok_or(SequencerError::Overflow(discriminant))
    }

    fn claim_tick(&self, resolution: Resolution, observed: i64) -> i64 {
        let slot = &self.high_water[resolution.index()];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            let next = observed.max(current + 1);
            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn unknown_resolution_is_an_error_value() {
        let sequencer = IdentitySequencer::new();
        let result = sequencer.generate(6, Some(2), Some("not-a-resolution"));
        assert_eq!(
            result,
            Err(SequencerError::UnknownResolution("not-a-resolution".into()))
        );
    }

    #[test]
    fn concurrent_generation_yields_distinct_values() {
        let sequencer = Arc::new(IdentitySequencer::new());
        let per_thread = 500;
        let threads = 8;

        let values: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let sequencer = Arc::clone(&sequencer);
                    scope.spawn(move || {
                        (0..per_thread)
                            .map(|_| sequencer.next_for(EntityKind::Receipt).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let distinct: HashSet<_> = values.iter().copied().collect();
        assert_eq!(distinct.len(), per_thread * threads);
    }

    #[test]
    fn layout_carries_discriminant_and_sequence() {
        let epoch = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap();
        let sequencer = IdentitySequencer::with_epoch(epoch);
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).single().unwrap();

        let id = sequencer.generate_at(7, Some(42), Some("minutes"), now).unwrap();
        assert_eq!(id, 742 * TICK_SLOT + 10);

        // same minute again: bumped, not repeated
        let again = sequencer.generate_at(7, Some(42), Some("minutes"), now).unwrap();
        assert_eq!(again, 742 * TICK_SLOT + 11);
    }

    #[test]
    fn out_of_range_inputs_fail() {
        let sequencer = IdentitySequencer::new();
        assert_eq!(
            sequencer.generate(1, Some(100), None),
            Err(SequencerError::SequenceOutOfRange(100))
        );
        assert_eq!(
            sequencer.generate(1000, None, Some("seconds")),
            Err(SequencerError::Overflow(1000))
        );

        let before = Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).single().unwrap();
        assert_eq!(
            sequencer.generate_at(1, None, None, before),
            Err(SequencerError::ClockBeforeEpoch)
        );
    }
}
