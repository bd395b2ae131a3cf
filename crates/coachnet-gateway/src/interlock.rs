//! [`Interlock`] – the process-wide emergency-stop flag.
//!
//! The flag itself is an [`AtomicBool`]: the bus write path only ever loads
//! it, so a stop is visible to every new write as soon as it is stored. The
//! reason and timestamp sit next to it behind a lock that is never held
//! across an await. Engaging and clearing take that lock, so exactly one
//! caller wins an engagement and every loser reads the winner's record.
//!
//! # Reset
//!
//! An operator reset is two-phase. [`Interlock::begin_reset`] marks the
//! current record as being reset while the flag stays set; the facade then
//! journals the reset and calls [`Interlock::clear_if`] with the sequence it
//! journalled. A stop that arrives in between is not swallowed: it engages
//! afresh with a new sequence, and `clear_if` sees the newer record and
//! leaves the flag set.
//!
//! # Restart policy
//!
//! | Last journal row | Interlock at boot |
//! |---|---|
//! | `engaged` | engaged with the recorded reason and time |
//! | `reset` | clear |
//! | none, verification required | engaged, reason "unverified" |
//! | none, verification not required | clear |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use coachnet_store::InterlockEvent;
use coachnet_types::{GatewayError, StopRecord};
use tracing::warn;

/// Reason recorded when a fresh install boots without any journal history.
pub const UNVERIFIED_REASON: &str = "unverified: no recorded interlock state";

/// Sequence of a boot record that has not been numbered yet. The facade
/// replaces it with a broadcaster sequence before anything is signalled.
pub const UNALLOCATED_SEQUENCE: u64 = 0;

/// Result of an attempt to engage the interlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engagement {
    /// This call set the flag.
    Engaged(StopRecord),
    /// The flag was already set; carries the record of the first engagement.
    AlreadyEngaged(StopRecord),
}

impl Engagement {
    pub fn record(&self) -> &StopRecord {
        match self {
            Engagement::Engaged(record) | Engagement::AlreadyEngaged(record) => record,
        }
    }
}

/// Result of [`Interlock::clear_if`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clearing {
    /// The flag is released; carries the record that was cleared.
    Cleared(StopRecord),
    /// A newer stop engaged while the reset was in progress. The flag stays
    /// set and this is the newer record.
    Superseded(StopRecord),
    /// Nothing was engaged.
    AlreadyClear,
}

#[derive(Debug, Default)]
struct Slot {
    record: Option<StopRecord>,
    /// Sequence of the record a reset is in progress for.
    resetting: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Interlock {
    engaged: AtomicBool,
    slot: RwLock<Slot>,
}

impl Interlock {
    /// A clear interlock.
    pub fn new() -> Self {
        Self::default()
    }

    /// An interlock that starts engaged with `record`.
    pub fn engaged_with(record: StopRecord) -> Self {
        Self {
            engaged: AtomicBool::new(true),
            slot: RwLock::new(Slot {
                record: Some(record),
                resetting: None,
            }),
        }
    }

    /// The record the interlock should boot with, given the newest journal
    /// row. `None` means boot clear.
    pub fn restored_record(
        last: Option<InterlockEvent>,
        require_verification_on_first_boot: bool,
    ) -> Option<StopRecord> {
        match last {
            Some(InterlockEvent::Engaged(record)) => {
                warn!(
                    sequence = record.sequence,
                    reason = %record.reason,
                    engaged_at = %record.engaged_at,
                    "interlock was engaged before restart; bus writes stay blocked until reset"
                );
                Some(record)
            }
            Some(InterlockEvent::Reset { .. }) => None,
            None if require_verification_on_first_boot => {
                warn!("no interlock history; starting unverified");
                Some(StopRecord {
                    sequence: UNALLOCATED_SEQUENCE,
                    reason: UNVERIFIED_REASON.to_string(),
                    engaged_at: Utc::now(),
                })
            }
            None => None,
        }
    }

    pub fn from_restored(record: Option<StopRecord>) -> Self {
        match record {
            Some(record) => Self::engaged_with(record),
            None => Self::new(),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    pub fn record(&self) -> Option<StopRecord> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .record
            .clone()
    }

    /// `true` between [`begin_reset`](Self::begin_reset) and the matching
    /// [`clear_if`](Self::clear_if) or [`abort_reset`](Self::abort_reset).
    pub fn reset_pending(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resetting
            .is_some()
    }

    /// Engage the interlock. `sequence` is only called when this call wins.
    ///
    /// While a reset is pending the held record is already on its way out,
    /// so a new stop engages afresh and cancels the reset.
    pub fn engage(&self, sequence: impl FnOnce() -> u64, reason: &str) -> Engagement {
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut *guard;
        if let Some(existing) = slot.record.as_ref() {
            match slot.resetting.take() {
                None => return Engagement::AlreadyEngaged(existing.clone()),
                Some(resetting) => warn!(
                    resetting,
                    %reason,
                    "emergency stop during operator reset; reset cancelled"
                ),
            }
        }
        let record = StopRecord {
            sequence: sequence(),
            reason: reason.to_string(),
            engaged_at: Utc::now(),
        };
        slot.record = Some(record.clone());
        self.engaged.store(true, Ordering::Release);
        Engagement::Engaged(record)
    }

    /// Mark the held record as being reset. The flag stays set. Returns the
    /// record, or `None` when the interlock is clear.
    pub fn begin_reset(&self) -> Option<StopRecord> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let record = slot.record.clone()?;
        slot.resetting = Some(record.sequence);
        Some(record)
    }

    /// Give up a reset started for `sequence`, leaving the flag set.
    pub fn abort_reset(&self, sequence: u64) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.resetting == Some(sequence) {
            slot.resetting = None;
        }
    }

    /// Release the flag, but only if the held record is still the one with
    /// `sequence` and its reset has not been cancelled by a newer stop.
    pub fn clear_if(&self, sequence: u64) -> Clearing {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = slot.record.clone() else {
            slot.resetting = None;
            return Clearing::AlreadyClear;
        };
        if current.sequence != sequence || slot.resetting != Some(sequence) {
            if slot.resetting == Some(sequence) {
                slot.resetting = None;
            }
            return Clearing::Superseded(current);
        }
        slot.record = None;
        slot.resetting = None;
        self.engaged.store(false, Ordering::Release);
        Clearing::Cleared(current)
    }

    /// `Err(Blocked)` while engaged.
    pub fn check(&self) -> Result<(), GatewayError> {
        if !self.is_engaged() {
            return Ok(());
        }
        let reason = self
            .record()
            .map(|r| r.reason)
            .unwrap_or_else(|| "engaged".to_string());
        Err(GatewayError::Blocked { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn first_engagement_wins() {
        let interlock = Interlock::new();
        assert!(interlock.check().is_ok());

        let first = interlock.engage(|| 1, "brake controller failed");
        assert!(matches!(first, Engagement::Engaged(ref r) if r.sequence == 1));
        let second = interlock.engage(|| 2, "operator");
        assert_eq!(second.record(), first.record());
        assert!(matches!(second, Engagement::AlreadyEngaged(_)));

        match interlock.check() {
            Err(GatewayError::Blocked { reason }) => assert_eq!(reason, "brake controller failed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn losers_never_allocate_a_sequence() {
        let interlock = Arc::new(Interlock::new());
        let allocated = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let interlock = interlock.clone();
                let allocated = allocated.clone();
                std::thread::spawn(move || {
                    interlock.engage(
                        || allocated.fetch_add(1, Ordering::SeqCst) + 1,
                        &format!("caller {i}"),
                    )
                })
            })
            .collect();
        let results: Vec<Engagement> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(allocated.load(Ordering::SeqCst), 1);
        let winners = results.iter().filter(|e| matches!(e, Engagement::Engaged(_))).count();
        assert_eq!(winners, 1);
        assert!(results.iter().all(|e| e.record().sequence == 1));
    }

    #[test]
    fn reset_releases_the_flag() {
        let interlock = Interlock::new();
        interlock.engage(|| 3, "test");
        let record = interlock.begin_reset().unwrap();
        assert!(interlock.reset_pending());
        assert!(interlock.is_engaged());

        assert!(matches!(interlock.clear_if(record.sequence), Clearing::Cleared(ref r) if r.sequence == 3));
        assert!(!interlock.is_engaged());
        assert!(!interlock.reset_pending());
        assert_eq!(interlock.record(), None);
        assert_eq!(interlock.begin_reset(), None);
        assert_eq!(interlock.clear_if(3), Clearing::AlreadyClear);
    }

    #[test]
    fn stop_during_reset_engages_afresh() {
        let interlock = Interlock::new();
        interlock.engage(|| 1, "operator");
        interlock.begin_reset().unwrap();

        let stop = interlock.engage(|| 2, "brake controller failed");
        assert!(matches!(stop, Engagement::Engaged(ref r) if r.sequence == 2));
        assert!(!interlock.reset_pending());

        match interlock.clear_if(1) {
            Clearing::Superseded(current) => assert_eq!(current.sequence, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(interlock.is_engaged());
        assert!(matches!(
            interlock.check(),
            Err(GatewayError::Blocked { reason }) if reason == "brake controller failed"
        ));
    }

    #[test]
    fn stop_after_reset_cancelled_is_a_no_op() {
        let interlock = Interlock::new();
        interlock.engage(|| 1, "operator");
        interlock.begin_reset().unwrap();
        interlock.abort_reset(1);
        assert!(!interlock.reset_pending());

        let stop = interlock.engage(|| 2, "again");
        assert!(matches!(stop, Engagement::AlreadyEngaged(ref r) if r.sequence == 1));
        assert!(matches!(interlock.clear_if(1), Clearing::Superseded(_)));
        assert!(interlock.is_engaged());
    }

    #[test]
    fn restart_policy() {
        let record = StopRecord {
            sequence: 4,
            reason: "operator interrupt".into(),
            engaged_at: Utc::now(),
        };
        let restored =
            Interlock::restored_record(Some(InterlockEvent::Engaged(record.clone())), false);
        assert_eq!(restored, Some(record));

        let reset = InterlockEvent::Reset {
            sequence: 4,
            identity: "tech-1".into(),
            notes: String::new(),
            at: Utc::now(),
        };
        assert_eq!(Interlock::restored_record(Some(reset), true), None);

        let fresh = Interlock::restored_record(None, true).unwrap();
        assert_eq!(fresh.reason, UNVERIFIED_REASON);
        assert_eq!(fresh.sequence, UNALLOCATED_SEQUENCE);
        assert_eq!(Interlock::restored_record(None, false), None);

        assert!(Interlock::from_restored(Some(fresh)).is_engaged());
    }
}
