//! # Slot Capacity Manager
//!
//! The only code allowed to touch `current_bookings` and `is_available`.
//!
//! Both operations act on a slot value that the store has just re-read
//! under a row lock (`SELECT ... FOR UPDATE` in Postgres, the table mutex
//! in memory), inside the same transaction that writes the booking. Two
//! concurrent reservations for the last unit therefore serialize on the
//! row, and the second one sees the first one's increment.
//!
//! ```text
//!   reserve                          release
//!   ───────                          ───────
//!   current < max ?                  current = max(current - 1, 0)
//!     no  → SlotUnavailable          current < max → is_available = true
//!     yes → current += 1
//!           current == max → is_available = false
//! ```

use thiserror::Error;
use tracing::debug;

use crate::db::TimeSlotRecord;

/// The slot has no free capacity left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Time slot {0} is fully booked")]
pub struct SlotUnavailable(pub i64);

/// Claim one unit of capacity. On failure the slot is left untouched.
pub fn reserve(slot: &mut TimeSlotRecord) -> Result<(), SlotUnavailable> {
    if !slot.has_free_capacity() {
        return Err(SlotUnavailable(slot.id));
    }

    slot.current_bookings += 1;
    if slot.current_bookings >= slot.max_capacity {
        slot.is_available = false;
    }

    debug!(
        "Reserved slot {}: {}/{}",
        slot.id, slot.current_bookings, slot.max_capacity
    );
    Ok(())
}

/// Give back one unit of capacity. Occupancy never drops below zero.
pub fn release(slot: &mut TimeSlotRecord) {
    slot.current_bookings = (slot.current_bookings - 1).max(0);
    if slot.current_bookings < slot.max_capacity {
        slot.is_available = true;
    }

    debug!(
        "Released slot {}: {}/{}",
        slot.id, slot.current_bookings, slot.max_capacity
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn slot(max_capacity: i32) -> TimeSlotRecord {
        TimeSlotRecord {
            id: 42,
            club_id: 1,
            club_name: "Court House".to_string(),
            club_price_per_hour: 50_000,
            date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            sport: "tennis".to_string(),
            max_capacity,
            current_bookings: 0,
            is_available: true,
            price_override: None,
        }
    }

    #[test]
    fn test_reserve_fills_and_closes_slot() {
        let mut s = slot(2);
        reserve(&mut s).unwrap();
        assert_eq!(s.current_bookings, 1);
        assert!(s.is_available);

        reserve(&mut s).unwrap();
        assert_eq!(s.current_bookings, 2);
        assert!(!s.is_available);
    }

    #[test]
    fn test_reserve_on_full_slot_mutates_nothing() {
        let mut s = slot(1);
        reserve(&mut s).unwrap();
        let before = s.clone();

        assert_eq!(reserve(&mut s), Err(SlotUnavailable(42)));
        assert_eq!(s, before);
    }

    #[test]
    fn test_release_reopens_and_floors_at_zero() {
        let mut s = slot(1);
        reserve(&mut s).unwrap();
        release(&mut s);
        assert_eq!(s.current_bookings, 0);
        assert!(s.is_available);

        release(&mut s);
        assert_eq!(s.current_bookings, 0);
    }

    #[test]
    fn test_reserves_minus_releases_equals_occupancy() {
        let mut s = slot(3);
        let mut reserved = 0;
        let mut released = 0;
        for step in 0..20 {
            if step % 3 == 2 {
                if s.current_bookings > 0 {
                    release(&mut s);
                    released += 1;
                }
            } else if reserve(&mut s).is_ok() {
                reserved += 1;
            }
            assert!(s.current_bookings >= 0 && s.current_bookings <= s.max_capacity);
            assert_eq!(reserved - released, s.current_bookings);
        }
    }
}
