use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Integer minor currency units.
pub type Money = i64;

/// Half-open stay range `[start_date, end_date)` — the checkout day is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl StayRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        debug_assert!(start_date < end_date, "StayRange start must be before end");
        Self { start_date, end_date }
    }

    pub fn nights(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.start_date < other.end_date && other.start_date < self.end_date
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day < self.end_date
    }

    /// Iterate the occupied days — checkout day excluded.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end_date;
        self.start_date.iter_days().take_while(move |d| *d < end)
    }
}

/// Per-day calendar status for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Free,
    Booked,
    Occupied,
    Blocked,
    Cleaning,
    Maintenance,
}

impl DayStatus {
    /// Anything that is not `Free` denies a new stay on that day.
    pub fn blocks_stays(self) -> bool {
        !matches!(self, DayStatus::Free)
    }
}

/// One calendar day of a unit. Exactly one entry per (unit, date);
/// entries are created lazily on first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub status: DayStatus,
    pub reservation_id: Option<Ulid>,
    pub notes: Option<String>,
}

impl CalendarDay {
    pub fn free() -> Self {
        Self {
            status: DayStatus::Free,
            reservation_id: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Confirmed,
    PaymentFailed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::PaymentFailed => "payment_failed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation on a single unit. Never deleted — cancellation and
/// completion are terminal statuses, not row deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub holder_id: Ulid,
    pub range: StayRange,
    pub total_price: Money,
    pub status: ReservationStatus,
    pub expires_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    /// None denotes a system/expiry-driven cancellation.
    pub cancelled_by: Option<Ulid>,
    pub created_at: Ms,
}

impl Reservation {
    /// Active = blocks the calendar: confirmed, or held with an unexpired hold.
    /// A lapsed hold stops blocking immediately; the expiry sweeper cancels it.
    pub fn is_active(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::Confirmed => true,
            ReservationStatus::Held => self.expires_at.is_none_or(|e| e > now),
            _ => false,
        }
    }
}

/// Coarse unit status, maintained as a best-effort side effect of
/// reservation transitions. Not consulted by availability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Reserved,
    Occupied,
    Maintenance,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub daily_rate: Money,
    pub status: UnitStatus,
    /// Days of cleaning buffer inserted after each checkout.
    pub cleaning_days: u32,
    /// One entry per calendar day, keyed by date.
    pub days: BTreeMap<NaiveDate, CalendarDay>,
    /// Every reservation ever taken on this unit, by id.
    pub reservations: BTreeMap<Ulid, Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, daily_rate: Money, cleaning_days: u32) -> Self {
        Self {
            id,
            name,
            daily_rate,
            status: UnitStatus::Available,
            cleaning_days,
            days: BTreeMap::new(),
            reservations: BTreeMap::new(),
        }
    }

    pub fn day(&self, date: NaiveDate) -> Option<&CalendarDay> {
        self.days.get(&date)
    }

    /// Upsert every day in the range to the given status.
    pub fn set_days(
        &mut self,
        range: &StayRange,
        status: DayStatus,
        reservation_id: Option<Ulid>,
        notes: Option<String>,
    ) {
        for date in range.days() {
            let entry = self.days.entry(date).or_insert_with(CalendarDay::free);
            entry.status = status;
            entry.reservation_id = reservation_id;
            entry.notes = notes.clone();
        }
    }

    /// Release days in the range back to `Free`.
    ///
    /// With `reservation_id = Some(id)` only days back-referencing that
    /// reservation are touched; with `None` only operator rows (no
    /// back-reference) are touched. Either way a release never clobbers
    /// days owned by someone else.
    pub fn release_days(&mut self, range: &StayRange, reservation_id: Option<Ulid>) -> usize {
        let mut released = 0;
        for date in range.days() {
            if let Some(entry) = self.days.get_mut(&date) {
                let matches = match reservation_id {
                    Some(id) => entry.reservation_id == Some(id),
                    None => entry.reservation_id.is_none() && entry.status.blocks_stays(),
                };
                if matches {
                    *entry = CalendarDay::free();
                    released += 1;
                }
            }
        }
        released
    }

    /// Pre-populate missing `Free` rows from `from` for `days_ahead` days.
    /// Existing rows are left untouched.
    pub fn seed_days(&mut self, from: NaiveDate, days_ahead: i64) {
        for offset in 0..days_ahead {
            let date = from + chrono::Duration::days(offset);
            self.days.entry(date).or_insert_with(CalendarDay::free);
        }
    }

    /// Drop day rows older than the cutoff. Returns how many were removed.
    pub fn prune_days(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.days.len();
        self.days.retain(|date, _| *date >= cutoff);
        before - self.days.len()
    }

    pub fn active_reservations(&self, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(move |r| r.is_active(now))
    }

    pub fn has_active_reservations(&self, now: Ms) -> bool {
        self.active_reservations(now).next().is_some()
    }
}

/// The event types — flat, no nesting. This is the WAL record format and
/// the notification payload. One event is the atomic unit covering both a
/// reservation mutation and its calendar side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UnitRegistered {
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
        cleaning_days: u32,
    },
    UnitUpdated {
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
        cleaning_days: u32,
    },
    UnitRemoved {
        id: Ulid,
    },
    UnitStatusChanged {
        id: Ulid,
        status: UnitStatus,
    },
    DaysBlocked {
        resource_id: Ulid,
        range: StayRange,
        status: DayStatus,
        reservation_id: Option<Ulid>,
        notes: Option<String>,
    },
    DaysReleased {
        resource_id: Ulid,
        range: StayRange,
        reservation_id: Option<Ulid>,
    },
    DaysSeeded {
        resource_id: Ulid,
        from: NaiveDate,
        days_ahead: i64,
    },
    CalendarPruned {
        resource_id: Ulid,
        cutoff: NaiveDate,
    },
    ReservationCreated {
        resource_id: Ulid,
        reservation: Reservation,
        /// Mark the stay days `booked` immediately, before payment confirms.
        hold_calendar: bool,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationPaymentFailed {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        cancelled_at: Ms,
        reason: Option<String>,
        cancelled_by: Option<Ulid>,
    },
    StayStarted {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCompleted {
        id: Ulid,
        resource_id: Ulid,
        cleaning_days: u32,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub daily_rate: Money,
    pub status: UnitStatus,
    pub cleaning_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDayInfo {
    pub date: NaiveDate,
    pub status: DayStatus,
    pub reservation_id: Option<Ulid>,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn range_basics() {
        let r = StayRange::new(d("2024-03-10"), d("2024-03-13"));
        assert_eq!(r.nights(), 3);
        assert!(r.contains_day(d("2024-03-10")));
        assert!(r.contains_day(d("2024-03-12")));
        assert!(!r.contains_day(d("2024-03-13"))); // checkout day is half-open
        let days: Vec<_> = r.days().collect();
        assert_eq!(days, vec![d("2024-03-10"), d("2024-03-11"), d("2024-03-12")]);
    }

    #[test]
    fn range_overlap() {
        let a = StayRange::new(d("2024-01-01"), d("2024-01-05"));
        let b = StayRange::new(d("2024-01-04"), d("2024-01-08"));
        let c = StayRange::new(d("2024-01-05"), d("2024-01-09"));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn set_days_upserts_once_per_date() {
        let mut rs = ResourceState::new(Ulid::new(), None, 10_000, 1);
        let range = StayRange::new(d("2024-01-01"), d("2024-01-04"));
        rs.set_days(&range, DayStatus::Booked, None, None);
        rs.set_days(&range, DayStatus::Occupied, None, None);
        assert_eq!(rs.days.len(), 3);
        assert_eq!(rs.day(d("2024-01-01")).unwrap().status, DayStatus::Occupied);
        assert!(rs.day(d("2024-01-04")).is_none()); // checkout day untouched
    }

    #[test]
    fn release_days_matches_back_reference() {
        let mut rs = ResourceState::new(Ulid::new(), None, 10_000, 1);
        let rid = Ulid::new();
        let other = Ulid::new();
        let range = StayRange::new(d("2024-01-01"), d("2024-01-03"));
        rs.set_days(
            &StayRange::new(d("2024-01-01"), d("2024-01-02")),
            DayStatus::Booked,
            Some(rid),
            None,
        );
        rs.set_days(
            &StayRange::new(d("2024-01-02"), d("2024-01-03")),
            DayStatus::Booked,
            Some(other),
            None,
        );

        let released = rs.release_days(&range, Some(rid));
        assert_eq!(released, 1);
        assert_eq!(rs.day(d("2024-01-01")).unwrap().status, DayStatus::Free);
        // The other reservation's day is untouched.
        assert_eq!(rs.day(d("2024-01-02")).unwrap().status, DayStatus::Booked);
    }

    #[test]
    fn release_days_operator_rows_only() {
        let mut rs = ResourceState::new(Ulid::new(), None, 10_000, 1);
        let rid = Ulid::new();
        let range = StayRange::new(d("2024-02-01"), d("2024-02-03"));
        rs.set_days(
            &StayRange::new(d("2024-02-01"), d("2024-02-02")),
            DayStatus::Blocked,
            None,
            Some("owner stay".into()),
        );
        rs.set_days(
            &StayRange::new(d("2024-02-02"), d("2024-02-03")),
            DayStatus::Booked,
            Some(rid),
            None,
        );

        let released = rs.release_days(&range, None);
        assert_eq!(released, 1);
        assert_eq!(rs.day(d("2024-02-01")).unwrap().status, DayStatus::Free);
        assert!(rs.day(d("2024-02-01")).unwrap().notes.is_none());
        // Reservation-backed day survives an operator unblock.
        assert_eq!(rs.day(d("2024-02-02")).unwrap().status, DayStatus::Booked);
    }

    #[test]
    fn seed_days_keeps_existing_rows() {
        let mut rs = ResourceState::new(Ulid::new(), None, 10_000, 1);
        rs.set_days(
            &StayRange::new(d("2024-01-02"), d("2024-01-03")),
            DayStatus::Blocked,
            None,
            None,
        );
        rs.seed_days(d("2024-01-01"), 5);
        assert_eq!(rs.days.len(), 5);
        assert_eq!(rs.day(d("2024-01-02")).unwrap().status, DayStatus::Blocked);
        assert_eq!(rs.day(d("2024-01-05")).unwrap().status, DayStatus::Free);
    }

    #[test]
    fn prune_days_removes_old_rows() {
        let mut rs = ResourceState::new(Ulid::new(), None, 10_000, 1);
        rs.seed_days(d("2023-01-01"), 3);
        rs.seed_days(d("2024-06-01"), 2);
        let removed = rs.prune_days(d("2024-01-01"));
        assert_eq!(removed, 3);
        assert_eq!(rs.days.len(), 2);
    }

    #[test]
    fn lapsed_hold_is_not_active() {
        let r = Reservation {
            id: Ulid::new(),
            holder_id: Ulid::new(),
            range: StayRange::new(d("2024-01-01"), d("2024-01-03")),
            total_price: 20_000,
            status: ReservationStatus::Held,
            expires_at: Some(1_000),
            cancelled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: 0,
        };
        assert!(r.is_active(999));
        assert!(!r.is_active(1_000));

        let confirmed = Reservation {
            status: ReservationStatus::Confirmed,
            expires_at: None,
            ..r.clone()
        };
        assert!(confirmed.is_active(i64::MAX - 1));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            resource_id: Ulid::new(),
            reservation: Reservation {
                id: Ulid::new(),
                holder_id: Ulid::new(),
                range: StayRange::new(d("2024-03-10"), d("2024-03-13")),
                total_price: 15_000,
                status: ReservationStatus::Held,
                expires_at: Some(1_700_000_000_000),
                cancelled_at: None,
                cancel_reason: None,
                cancelled_by: None,
                created_at: 1_699_999_000_000,
            },
            hold_calendar: true,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
