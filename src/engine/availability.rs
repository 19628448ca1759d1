use chrono::NaiveDate;

use crate::model::*;

use super::conflict::check_no_conflict;

// ── Availability Algorithm ────────────────────────────────────────

/// Two-source availability predicate for `[start_date, end_date)`.
///
/// Denies when any calendar day in the range carries a non-free status
/// (operator blocks, cleaning, stale rows) or any unexpired hold /
/// confirmed reservation overlaps. Side-effect free; advisory when called
/// without the unit lock, and re-evaluated under the lock by
/// `create_reservation`.
pub fn is_available(rs: &ResourceState, range: &StayRange, now: Ms) -> bool {
    check_no_conflict(rs, range, now).is_ok()
}

/// A single day is bookable when its calendar row (if any) is free and no
/// active reservation covers it.
fn day_is_bookable(rs: &ResourceState, date: NaiveDate, now: Ms) -> bool {
    if rs.day(date).is_some_and(|d| d.status.blocks_stays()) {
        return false;
    }
    !rs.active_reservations(now).any(|r| r.range.contains_day(date))
}

/// Maximal bookable runs inside the window with at least `min_nights`
/// nights, each reported clamped to `max_nights` nights from its start.
///
/// A run of n bookable days supports an n-night stay — the checkout day
/// itself does not need to be free.
pub fn free_ranges(
    rs: &ResourceState,
    window: &StayRange,
    min_nights: i64,
    max_nights: i64,
    now: Ms,
) -> Vec<StayRange> {
    let mut result = Vec::new();
    let mut run_start: Option<NaiveDate> = None;

    for date in window.days() {
        if day_is_bookable(rs, date, now) {
            run_start.get_or_insert(date);
        } else if let Some(start) = run_start.take() {
            push_run(&mut result, start, date, min_nights, max_nights);
        }
    }
    if let Some(start) = run_start.take() {
        push_run(&mut result, start, window.end_date, min_nights, max_nights);
    }

    result
}

fn push_run(
    out: &mut Vec<StayRange>,
    start: NaiveDate,
    end: NaiveDate,
    min_nights: i64,
    max_nights: i64,
) {
    let nights = (end - start).num_days();
    if nights < min_nights {
        return;
    }
    let end = if nights > max_nights {
        start + chrono::Duration::days(max_nights)
    } else {
        end
    };
    out.push(StayRange::new(start, end));
}

/// Percentage of days in the window that are marked booked/occupied on the
/// calendar or covered by a hold, confirmed stay, or completed stay.
pub fn occupancy_rate(rs: &ResourceState, window: &StayRange, now: Ms) -> f64 {
    let total = window.nights();
    if total <= 0 {
        return 0.0;
    }
    let mut occupied = 0;
    for date in window.days() {
        let marked = rs
            .day(date)
            .is_some_and(|d| matches!(d.status, DayStatus::Booked | DayStatus::Occupied));
        if marked || rs.reservations.values().any(|r| counts_as_occupied(r, now) && r.range.contains_day(date)) {
            occupied += 1;
        }
    }
    occupied as f64 * 100.0 / total as f64
}

/// Completed stays keep counting toward occupancy so past windows report
/// honestly; cancelled and failed ones never do.
fn counts_as_occupied(r: &Reservation, now: Ms) -> bool {
    match r.status {
        ReservationStatus::Confirmed | ReservationStatus::Completed => true,
        ReservationStatus::Held => r.is_active(now),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn r(s: &str, e: &str) -> StayRange {
        StayRange::new(d(s), d(e))
    }

    fn make_unit() -> ResourceState {
        ResourceState::new(Ulid::new(), None, 10_000, 1)
    }

    fn reservation(range: StayRange, status: ReservationStatus, expires_at: Option<Ms>) -> Reservation {
        Reservation {
            id: Ulid::new(),
            holder_id: Ulid::new(),
            range,
            total_price: range.nights() * 10_000,
            status,
            expires_at,
            cancelled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: 0,
        }
    }

    fn add(rs: &mut ResourceState, res: Reservation) {
        rs.reservations.insert(res.id, res);
    }

    // ── is_available ─────────────────────────────────────

    #[test]
    fn empty_unit_is_available() {
        let rs = make_unit();
        assert!(is_available(&rs, &r("2024-03-10", "2024-03-13"), 0));
    }

    #[test]
    fn confirmed_overlap_denies() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-10", "2024-03-13"), ReservationStatus::Confirmed, None));
        assert!(!is_available(&rs, &r("2024-03-12", "2024-03-15"), 0));
        // Back-to-back: checking in on the earlier checkout day is fine.
        assert!(is_available(&rs, &r("2024-03-13", "2024-03-15"), 0));
    }

    #[test]
    fn unexpired_hold_denies_expired_hold_does_not() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-10", "2024-03-13"), ReservationStatus::Held, Some(5_000)));
        assert!(!is_available(&rs, &r("2024-03-10", "2024-03-13"), 4_999));
        assert!(is_available(&rs, &r("2024-03-10", "2024-03-13"), 5_000));
    }

    #[test]
    fn cancelled_reservation_does_not_deny() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-10", "2024-03-13"), ReservationStatus::Cancelled, None));
        assert!(is_available(&rs, &r("2024-03-10", "2024-03-13"), 0));
    }

    #[test]
    fn blocked_day_denies_without_reservation() {
        let mut rs = make_unit();
        rs.set_days(&r("2024-03-11", "2024-03-12"), DayStatus::Blocked, None, Some("owner".into()));
        assert!(!is_available(&rs, &r("2024-03-10", "2024-03-13"), 0));
        assert!(is_available(&rs, &r("2024-03-12", "2024-03-14"), 0));
    }

    #[test]
    fn cleaning_day_denies() {
        let mut rs = make_unit();
        rs.set_days(&r("2024-03-13", "2024-03-14"), DayStatus::Cleaning, None, None);
        assert!(!is_available(&rs, &r("2024-03-13", "2024-03-15"), 0));
        assert!(is_available(&rs, &r("2024-03-14", "2024-03-16"), 0));
    }

    #[test]
    fn seeded_free_rows_do_not_deny() {
        let mut rs = make_unit();
        rs.seed_days(d("2024-03-01"), 31);
        assert!(is_available(&rs, &r("2024-03-10", "2024-03-13"), 0));
    }

    // ── free_ranges ──────────────────────────────────────

    #[test]
    fn free_ranges_whole_window_when_empty() {
        let rs = make_unit();
        let ranges = free_ranges(&rs, &r("2024-03-01", "2024-03-11"), 1, 30, 0);
        assert_eq!(ranges, vec![r("2024-03-01", "2024-03-11")]);
    }

    #[test]
    fn free_ranges_split_around_booking() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-05", "2024-03-08"), ReservationStatus::Confirmed, None));
        let ranges = free_ranges(&rs, &r("2024-03-01", "2024-03-11"), 1, 30, 0);
        assert_eq!(ranges, vec![r("2024-03-01", "2024-03-05"), r("2024-03-08", "2024-03-11")]);
    }

    #[test]
    fn free_ranges_respects_min_nights() {
        let mut rs = make_unit();
        // Leaves a 1-night gap and a 3-night tail.
        add(&mut rs, reservation(r("2024-03-02", "2024-03-05"), ReservationStatus::Confirmed, None));
        let ranges = free_ranges(&rs, &r("2024-03-01", "2024-03-08"), 2, 30, 0);
        assert_eq!(ranges, vec![r("2024-03-05", "2024-03-08")]);
    }

    #[test]
    fn free_ranges_clamps_to_max_nights() {
        let rs = make_unit();
        let ranges = free_ranges(&rs, &r("2024-03-01", "2024-03-31"), 1, 7, 0);
        assert_eq!(ranges, vec![r("2024-03-01", "2024-03-08")]);
    }

    // ── occupancy_rate ───────────────────────────────────

    #[test]
    fn occupancy_counts_confirmed_days() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-01", "2024-03-04"), ReservationStatus::Confirmed, None));
        let rate = occupancy_rate(&rs, &r("2024-03-01", "2024-03-11"), 0);
        assert!((rate - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn occupancy_counts_completed_and_marked_days_once() {
        let mut rs = make_unit();
        let res = reservation(r("2024-03-01", "2024-03-04"), ReservationStatus::Completed, None);
        rs.set_days(&res.range, DayStatus::Occupied, Some(res.id), None);
        add(&mut rs, res);
        let rate = occupancy_rate(&rs, &r("2024-03-01", "2024-03-07"), 0);
        assert!((rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn occupancy_ignores_cancelled() {
        let mut rs = make_unit();
        add(&mut rs, reservation(r("2024-03-01", "2024-03-04"), ReservationStatus::Cancelled, None));
        assert_eq!(occupancy_rate(&rs, &r("2024-03-01", "2024-03-11"), 0), 0.0);
    }
}
