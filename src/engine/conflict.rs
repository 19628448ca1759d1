use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Today in UTC — the reference day for sweeps and seeding.
pub(crate) fn today_utc() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Validate a bookable stay range: at least one night, sane dates,
/// bounded length. Runs before any lock is taken.
pub(crate) fn validate_stay(range: &StayRange) -> Result<(), EngineError> {
    if range.end_date <= range.start_date {
        return Err(EngineError::InvalidRange {
            start_date: range.start_date,
            end_date: range.end_date,
        });
    }
    validate_dates(range)?;
    if range.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

/// Validate a query/operator window: non-empty and bounded.
pub(crate) fn validate_window(range: &StayRange) -> Result<(), EngineError> {
    if range.end_date <= range.start_date {
        return Err(EngineError::InvalidRange {
            start_date: range.start_date,
            end_date: range.end_date,
        });
    }
    validate_dates(range)?;
    if range.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

fn validate_dates(range: &StayRange) -> Result<(), EngineError> {
    if range.start_date.year() < MIN_VALID_YEAR || range.end_date.year() >= MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// The two-source availability check, as a hard error.
///
/// The calendar catches operator blocks, cleaning buffers and stale rows
/// with no backing reservation; the reservation table is the authoritative
/// overlap source. Either one denying is enough.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    range: &StayRange,
    now: Ms,
) -> Result<(), EngineError> {
    for (_, day) in rs.days.range(range.start_date..range.end_date) {
        if day.status.blocks_stays() {
            return Err(EngineError::NotAvailable(rs.id));
        }
    }
    for r in rs.active_reservations(now) {
        if r.range.overlaps(range) {
            return Err(EngineError::NotAvailable(rs.id));
        }
    }
    Ok(())
}
