use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Advisory availability check. Takes only a read lock, so it never
    /// serializes against other readers; `create_reservation` re-runs the
    /// same predicate under the write lock before committing.
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        range: StayRange,
    ) -> Result<bool, EngineError> {
        validate_window(&range)?;
        let rs = match self.get_unit(&resource_id) {
            Some(rs) => rs,
            None => return Ok(false),
        };
        let guard = rs.read().await;
        Ok(availability::is_available(&guard, &range, now_ms()))
    }

    /// Percentage of the window that is booked/occupied. Unknown units
    /// report 0 — reads are lenient, mutations are strict.
    pub async fn occupancy_rate(
        &self,
        resource_id: Ulid,
        window: StayRange,
    ) -> Result<f64, EngineError> {
        validate_window(&window)?;
        let rs = match self.get_unit(&resource_id) {
            Some(rs) => rs,
            None => return Ok(0.0),
        };
        let guard = rs.read().await;
        Ok(availability::occupancy_rate(&guard, &window, now_ms()))
    }

    /// Bookable ranges of `min_nights..=max_nights` nights inside the
    /// window — the "offer alternative dates" query behind `NotAvailable`.
    pub async fn free_ranges(
        &self,
        resource_id: Ulid,
        window: StayRange,
        min_nights: i64,
        max_nights: i64,
    ) -> Result<Vec<StayRange>, EngineError> {
        validate_window(&window)?;
        if min_nights < 1 || max_nights < min_nights {
            return Err(EngineError::LimitExceeded("invalid night bounds"));
        }
        let rs = match self.get_unit(&resource_id) {
            Some(rs) => rs,
            None => return Ok(Vec::new()),
        };
        let guard = rs.read().await;
        Ok(availability::free_ranges(&guard, &window, min_nights, max_nights, now_ms()))
    }

    pub async fn unit_info(&self, id: Ulid) -> Result<UnitInfo, EngineError> {
        let rs = self.get_unit(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(UnitInfo {
            id: guard.id,
            name: guard.name.clone(),
            daily_rate: guard.daily_rate,
            status: guard.status,
            cleaning_days: guard.cleaning_days,
        })
    }

    pub async fn list_units(&self) -> Vec<UnitInfo> {
        let arcs: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut units = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            units.push(UnitInfo {
                id: guard.id,
                name: guard.name.clone(),
                daily_rate: guard.daily_rate,
                status: guard.status,
                cleaning_days: guard.cleaning_days,
            });
        }
        units.sort_by_key(|u| u.id);
        units
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let unit_id = self
            .get_unit_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.get_unit(&unit_id).ok_or(EngineError::NotFound(unit_id))?;
        let guard = rs.read().await;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Every reservation on the unit, newest first.
    pub async fn list_reservations(&self, resource_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = match self.get_unit(&resource_id) {
            Some(rs) => rs,
            None => return Ok(Vec::new()),
        };
        let guard = rs.read().await;
        let mut reservations: Vec<Reservation> = guard.reservations.values().cloned().collect();
        reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reservations)
    }

    /// Existing calendar rows inside the window. Days with no row are
    /// implicitly free (rows are created lazily).
    pub async fn calendar_days(
        &self,
        resource_id: Ulid,
        window: StayRange,
    ) -> Result<Vec<CalendarDayInfo>, EngineError> {
        validate_window(&window)?;
        let rs = match self.get_unit(&resource_id) {
            Some(rs) => rs,
            None => return Ok(Vec::new()),
        };
        let guard = rs.read().await;
        Ok(guard
            .days
            .range(window.start_date..window.end_date)
            .map(|(date, day)| CalendarDayInfo {
                date: *date,
                status: day.status,
                reservation_id: day.reservation_id,
                notes: day.notes.clone(),
            })
            .collect())
    }
}
