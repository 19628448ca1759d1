use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, today_utc, validate_stay, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn register_unit(
        &self,
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
        cleaning_days: u32,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_UNITS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("unit name too long"));
        }
        if daily_rate < 0 {
            return Err(EngineError::LimitExceeded("daily rate must not be negative"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::UnitRegistered {
            id,
            name: name.clone(),
            daily_rate,
            cleaning_days,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, daily_rate, cleaning_days);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_unit(
        &self,
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
        cleaning_days: u32,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("unit name too long"));
        }
        if daily_rate < 0 {
            return Err(EngineError::LimitExceeded("daily rate must not be negative"));
        }
        let mut guard = self.lock_unit(id).await?;
        let event = Event::UnitUpdated { id, name, daily_rate, cleaning_days };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Remove a unit. Refused while any hold or confirmed stay is active;
    /// cancel or sweep those first.
    pub async fn remove_unit(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_unit(id).await?;
        if guard.has_active_reservations(now_ms()) {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::UnitRemoved { id };
        self.wal_append(&event).await?;
        for rid in guard.reservations.keys() {
            self.reservation_to_unit.remove(rid);
        }
        drop(guard);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Best-effort side-effect notification from collaborators (e.g. the
    /// owner flips a unit to maintenance). Not required for correctness —
    /// availability never consults the coarse status.
    pub async fn set_unit_status(&self, id: Ulid, status: UnitStatus) -> Result<(), EngineError> {
        let mut guard = self.lock_unit(id).await?;
        let event = Event::UnitStatusChanged { id, status };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Create a hold on a unit for `[start_date, end_date)`.
    ///
    /// Validation fails fast before the lock; the two-source availability
    /// check re-runs under the lock, which serializes all create/cancel
    /// traffic per unit. `hold_ttl` is caller-supplied (None = no expiry,
    /// e.g. operator-entered bookings). With `hold_calendar` the stay days
    /// are marked `booked` immediately so a second caller cannot slip in
    /// between lock release and payment completion.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        holder_id: Ulid,
        range: StayRange,
        hold_ttl: Option<Ms>,
        hold_calendar: bool,
    ) -> Result<Reservation, EngineError> {
        validate_stay(&range)?;
        if let Some(ttl) = hold_ttl
            && !(1..=MAX_HOLD_TTL_MS).contains(&ttl)
        {
            return Err(EngineError::LimitExceeded("hold ttl out of range"));
        }
        if self.reservation_to_unit.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut guard = self.lock_unit(resource_id).await?;

        let now = now_ms();
        check_no_conflict(&guard, &range, now)?;

        let reservation = Reservation {
            id,
            holder_id,
            range,
            total_price: range.nights() * guard.daily_rate,
            status: ReservationStatus::Held,
            expires_at: hold_ttl.map(|ttl| now + ttl),
            cancelled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: now,
        };

        let event = Event::ReservationCreated {
            resource_id,
            reservation: reservation.clone(),
            hold_calendar,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(reservation)
    }

    /// Cancel a reservation, releasing exactly its own calendar days.
    ///
    /// Idempotent: cancelling an already-cancelled reservation returns it
    /// unchanged. `cancelled_by = None` denotes a system/expiry
    /// cancellation; user-driven cancellations pass the actor explicitly.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        cancelled_by: Option<Ulid>,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("cancel reason too long"));
        }

        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let existing = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        match existing.status {
            ReservationStatus::Cancelled => return Ok(existing),
            ReservationStatus::Completed => {
                return Err(EngineError::InvalidTransition { id, from: existing.status });
            }
            _ => {}
        }

        let event = Event::ReservationCancelled {
            id,
            resource_id,
            cancelled_at: now_ms(),
            reason,
            cancelled_by,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Payment collaborator callback: the hold was paid. Requires a still
    /// unexpired hold; clears `expires_at` and marks the stay days booked
    /// (covers holds created with `hold_calendar = false`).
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let existing = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if existing.status != ReservationStatus::Held {
            return Err(EngineError::InvalidTransition { id, from: existing.status });
        }
        if existing.expires_at.is_some_and(|e| e <= now_ms()) {
            return Err(EngineError::HoldExpired(id));
        }

        let event = Event::ReservationConfirmed { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Payment collaborator callback: the payment attempt failed. The
    /// calendar range is left as-is for operator review — a human or retry
    /// flow decides whether to release or retry.
    pub async fn fail_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let existing = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if existing.status != ReservationStatus::Held {
            return Err(EngineError::InvalidTransition { id, from: existing.status });
        }

        let event = Event::ReservationPaymentFailed { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Operator calendar control: block a range with `blocked` or
    /// `maintenance`, no reservation row behind it. Refused over an active
    /// reservation; re-blocking already blocked days is an idempotent upsert.
    pub async fn block_days(
        &self,
        resource_id: Ulid,
        range: StayRange,
        status: DayStatus,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        validate_window(&range)?;
        if !matches!(status, DayStatus::Blocked | DayStatus::Maintenance) {
            return Err(EngineError::LimitExceeded("operator blocks are blocked or maintenance"));
        }
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let mut guard = self.lock_unit(resource_id).await?;
        let now = now_ms();
        if guard.active_reservations(now).any(|r| r.range.overlaps(&range)) {
            return Err(EngineError::NotAvailable(resource_id));
        }

        let event = Event::DaysBlocked {
            resource_id,
            range,
            status,
            reservation_id: None,
            notes,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Release operator rows in the range back to free. Reservation-backed
    /// days are never touched by this path.
    pub async fn unblock_days(&self, resource_id: Ulid, range: StayRange) -> Result<(), EngineError> {
        validate_window(&range)?;
        let mut guard = self.lock_unit(resource_id).await?;
        let event = Event::DaysReleased {
            resource_id,
            range,
            reservation_id: None,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    /// Pre-populate `free` rows up to `days_ahead` days from today, for UI
    /// calendar views. Existing rows are untouched.
    pub async fn seed_calendar(&self, resource_id: Ulid, days_ahead: i64) -> Result<(), EngineError> {
        if !(1..=MAX_SEED_DAYS_AHEAD).contains(&days_ahead) {
            return Err(EngineError::LimitExceeded("seed horizon out of range"));
        }
        let mut guard = self.lock_unit(resource_id).await?;
        let event = Event::DaysSeeded {
            resource_id,
            from: today_utc(),
            days_ahead,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await
    }

    // ── Sweeper entry points ─────────────────────────────

    /// Snapshot of lapsed holds: (reservation id, unit id) pairs.
    /// Contended units are skipped and picked up on the next tick.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for res in guard.reservations.values() {
                    if res.status == ReservationStatus::Held
                        && res.expires_at.is_some_and(|e| e <= now)
                    {
                        expired.push((res.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Cancel a hold iff it is still held and its TTL has lapsed — the
    /// deferred-timer and sweeper path. A racing confirmation wins: a
    /// reservation confirmed after collection is left alone. Returns
    /// whether a cancellation happened.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let still_lapsed = guard.reservations.get(&id).is_some_and(|res| {
            res.status == ReservationStatus::Held && res.expires_at.is_some_and(|e| e <= now)
        });
        if !still_lapsed {
            return Ok(false);
        }

        let event = Event::ReservationCancelled {
            id,
            resource_id,
            cancelled_at: now_ms(),
            reason: Some("hold expired".into()),
            cancelled_by: None,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// One expiry sweep pass. Idempotent, safe on any cadence, safe
    /// concurrently with itself, the one-shot timers, and user-driven
    /// cancellations. One bad reservation never halts the rest.
    pub async fn sweep_expired_holds(&self, now: Ms) -> usize {
        let mut cancelled = 0;
        for (reservation_id, _unit_id) in self.collect_expired_holds(now) {
            match self.expire_hold(reservation_id, now).await {
                Ok(true) => {
                    metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
                    tracing::info!("expired hold {reservation_id} cancelled");
                    cancelled += 1;
                }
                Ok(false) => {} // confirmed or cancelled in the meantime
                Err(e) => tracing::warn!("expiry sweep skip {reservation_id}: {e}"),
            }
        }
        cancelled
    }

    /// One lifecycle sweep pass for the given day. Idempotent:
    /// - confirmed stays past checkout → `completed` + cleaning buffer;
    /// - confirmed stays in progress → days marked `occupied`;
    /// - day rows older than the retention cutoff are pruned.
    pub async fn sweep_lifecycle(&self, today: NaiveDate) -> usize {
        let cutoff = today - chrono::Duration::days(CALENDAR_RETENTION_DAYS);
        let mut to_complete: Vec<Ulid> = Vec::new();
        let mut to_start: Vec<Ulid> = Vec::new();
        let mut to_prune: Vec<Ulid> = Vec::new();

        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for res in guard.reservations.values() {
                    if res.status != ReservationStatus::Confirmed {
                        continue;
                    }
                    if res.range.end_date < today {
                        to_complete.push(res.id);
                    } else if res.range.contains_day(today)
                        && !guard
                            .day(res.range.start_date)
                            .is_some_and(|d| d.status == DayStatus::Occupied)
                    {
                        to_start.push(res.id);
                    }
                }
                if guard.days.keys().next().is_some_and(|first| *first < cutoff) {
                    to_prune.push(guard.id);
                }
            }
        }

        let mut transitions = 0;
        for id in to_start {
            match self.start_stay(id, today).await {
                Ok(true) => transitions += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("lifecycle sweep: start {id}: {e}"),
            }
        }
        for id in to_complete {
            match self.complete_stay(id).await {
                Ok(true) => {
                    metrics::counter!(crate::observability::STAYS_COMPLETED_TOTAL).increment(1);
                    transitions += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("lifecycle sweep: complete {id}: {e}"),
            }
        }
        for unit_id in to_prune {
            if let Err(e) = self.prune_unit_calendar(unit_id, cutoff).await {
                tracing::warn!("lifecycle sweep: prune {unit_id}: {e}");
            }
        }
        transitions
    }

    /// Mark an in-progress stay's days `occupied`. Re-verified under the
    /// unit lock; skipped if the stay was cancelled meanwhile.
    async fn start_stay(&self, id: Ulid, today: NaiveDate) -> Result<bool, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let in_progress = guard.reservations.get(&id).is_some_and(|res| {
            res.status == ReservationStatus::Confirmed && res.range.contains_day(today)
        });
        if !in_progress {
            return Ok(false);
        }
        let event = Event::StayStarted { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// Promote a checked-out stay to `completed` and insert the cleaning
    /// buffer from the checkout day.
    async fn complete_stay(&self, id: Ulid) -> Result<bool, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        if !guard
            .reservations
            .get(&id)
            .is_some_and(|res| res.status == ReservationStatus::Confirmed)
        {
            return Ok(false);
        }
        let event = Event::ReservationCompleted {
            id,
            resource_id,
            cleaning_days: guard.cleaning_days,
        };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        tracing::info!("stay {id} completed");
        Ok(true)
    }

    async fn prune_unit_calendar(&self, unit_id: Ulid, cutoff: NaiveDate) -> Result<(), EngineError> {
        let mut guard = self.lock_unit(unit_id).await?;
        let event = Event::CalendarPruned { resource_id: unit_id, cutoff };
        self.persist_and_apply(unit_id, &mut guard, &event).await
    }
}
