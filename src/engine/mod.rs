mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_ranges, is_available, occupancy_rate};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::LOCK_WAIT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation/availability engine for one tenant: every registered
/// unit's calendar and reservations, guarded by one lock per unit.
pub struct Engine {
    pub state: DashMap<Ulid, SharedUnitState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → unit id.
    pub(super) reservation_to_unit: DashMap<Ulid, Ulid>,
}

/// Derive the coarse unit status from the reservation table. Operator-set
/// maintenance is never overridden; `Occupied` is set by `StayStarted`.
fn refresh_unit_status(rs: &mut ResourceState) {
    if rs.status == UnitStatus::Maintenance {
        return;
    }
    let reserved = rs
        .reservations
        .values()
        .any(|r| matches!(r.status, ReservationStatus::Held | ReservationStatus::Confirmed));
    rs.status = if reserved {
        UnitStatus::Reserved
    } else {
        UnitStatus::Available
    };
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, reservation_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::UnitUpdated { name, daily_rate, cleaning_days, .. } => {
            rs.name = name.clone();
            rs.daily_rate = *daily_rate;
            rs.cleaning_days = *cleaning_days;
        }
        Event::UnitStatusChanged { status, .. } => {
            rs.status = *status;
        }
        Event::DaysBlocked { range, status, reservation_id, notes, .. } => {
            rs.set_days(range, *status, *reservation_id, notes.clone());
        }
        Event::DaysReleased { range, reservation_id, .. } => {
            rs.release_days(range, *reservation_id);
        }
        Event::DaysSeeded { from, days_ahead, .. } => {
            rs.seed_days(*from, *days_ahead);
        }
        Event::CalendarPruned { cutoff, .. } => {
            rs.prune_days(*cutoff);
        }
        Event::ReservationCreated { resource_id, reservation, hold_calendar } => {
            if *hold_calendar {
                rs.set_days(&reservation.range, DayStatus::Booked, Some(reservation.id), None);
            }
            reservation_map.insert(reservation.id, *resource_id);
            rs.reservations.insert(reservation.id, reservation.clone());
            refresh_unit_status(rs);
        }
        Event::ReservationConfirmed { id, .. } => {
            let range = rs.reservations.get_mut(id).map(|res| {
                res.status = ReservationStatus::Confirmed;
                res.expires_at = None;
                res.range
            });
            if let Some(range) = range {
                rs.set_days(&range, DayStatus::Booked, Some(*id), None);
            }
        }
        Event::ReservationPaymentFailed { id, .. } => {
            // Calendar is left as-is for operator review.
            if let Some(res) = rs.reservations.get_mut(id) {
                res.status = ReservationStatus::PaymentFailed;
            }
        }
        Event::ReservationCancelled { id, cancelled_at, reason, cancelled_by, .. } => {
            let range = rs.reservations.get_mut(id).map(|res| {
                res.status = ReservationStatus::Cancelled;
                res.cancelled_at = Some(*cancelled_at);
                res.cancel_reason = reason.clone();
                res.cancelled_by = *cancelled_by;
                res.range
            });
            if let Some(range) = range {
                rs.release_days(&range, Some(*id));
            }
            refresh_unit_status(rs);
        }
        Event::StayStarted { id, .. } => {
            let range = rs.reservations.get(id).map(|res| res.range);
            if let Some(range) = range {
                rs.set_days(&range, DayStatus::Occupied, Some(*id), None);
                rs.status = UnitStatus::Occupied;
            }
        }
        Event::ReservationCompleted { id, cleaning_days, .. } => {
            let range = rs.reservations.get_mut(id).map(|res| {
                res.status = ReservationStatus::Completed;
                res.range
            });
            // Stay days stay marked as history; the turnover buffer starts
            // on the checkout day and blocks immediate re-booking.
            if let Some(range) = range
                && *cleaning_days > 0
            {
                let buffer = StayRange::new(
                    range.end_date,
                    range.end_date + chrono::Duration::days(*cleaning_days as i64),
                );
                rs.set_days(&buffer, DayStatus::Cleaning, Some(*id), None);
            }
            refresh_unit_status(rs);
        }
        // UnitRegistered/UnitRemoved are handled at the DashMap level, not here
        Event::UnitRegistered { .. } | Event::UnitRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_unit: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::UnitRegistered { id, name, daily_rate, cleaning_days } => {
                    let rs = ResourceState::new(*id, name.clone(), *daily_rate, *cleaning_days);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::UnitRemoved { id } => {
                    if let Some(entry) = engine.state.get(id) {
                        let rs = entry.try_read().expect("replay: uncontended read");
                        for rid in rs.reservations.keys() {
                            engine.reservation_to_unit.remove(rid);
                        }
                    }
                    engine.state.remove(id);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id)
                    {
                        let rs_arc = entry.clone();
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_resource(&mut guard, other, &engine.reservation_to_unit);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_unit_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_unit.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. The append is the atomic
    /// unit: a failed append means nothing was applied.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_to_unit);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Acquire the exclusive per-unit lock, bounded by `LOCK_WAIT`.
    /// This is the lock that serializes all create/cancel traffic on a unit.
    pub(super) async fn lock_unit(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_unit(&id).ok_or(EngineError::NotFound(id))?;
        tokio::time::timeout(LOCK_WAIT, rs.write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(id))
    }

    /// Lookup reservation → unit, then take the unit's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let unit_id = self
            .get_unit_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.lock_unit(unit_id).await?;
        Ok((unit_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let unit_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in unit_ids {
            let Some(rs_arc) = self.get_unit(&id) else { continue };
            let guard = rs_arc.read().await;

            events.push(Event::UnitRegistered {
                id: guard.id,
                name: guard.name.clone(),
                daily_rate: guard.daily_rate,
                cleaning_days: guard.cleaning_days,
            });

            // Full reservation rows, verbatim — apply inserts them as-is,
            // so terminal statuses and cancellation stamps survive.
            for reservation in guard.reservations.values() {
                events.push(Event::ReservationCreated {
                    resource_id: guard.id,
                    reservation: reservation.clone(),
                    hold_calendar: false,
                });
            }

            // Calendar day rows as maximal runs of identical content.
            let one_day = chrono::Duration::days(1);
            let mut run: Option<(chrono::NaiveDate, chrono::NaiveDate, CalendarDay)> = None;
            for (date, day) in &guard.days {
                let extends = matches!(&run, Some((_, end, content)) if *end == *date && content == day);
                if extends {
                    if let Some((_, end, _)) = &mut run {
                        *end = *date + one_day;
                    }
                } else {
                    if let Some(r) = run.take() {
                        events.push(day_run_event(guard.id, r));
                    }
                    run = Some((*date, *date + one_day, day.clone()));
                }
            }
            if let Some(r) = run.take() {
                events.push(day_run_event(guard.id, r));
            }

            events.push(Event::UnitStatusChanged { id: guard.id, status: guard.status });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Encode one run of identical day rows as a replayable event. Free rows
/// become a seed (creates missing rows only); anything else a block.
fn day_run_event(
    resource_id: Ulid,
    (start, end, day): (chrono::NaiveDate, chrono::NaiveDate, CalendarDay),
) -> Event {
    if day.status == DayStatus::Free && day.reservation_id.is_none() && day.notes.is_none() {
        Event::DaysSeeded {
            resource_id,
            from: start,
            days_ahead: (end - start).num_days(),
        }
    } else {
        Event::DaysBlocked {
            resource_id,
            range: StayRange::new(start, end),
            status: day.status,
            reservation_id: day.reservation_id,
            notes: day.notes,
        }
    }
}

/// Extract the unit id from an event (for non-register/remove events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::DaysBlocked { resource_id, .. }
        | Event::DaysReleased { resource_id, .. }
        | Event::DaysSeeded { resource_id, .. }
        | Event::CalendarPruned { resource_id, .. }
        | Event::ReservationCreated { resource_id, .. }
        | Event::ReservationConfirmed { resource_id, .. }
        | Event::ReservationPaymentFailed { resource_id, .. }
        | Event::ReservationCancelled { resource_id, .. }
        | Event::StayStarted { resource_id, .. }
        | Event::ReservationCompleted { resource_id, .. } => Some(*resource_id),
        Event::UnitUpdated { id, .. } | Event::UnitStatusChanged { id, .. } => Some(*id),
        Event::UnitRegistered { .. } | Event::UnitRemoved { .. } => None,
    }
}
