use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::api::{self, Hello, Notification, Request, Response};
use crate::engine::{Engine, EngineError};
use crate::limits::DEFAULT_HOLD_TTL_MS;
use crate::model::{Event, StayRange};
use crate::observability;
use crate::sweeper;
use crate::tenant::TenantManager;

const MAX_LINE_LEN: usize = 64 * 1024;

type ConnResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Drive one client connection: a hello/auth frame, then one JSON request
/// per line, one JSON response per line, with LISTEN notifications pushed
/// asynchronously in between.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
) -> ConnResult<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let engine = match authenticate(&first?, &tenant_manager, &password) {
        Ok(engine) => {
            framed.send(Response::empty().to_line()).await?;
            engine
        }
        Err(message) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            framed.send(Response::protocol_error(message).to_line()).await?;
            return Ok(());
        }
    };

    // Each LISTEN subscription runs a forwarder task feeding one shared
    // channel, merged with request handling in the select below.
    let (notify_tx, mut notify_rx) = mpsc::channel::<(Ulid, Event)>(256);
    let mut subscriptions: HashMap<Ulid, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let response = match api::parse_request(&line) {
                    Ok(request) => {
                        let label = observability::request_label(&request);
                        let start = std::time::Instant::now();
                        let response =
                            dispatch(&engine, request, &notify_tx, &mut subscriptions).await;
                        let status = if matches!(response, Response::Ok { .. }) { "ok" } else { "error" };
                        metrics::counter!(observability::REQUESTS_TOTAL, "op" => label, "status" => status)
                            .increment(1);
                        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
                            .record(start.elapsed().as_secs_f64());
                        response
                    }
                    Err(e) => Response::protocol_error(format!("bad request: {e}")),
                };
                framed.send(response.to_line()).await?;
            }
            Some((resource_id, event)) = notify_rx.recv() => {
                let frame = serde_json::to_string(&Notification { notify: resource_id, event: &event })?;
                framed.send(frame).await?;
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    Ok(())
}

fn authenticate(
    line: &str,
    tenant_manager: &TenantManager,
    password: &str,
) -> Result<Arc<Engine>, String> {
    let hello: Hello = serde_json::from_str(line).map_err(|e| format!("bad hello: {e}"))?;
    if hello.password != password {
        return Err("authentication failed".into());
    }
    tenant_manager
        .get_or_create(&hello.tenant)
        .map_err(|e| format!("tenant error: {e}"))
}

fn respond<T: serde::Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => Response::ok(value),
        Err(e) => Response::engine_error(&e),
    }
}

fn respond_unit(result: Result<(), EngineError>) -> Response {
    match result {
        Ok(()) => Response::empty(),
        Err(e) => Response::engine_error(&e),
    }
}

async fn dispatch(
    engine: &Arc<Engine>,
    request: Request,
    notify_tx: &mpsc::Sender<(Ulid, Event)>,
    subscriptions: &mut HashMap<Ulid, tokio::task::JoinHandle<()>>,
) -> Response {
    match request {
        Request::RegisterUnit { id, name, daily_rate, cleaning_days } => {
            let id = id.unwrap_or_else(Ulid::new);
            match engine.register_unit(id, name, daily_rate, cleaning_days).await {
                Ok(()) => Response::ok(json!({ "id": id })),
                Err(e) => Response::engine_error(&e),
            }
        }
        Request::UpdateUnit { id, name, daily_rate, cleaning_days } => {
            respond_unit(engine.update_unit(id, name, daily_rate, cleaning_days).await)
        }
        Request::RemoveUnit { id } => respond_unit(engine.remove_unit(id).await),
        Request::SetUnitStatus { id, status } => {
            respond_unit(engine.set_unit_status(id, status).await)
        }
        Request::ListUnits => Response::ok(engine.list_units().await),
        Request::GetUnit { id } => respond(engine.unit_info(id).await),

        Request::CreateReservation {
            id,
            resource_id,
            holder_id,
            start_date,
            end_date,
            hold_ttl_ms,
            no_expiry,
            hold_calendar,
        } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            let id = id.unwrap_or_else(Ulid::new);
            let range = StayRange::new(start_date, end_date);
            let hold_ttl = if no_expiry {
                None
            } else {
                Some(hold_ttl_ms.unwrap_or(DEFAULT_HOLD_TTL_MS))
            };
            match engine
                .create_reservation(id, resource_id, holder_id, range, hold_ttl, hold_calendar)
                .await
            {
                Ok(reservation) => {
                    // Deferred one-shot expiry; the periodic sweeper is the
                    // durable backstop, so this never fails the create.
                    if let Some(expires_at) = reservation.expires_at {
                        sweeper::schedule_expiry(engine.clone(), reservation.id, expires_at);
                    }
                    Response::ok(reservation)
                }
                Err(e) => Response::engine_error(&e),
            }
        }
        Request::CancelReservation { id, actor_id, reason } => {
            respond(engine.cancel_reservation(id, actor_id, reason).await)
        }
        Request::GetReservation { id } => respond(engine.get_reservation(id).await),
        Request::ListReservations { resource_id } => {
            respond(engine.list_reservations(resource_id).await)
        }
        Request::CheckAvailability { resource_id, start_date, end_date } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            respond(
                engine
                    .check_availability(resource_id, StayRange::new(start_date, end_date))
                    .await,
            )
        }
        Request::OccupancyRate { resource_id, start_date, end_date } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            respond(
                engine
                    .occupancy_rate(resource_id, StayRange::new(start_date, end_date))
                    .await,
            )
        }
        Request::FreeRanges { resource_id, min_nights, max_nights, window_start, window_end } => {
            if window_end <= window_start {
                return Response::engine_error(&EngineError::InvalidRange {
                    start_date: window_start,
                    end_date: window_end,
                });
            }
            respond(
                engine
                    .free_ranges(
                        resource_id,
                        StayRange::new(window_start, window_end),
                        min_nights,
                        max_nights,
                    )
                    .await,
            )
        }
        Request::CalendarDays { resource_id, start_date, end_date } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            respond(
                engine
                    .calendar_days(resource_id, StayRange::new(start_date, end_date))
                    .await,
            )
        }
        Request::BlockDays { resource_id, start_date, end_date, status, notes } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            respond_unit(
                engine
                    .block_days(resource_id, StayRange::new(start_date, end_date), status, notes)
                    .await,
            )
        }
        Request::UnblockDays { resource_id, start_date, end_date } => {
            if end_date <= start_date {
                return Response::engine_error(&EngineError::InvalidRange { start_date, end_date });
            }
            respond_unit(
                engine
                    .unblock_days(resource_id, StayRange::new(start_date, end_date))
                    .await,
            )
        }
        Request::SeedCalendar { resource_id, days_ahead } => {
            respond_unit(engine.seed_calendar(resource_id, days_ahead).await)
        }

        Request::ConfirmReservation { id } => respond(engine.confirm_reservation(id).await),
        Request::FailReservation { id } => respond(engine.fail_reservation(id).await),

        Request::RunExpirySweep => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let cancelled = engine.sweep_expired_holds(now).await;
            Response::ok(json!({ "cancelled": cancelled }))
        }
        Request::RunLifecycleSweep { today } => {
            let today = today.unwrap_or_else(|| chrono::Utc::now().date_naive());
            let transitions = engine.sweep_lifecycle(today).await;
            Response::ok(json!({ "transitions": transitions }))
        }

        Request::Listen { resource_id } => {
            let mut rx = engine.notify.subscribe(resource_id);
            let tx = notify_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if tx.send((resource_id, event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            if let Some(old) = subscriptions.insert(resource_id, handle) {
                old.abort();
            }
            Response::empty()
        }
        Request::Unlisten { resource_id } => {
            if let Some(handle) = subscriptions.remove(&resource_id) {
                handle.abort();
            }
            Response::empty()
        }
        Request::UnlistenAll => {
            for (_, handle) in subscriptions.drain() {
                handle.abort();
            }
            Response::empty()
        }
    }
}
