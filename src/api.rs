use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::DEFAULT_CLEANING_DAYS;
use crate::model::*;

/// First frame of every connection.
#[derive(Debug, Deserialize)]
pub struct Hello {
    pub tenant: String,
    pub password: String,
}

/// Parsed request from one JSON line; `op` selects the operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // ── Unit collaborator ────────────────────────────────
    RegisterUnit {
        #[serde(default)]
        id: Option<Ulid>,
        #[serde(default)]
        name: Option<String>,
        daily_rate: Money,
        #[serde(default = "default_cleaning_days")]
        cleaning_days: u32,
    },
    UpdateUnit {
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
        daily_rate: Money,
        #[serde(default = "default_cleaning_days")]
        cleaning_days: u32,
    },
    RemoveUnit {
        id: Ulid,
    },
    SetUnitStatus {
        id: Ulid,
        status: UnitStatus,
    },
    ListUnits,
    GetUnit {
        id: Ulid,
    },

    // ── Booking/bot surface ──────────────────────────────
    CreateReservation {
        #[serde(default)]
        id: Option<Ulid>,
        resource_id: Ulid,
        holder_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        /// Absent → the 15-minute default. Bot offline-payment flows pass
        /// a longer TTL (~3h).
        #[serde(default)]
        hold_ttl_ms: Option<Ms>,
        /// Operator-entered bookings that should never auto-expire.
        #[serde(default)]
        no_expiry: bool,
        #[serde(default = "default_true")]
        hold_calendar: bool,
    },
    CancelReservation {
        id: Ulid,
        #[serde(default)]
        actor_id: Option<Ulid>,
        #[serde(default)]
        reason: Option<String>,
    },
    GetReservation {
        id: Ulid,
    },
    ListReservations {
        resource_id: Ulid,
    },
    CheckAvailability {
        resource_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    OccupancyRate {
        resource_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    FreeRanges {
        resource_id: Ulid,
        min_nights: i64,
        max_nights: i64,
        window_start: NaiveDate,
        window_end: NaiveDate,
    },
    CalendarDays {
        resource_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    BlockDays {
        resource_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        status: DayStatus,
        #[serde(default)]
        notes: Option<String>,
    },
    UnblockDays {
        resource_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    SeedCalendar {
        resource_id: Ulid,
        days_ahead: i64,
    },

    // ── Payment collaborator ─────────────────────────────
    ConfirmReservation {
        id: Ulid,
    },
    FailReservation {
        id: Ulid,
    },

    // ── Scheduling infrastructure ────────────────────────
    RunExpirySweep,
    RunLifecycleSweep {
        /// Absent → today (UTC). Explicit dates serve ops tooling and tests.
        #[serde(default)]
        today: Option<NaiveDate>,
    },

    // ── Notification streaming ───────────────────────────
    Listen {
        resource_id: Ulid,
    },
    Unlisten {
        resource_id: Ulid,
    },
    UnlistenAll,
}

fn default_true() -> bool {
    true
}

fn default_cleaning_days() -> u32 {
    DEFAULT_CLEANING_DAYS
}

pub fn parse_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line)
}

/// One response per request line.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Response::Ok { data: Some(value) },
            Err(e) => Response::Error {
                code: "internal".into(),
                message: format!("response encoding failed: {e}"),
            },
        }
    }

    pub fn empty() -> Self {
        Response::Ok { data: None }
    }

    pub fn engine_error(err: &EngineError) -> Self {
        Response::Error {
            code: err.code().into(),
            message: err.to_string(),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Response::Error {
            code: "bad_request".into(),
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> String {
        // Response serialization cannot fail: all payloads went through
        // to_value in `ok` already.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","code":"internal","message":"encoding failed"}"#.into()
        })
    }
}

/// Asynchronous push frame for LISTEN subscribers.
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub notify: Ulid,
    pub event: &'a Event,
}
