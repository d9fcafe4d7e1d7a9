use chrono::NaiveDate;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{query, query_as, FromRow, SqlitePool};
use crate::auth::{authorize_admin, FdAdminToken};
use crate::db::DbPool;
use crate::error::ApiError;
use crate::fdatetime::FdDateTime;
use crate::AppConfig;

pub type EventId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct EventRecord {
    pub id: EventId,
    pub name: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub max_capacity: i64,
    pub current_capacity: i64,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: FdDateTime,
    pub updated_at: FdDateTime,
}

/// Derived booking state, recomputed from `date` + `is_active` on every use
/// and never stored.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum EventState {
    Bookable,
    Disabled,
    Past,
}

/// Past wins over the active flag; only an active event dated today takes
/// check-ins. Events dated today or later with the flag down, and future
/// events not yet open, report Disabled.
pub fn classify_event(date: NaiveDate, is_active: bool, today: NaiveDate) -> EventState {
    if date < today {
        EventState::Past
    } else if date == today && is_active {
        EventState::Bookable
    } else {
        EventState::Disabled
    }
}

#[derive(Serialize, Debug)]
pub struct EventWithState {
    #[serde(flatten)]
    pub event: EventRecord,
    pub state: EventState,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedEvent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    pub max_capacity: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PostedEvent {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::validation("Event name must not be empty"));
        }
        if self.max_capacity < 1 {
            return Err(ApiError::validation("Event max_capacity must be positive"));
        }
        Ok(())
    }
}

pub async fn load_event(pool: &SqlitePool, event_id: EventId) -> Result<EventRecord, ApiError> {
    let event: Option<EventRecord> = query_as("SELECT * FROM events WHERE id=?")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    event.ok_or_else(|| ApiError::not_found(format!("Event id={event_id} not found")))
}

async fn save_event(
    pool: &SqlitePool,
    event_id: Option<EventId>,
    vals: &PostedEvent,
    now: FdDateTime,
) -> Result<EventId, ApiError> {
    vals.validate()?;
    let id = if let Some(event_id) = event_id {
        let event = load_event(pool, event_id).await?;
        // current_capacity is owned by the check-in engine, an edit may not
        // shrink the event below its live attendance
        if vals.max_capacity < event.current_capacity {
            return Err(ApiError::validation(format!(
                "max_capacity {} is below current attendance {}",
                vals.max_capacity, event.current_capacity
            )));
        }
        query(
            "UPDATE events SET name=?, description=?, date=?, start_time=?, end_time=?, \
             max_capacity=?, is_active=?, updated_at=? WHERE id=?",
        )
        .bind(&vals.name)
        .bind(&vals.description)
        .bind(vals.date)
        .bind(&vals.start_time)
        .bind(&vals.end_time)
        .bind(vals.max_capacity)
        .bind(vals.is_active)
        .bind(now.0)
        .bind(event_id)
        .execute(pool)
        .await?;
        event_id
    } else {
        let id: (i64,) = query_as(
            "INSERT INTO events(name, description, date, start_time, end_time, max_capacity, \
             current_capacity, is_active, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&vals.name)
        .bind(&vals.description)
        .bind(vals.date)
        .bind(&vals.start_time)
        .bind(&vals.end_time)
        .bind(vals.max_capacity)
        .bind(vals.is_active)
        .bind(&vals.created_by)
        .bind(now.0)
        .bind(now.0)
        .fetch_one(pool)
        .await?;
        log::info!("Event created, id: {}", id.0);
        id.0
    };
    Ok(id)
}

#[post("/api/event", data = "<posted>")]
async fn post_event(
    posted: Json<PostedEvent>,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Json<EventRecord>, ApiError> {
    authorize_admin(cfg, &token)?;
    let now = FdDateTime::now().trimmed_to_sec();
    let id = save_event(&db.0, None, &posted, now).await?;
    Ok(Json(load_event(&db.0, id).await?))
}

#[post("/api/event/<event_id>", data = "<posted>")]
async fn post_event_update(
    event_id: EventId,
    posted: Json<PostedEvent>,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Json<EventRecord>, ApiError> {
    authorize_admin(cfg, &token)?;
    let now = FdDateTime::now().trimmed_to_sec();
    save_event(&db.0, Some(event_id), &posted, now).await?;
    Ok(Json(load_event(&db.0, event_id).await?))
}

#[get("/api/event/<event_id>")]
async fn get_event(event_id: EventId, db: &State<DbPool>) -> Result<Json<EventWithState>, ApiError> {
    let event = load_event(&db.0, event_id).await?;
    let state = classify_event(event.date, event.is_active, FdDateTime::now().date());
    Ok(Json(EventWithState { event, state }))
}

#[get("/api/event")]
async fn get_events(db: &State<DbPool>) -> Result<Json<Vec<EventWithState>>, ApiError> {
    let today = FdDateTime::now().date();
    let events: Vec<EventRecord> = query_as("SELECT * FROM events ORDER BY date DESC, id DESC")
        .fetch_all(&db.0)
        .await?;
    let events = events
        .into_iter()
        .map(|event| {
            let state = classify_event(event.date, event.is_active, today);
            EventWithState { event, state }
        })
        .collect();
    Ok(Json(events))
}

#[delete("/api/event/<event_id>")]
async fn delete_event(
    event_id: EventId,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Status, ApiError> {
    authorize_admin(cfg, &token)?;
    load_event(&db.0, event_id).await?;
    let mut txn = db.0.begin().await?;
    query("DELETE FROM checkins WHERE event_id=?")
        .bind(event_id)
        .execute(&mut *txn)
        .await?;
    query("DELETE FROM events WHERE id=?")
        .bind(event_id)
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;
    Ok(Status::NoContent)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_event,
            post_event_update,
            get_event,
            get_events,
            delete_event,
        ])
}
