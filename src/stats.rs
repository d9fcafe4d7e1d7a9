use chrono::{Days, NaiveDate};
use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{query_as, FromRow, SqlitePool};
use crate::auth::{authorize_admin, FdAdminToken};
use crate::db::DbPool;
use crate::error::ApiError;
use crate::event::{load_event, EventId};
use crate::fdatetime::FdDateTime;
use crate::AppConfig;

/// Rollups over persisted `waiver_validated` snapshots; waiver state is never
/// recomputed here.
#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct StatsSnapshot {
    pub checkins_today: i64,
    pub checkins_last_7_days: i64,
    pub checkins_total: i64,
    pub waiver_ok: i64,
    pub waiver_failed: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct EventStats {
    pub event_id: EventId,
    pub event_name: String,
    pub max_capacity: i64,
    pub current_capacity: i64,
    pub checkins_today: i64,
    pub checkins_last_7_days: i64,
    pub checkins_total: i64,
    pub waiver_ok: i64,
    pub waiver_failed: i64,
    pub capacity_used: f64,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ExportRecord {
    pub id: i64,
    pub check_in_time: FdDateTime,
    pub athlete_id: i64,
    pub athlete_name: String,
    pub athlete_email: Option<String>,
    pub event_id: EventId,
    pub event_name: String,
    pub event_date: NaiveDate,
    pub waiver_validated: bool,
    pub notes: Option<String>,
}

#[derive(Default, Clone, Debug)]
pub struct ExportFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub event_id: Option<EventId>,
}

// stored timestamps carry a uniform local offset, so the leading ten
// characters are the local calendar date
fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub async fn stats_snapshot(pool: &SqlitePool, now: FdDateTime) -> Result<StatsSnapshot, ApiError> {
    let today = now.date();
    let week_start = today - Days::new(7);
    let snapshot: StatsSnapshot = query_as(
        "SELECT \
           COALESCE(SUM(substr(check_in_time, 1, 10) = ?1), 0) AS checkins_today, \
           COALESCE(SUM(substr(check_in_time, 1, 10) >= ?2), 0) AS checkins_last_7_days, \
           COUNT(*) AS checkins_total, \
           COALESCE(SUM(waiver_validated = 1), 0) AS waiver_ok, \
           COALESCE(SUM(waiver_validated = 0), 0) AS waiver_failed \
         FROM checkins",
    )
    .bind(date_str(today))
    .bind(date_str(week_start))
    .fetch_one(pool)
    .await?;
    Ok(snapshot)
}

/// The snapshot rollup scoped to one event, plus `capacity_used` against the
/// event's maximum, rounded to one decimal place.
pub async fn event_stats(
    pool: &SqlitePool,
    event_id: EventId,
    now: FdDateTime,
) -> Result<EventStats, ApiError> {
    let event = load_event(pool, event_id).await?;
    let today = now.date();
    let week_start = today - Days::new(7);
    let counts: (i64, i64, i64, i64, i64) = query_as(
        "SELECT \
           COALESCE(SUM(substr(check_in_time, 1, 10) = ?2), 0), \
           COALESCE(SUM(substr(check_in_time, 1, 10) >= ?3), 0), \
           COUNT(*), \
           COALESCE(SUM(waiver_validated = 1), 0), \
           COALESCE(SUM(waiver_validated = 0), 0) \
         FROM checkins WHERE event_id=?1",
    )
    .bind(event_id)
    .bind(date_str(today))
    .bind(date_str(week_start))
    .fetch_one(pool)
    .await?;
    let (checkins_today, checkins_last_7_days, checkins_total, waiver_ok, waiver_failed) = counts;
    let capacity_used =
        (checkins_total as f64 * 100.0 / event.max_capacity as f64 * 10.0).round() / 10.0;
    Ok(EventStats {
        event_id,
        event_name: event.name,
        max_capacity: event.max_capacity,
        current_capacity: event.current_capacity,
        checkins_today,
        checkins_last_7_days,
        checkins_total,
        waiver_ok,
        waiver_failed,
        capacity_used,
    })
}

const EXPORT_SQL: &str = "SELECT c.id, c.check_in_time, c.athlete_id, \
    a.name AS athlete_name, a.email AS athlete_email, c.event_id, \
    e.name AS event_name, e.date AS event_date, c.waiver_validated, c.notes \
    FROM checkins c \
    JOIN athletes a ON a.id = c.athlete_id \
    JOIN events e ON e.id = c.event_id \
    WHERE 1=1";

/// Flattened check-in rows for downstream reporting, filters conjunctive and
/// all optional, newest first.
pub async fn export_check_ins(
    pool: &SqlitePool,
    filter: &ExportFilter,
) -> Result<Vec<ExportRecord>, ApiError> {
    let mut sql = String::from(EXPORT_SQL);
    if filter.start_date.is_some() {
        sql.push_str(" AND substr(c.check_in_time, 1, 10) >= ?");
    }
    if filter.end_date.is_some() {
        sql.push_str(" AND substr(c.check_in_time, 1, 10) <= ?");
    }
    if filter.event_id.is_some() {
        sql.push_str(" AND c.event_id=?");
    }
    sql.push_str(" ORDER BY c.check_in_time DESC");

    let mut q = query_as::<_, ExportRecord>(&sql);
    if let Some(date) = filter.start_date {
        q = q.bind(date_str(date));
    }
    if let Some(date) = filter.end_date {
        q = q.bind(date_str(date));
    }
    if let Some(event_id) = filter.event_id {
        q = q.bind(event_id);
    }
    Ok(q.fetch_all(pool).await?)
}

fn render_csv(rows: &[ExportRecord]) -> anyhow::Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in rows {
        wtr.serialize(row)?;
    }
    Ok(String::from_utf8(wtr.into_inner()?)?)
}

fn parse_date(name: &str, value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| ApiError::validation(format!("Invalid {name} '{value}': {e}")))
}

#[get("/api/stats")]
async fn get_stats(
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Json<StatsSnapshot>, ApiError> {
    authorize_admin(cfg, &token)?;
    let snapshot = stats_snapshot(&db.0, FdDateTime::now()).await?;
    Ok(Json(snapshot))
}

#[get("/api/event/<event_id>/stats")]
async fn get_event_stats(
    event_id: EventId,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Json<EventStats>, ApiError> {
    authorize_admin(cfg, &token)?;
    Ok(Json(event_stats(&db.0, event_id, FdDateTime::now()).await?))
}

#[get("/api/checkin/export?<start_date>&<end_date>&<event_id>&<format>")]
async fn get_export(
    start_date: Option<&str>,
    end_date: Option<&str>,
    event_id: Option<EventId>,
    format: Option<&str>,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<(ContentType, String), ApiError> {
    authorize_admin(cfg, &token)?;
    let filter = ExportFilter {
        start_date: start_date.map(|s| parse_date("start_date", s)).transpose()?,
        end_date: end_date.map(|s| parse_date("end_date", s)).transpose()?,
        event_id,
    };
    let rows = export_check_ins(&db.0, &filter).await?;
    match format {
        Some("csv") => {
            let body = render_csv(&rows)
                .map_err(|e| ApiError::internal_consistency(format!("CSV export failed: {e}")))?;
            Ok((ContentType::CSV, body))
        }
        None | Some("json") => {
            let body = serde_json::to_string(&rows)
                .map_err(|e| ApiError::internal_consistency(format!("JSON export failed: {e}")))?;
            Ok((ContentType::JSON, body))
        }
        Some(other) => Err(ApiError::validation(format!("Unknown export format '{other}'"))),
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_stats,
            get_event_stats,
            get_export,
        ])
}
