use chrono::{DateTime, FixedOffset, NaiveDate};
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

pub type AthleteId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AthleteRecord {
    pub id: AthleteId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub date_of_birth: NaiveDate,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub has_valid_waiver: bool,
    pub waiver_signed_date: Option<NaiveDate>,
    pub waiver_expiration_date: Option<FdDateTime>,
    pub last_visited: Option<NaiveDate>,
    pub created_at: FdDateTime,
    pub updated_at: FdDateTime,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedAthlete {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub date_of_birth: NaiveDate,
    #[serde(default)]
    pub emergency_contact_name: Option<String>,
    #[serde(default)]
    pub emergency_contact_phone: Option<String>,
    #[serde(default)]
    pub has_valid_waiver: bool,
    #[serde(default)]
    pub waiver_signed_date: Option<NaiveDate>,
    #[serde(default)]
    pub waiver_expiration_date: Option<FdDateTime>,
}

impl PostedAthlete {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::validation("Athlete name must not be empty"));
        }
        Ok(())
    }
}

/// Waiver validity at a reference instant. An expiration equal to `now`
/// counts as expired; a waiver without expiration is perpetual.
pub fn waiver_valid(
    has_valid_waiver: bool,
    expiration: Option<DateTime<FixedOffset>>,
    now: DateTime<FixedOffset>,
) -> bool {
    if !has_valid_waiver {
        return false;
    }
    match expiration {
        None => true,
        Some(exp) => exp > now,
    }
}

pub async fn load_athlete(pool: &SqlitePool, athlete_id: AthleteId) -> Result<AthleteRecord, ApiError> {
    let athlete: Option<AthleteRecord> = query_as("SELECT * FROM athletes WHERE id=?")
        .bind(athlete_id)
        .fetch_optional(pool)
        .await?;
    athlete.ok_or_else(|| ApiError::not_found(format!("Athlete id={athlete_id} not found")))
}

async fn save_athlete(
    pool: &SqlitePool,
    athlete_id: Option<AthleteId>,
    vals: &PostedAthlete,
    now: FdDateTime,
) -> Result<AthleteId, ApiError> {
    let id = if let Some(athlete_id) = athlete_id {
        load_athlete(pool, athlete_id).await?;
        query(
            "UPDATE athletes SET name=?, email=?, phone=?, date_of_birth=?, \
             emergency_contact_name=?, emergency_contact_phone=?, has_valid_waiver=?, \
             waiver_signed_date=?, waiver_expiration_date=?, updated_at=? WHERE id=?",
        )
        .bind(&vals.name)
        .bind(&vals.email)
        .bind(&vals.phone)
        .bind(vals.date_of_birth)
        .bind(&vals.emergency_contact_name)
        .bind(&vals.emergency_contact_phone)
        .bind(vals.has_valid_waiver)
        .bind(vals.waiver_signed_date)
        .bind(vals.waiver_expiration_date.map(|d| d.0))
        .bind(now.0)
        .bind(athlete_id)
        .execute(pool)
        .await?;
        athlete_id
    } else {
        let id: (i64,) = query_as(
            "INSERT INTO athletes(name, email, phone, date_of_birth, emergency_contact_name, \
             emergency_contact_phone, has_valid_waiver, waiver_signed_date, \
             waiver_expiration_date, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&vals.name)
        .bind(&vals.email)
        .bind(&vals.phone)
        .bind(vals.date_of_birth)
        .bind(&vals.emergency_contact_name)
        .bind(&vals.emergency_contact_phone)
        .bind(vals.has_valid_waiver)
        .bind(vals.waiver_signed_date)
        .bind(vals.waiver_expiration_date.map(|d| d.0))
        .bind(now.0)
        .bind(now.0)
        .fetch_one(pool)
        .await?;
        id.0
    };
    Ok(id)
}

#[post("/api/athlete", data = "<posted>")]
async fn post_athlete(posted: Json<PostedAthlete>, db: &State<DbPool>) -> Result<Json<AthleteRecord>, ApiError> {
    posted.validate()?;
    let now = FdDateTime::now().trimmed_to_sec();
    let id = save_athlete(&db.0, None, &posted, now).await?;
    Ok(Json(load_athlete(&db.0, id).await?))
}

#[post("/api/athlete/<athlete_id>", data = "<posted>")]
async fn post_athlete_update(
    athlete_id: AthleteId,
    posted: Json<PostedAthlete>,
    db: &State<DbPool>,
) -> Result<Json<AthleteRecord>, ApiError> {
    posted.validate()?;
    let now = FdDateTime::now().trimmed_to_sec();
    save_athlete(&db.0, Some(athlete_id), &posted, now).await?;
    Ok(Json(load_athlete(&db.0, athlete_id).await?))
}

#[get("/api/athlete/<athlete_id>")]
async fn get_athlete(athlete_id: AthleteId, db: &State<DbPool>) -> Result<Json<AthleteRecord>, ApiError> {
    Ok(Json(load_athlete(&db.0, athlete_id).await?))
}

#[get("/api/athlete?<name>")]
async fn get_athletes(name: Option<&str>, db: &State<DbPool>) -> Result<Json<Vec<AthleteRecord>>, ApiError> {
    let athletes: Vec<AthleteRecord> = if let Some(name) = name {
        query_as("SELECT * FROM athletes WHERE name LIKE ? ORDER BY name")
            .bind(format!("%{name}%"))
            .fetch_all(&db.0)
            .await?
    } else {
        query_as("SELECT * FROM athletes ORDER BY name").fetch_all(&db.0).await?
    };
    Ok(Json(athletes))
}

#[delete("/api/athlete/<athlete_id>")]
async fn delete_athlete(
    athlete_id: AthleteId,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Status, ApiError> {
    authorize_admin(cfg, &token)?;
    load_athlete(&db.0, athlete_id).await?;
    let cnt: (i64,) = query_as("SELECT COUNT(*) FROM checkins WHERE athlete_id=?")
        .bind(athlete_id)
        .fetch_one(&db.0)
        .await?;
    if cnt.0 > 0 {
        return Err(ApiError::conflict(format!(
            "Athlete id={athlete_id} has {} check-in(s), reverse them first",
            cnt.0
        )));
    }
    query("DELETE FROM athletes WHERE id=?").bind(athlete_id).execute(&db.0).await?;
    Ok(Status::NoContent)
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_athlete,
            post_athlete_update,
            get_athlete,
            get_athletes,
            delete_athlete,
        ])
}
