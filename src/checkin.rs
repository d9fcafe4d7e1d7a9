use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{query, query_as, FromRow, SqlitePool};
use crate::athlete::{waiver_valid, AthleteId, AthleteRecord};
use crate::auth::{authorize_admin, FdAdminToken};
use crate::db::DbPool;
use crate::error::ApiError;
use crate::event::{classify_event, EventId, EventRecord, EventState};
use crate::fdatetime::FdDateTime;
use crate::AppConfig;

pub type CheckInId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct CheckInRecord {
    pub id: CheckInId,
    pub athlete_id: AthleteId,
    pub event_id: EventId,
    pub check_in_time: FdDateTime,
    pub waiver_validated: bool,
    pub notes: Option<String>,
    pub created_at: FdDateTime,
}

/// Check-in joined with athlete and event columns for caller convenience.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct CheckInDetail {
    pub id: CheckInId,
    pub athlete_id: AthleteId,
    pub athlete_name: String,
    pub athlete_email: Option<String>,
    pub event_id: EventId,
    pub event_name: String,
    pub check_in_time: FdDateTime,
    pub waiver_validated: bool,
    pub notes: Option<String>,
}

const DETAIL_SQL: &str = "SELECT c.id, c.athlete_id, a.name AS athlete_name, \
    a.email AS athlete_email, c.event_id, e.name AS event_name, c.check_in_time, \
    c.waiver_validated, c.notes \
    FROM checkins c \
    JOIN athletes a ON a.id = c.athlete_id \
    JOIN events e ON e.id = c.event_id";

/// Check an athlete into an event. All precondition checks, the insert and
/// both cascading updates run in one transaction; the capacity guard is the
/// first statement so concurrent check-ins serialize on the event row and the
/// losing caller re-reads committed state instead of a stale snapshot.
///
/// The waiver outcome is computed once against `now` and frozen onto the row;
/// an invalid waiver does not fail the check-in.
pub async fn create_check_in(
    pool: &SqlitePool,
    athlete_id: AthleteId,
    event_id: EventId,
    notes: Option<&str>,
    now: FdDateTime,
) -> Result<CheckInDetail, ApiError> {
    let mut txn = pool.begin().await?;
    let guard = query(
        "UPDATE events SET current_capacity = current_capacity + 1, updated_at=? \
         WHERE id=? AND current_capacity < max_capacity",
    )
    .bind(now.0)
    .bind(event_id)
    .execute(&mut *txn)
    .await?;
    let event: Option<EventRecord> = query_as("SELECT * FROM events WHERE id=?")
        .bind(event_id)
        .fetch_optional(&mut *txn)
        .await?;
    let Some(event) = event else {
        return Err(ApiError::not_found(format!("Event id={event_id} not found")));
    };
    // existence checks win over eligibility and capacity rejections
    let athlete: Option<AthleteRecord> = query_as("SELECT * FROM athletes WHERE id=?")
        .bind(athlete_id)
        .fetch_optional(&mut *txn)
        .await?;
    let Some(athlete) = athlete else {
        return Err(ApiError::not_found(format!("Athlete id={athlete_id} not found")));
    };
    // classified at transaction time, a stale "active" listing does not help the caller
    match classify_event(event.date, event.is_active, now.date()) {
        EventState::Bookable => {}
        EventState::Disabled => {
            return Err(ApiError::conflict(format!("Event id={event_id} is not active")));
        }
        EventState::Past => {
            return Err(ApiError::conflict(format!("Event id={event_id} is already over")));
        }
    }
    if guard.rows_affected() == 0 {
        return Err(ApiError::conflict(format!(
            "Event id={event_id} is full ({}/{})",
            event.current_capacity, event.max_capacity
        )));
    }
    let waiver_validated = waiver_valid(
        athlete.has_valid_waiver,
        athlete.waiver_expiration_date.map(|d| d.0),
        now.0,
    );
    let inserted = query_as::<_, (i64,)>(
        "INSERT INTO checkins(athlete_id, event_id, check_in_time, waiver_validated, notes, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(athlete_id)
    .bind(event_id)
    .bind(now.0)
    .bind(waiver_validated)
    .bind(notes)
    .bind(now.0)
    .fetch_one(&mut *txn)
    .await;
    let (check_in_id,) = match inserted {
        Ok(row) => row,
        Err(sqlx::Error::Database(db))
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
        {
            return Err(ApiError::conflict(format!(
                "Athlete id={athlete_id} is already checked in to event id={event_id}"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    query("UPDATE athletes SET last_visited=?, updated_at=? WHERE id=?")
        .bind(now.date())
        .bind(now.0)
        .bind(athlete_id)
        .execute(&mut *txn)
        .await?;
    let detail: CheckInDetail = query_as(&format!("{DETAIL_SQL} WHERE c.id=?"))
        .bind(check_in_id)
        .fetch_one(&mut *txn)
        .await?;
    txn.commit().await?;
    log::info!(
        "Check-in id={} athlete id={athlete_id} event id={event_id} waiver_validated={waiver_validated}",
        detail.id
    );
    Ok(detail)
}

/// Administrative correction: delete the check-in and give the slot back in
/// the same transaction. A decrement that would go negative means a prior
/// invariant breach and fails loudly instead of clamping.
pub async fn reverse_check_in(
    pool: &SqlitePool,
    check_in_id: CheckInId,
    now: FdDateTime,
) -> Result<(), ApiError> {
    let mut txn = pool.begin().await?;
    let rec: Option<CheckInRecord> = query_as("SELECT * FROM checkins WHERE id=?")
        .bind(check_in_id)
        .fetch_optional(&mut *txn)
        .await?;
    let Some(rec) = rec else {
        return Err(ApiError::not_found(format!("Check-in id={check_in_id} not found")));
    };
    query("DELETE FROM checkins WHERE id=?")
        .bind(check_in_id)
        .execute(&mut *txn)
        .await?;
    let upd = query(
        "UPDATE events SET current_capacity = current_capacity - 1, updated_at=? \
         WHERE id=? AND current_capacity > 0",
    )
    .bind(now.0)
    .bind(rec.event_id)
    .execute(&mut *txn)
    .await?;
    if upd.rows_affected() == 0 {
        return Err(ApiError::internal_consistency(format!(
            "Capacity of event id={} would go negative on reversal of check-in id={check_in_id}",
            rec.event_id
        )));
    }
    txn.commit().await?;
    log::info!("Check-in id={check_in_id} reversed, event id={}", rec.event_id);
    Ok(())
}

/// Metadata-only update, no capacity or athlete side effects. The update and
/// the detail re-read share a transaction so a concurrent reversal cannot
/// slip between them.
pub async fn update_notes(
    pool: &SqlitePool,
    check_in_id: CheckInId,
    notes: &str,
) -> Result<CheckInDetail, ApiError> {
    let mut txn = pool.begin().await?;
    let upd = query("UPDATE checkins SET notes=? WHERE id=?")
        .bind(notes)
        .bind(check_in_id)
        .execute(&mut *txn)
        .await?;
    if upd.rows_affected() == 0 {
        return Err(ApiError::not_found(format!("Check-in id={check_in_id} not found")));
    }
    let detail: CheckInDetail = query_as(&format!("{DETAIL_SQL} WHERE c.id=?"))
        .bind(check_in_id)
        .fetch_one(&mut *txn)
        .await?;
    txn.commit().await?;
    Ok(detail)
}

pub async fn list_event_check_ins(
    pool: &SqlitePool,
    event_id: EventId,
) -> Result<Vec<CheckInDetail>, ApiError> {
    crate::event::load_event(pool, event_id).await?;
    let details: Vec<CheckInDetail> =
        query_as(&format!("{DETAIL_SQL} WHERE c.event_id=? ORDER BY c.check_in_time DESC"))
            .bind(event_id)
            .fetch_all(pool)
            .await?;
    Ok(details)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedCheckIn {
    pub athlete_id: AthleteId,
    pub event_id: EventId,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedNotes {
    pub notes: String,
}

#[post("/api/checkin", data = "<posted>")]
async fn post_checkin(posted: Json<PostedCheckIn>, db: &State<DbPool>) -> Result<Json<CheckInDetail>, ApiError> {
    let now = FdDateTime::now().trimmed_to_sec();
    let detail =
        create_check_in(&db.0, posted.athlete_id, posted.event_id, posted.notes.as_deref(), now).await?;
    Ok(Json(detail))
}

#[delete("/api/checkin/<check_in_id>")]
async fn delete_checkin(
    check_in_id: CheckInId,
    token: FdAdminToken,
    cfg: &State<AppConfig>,
    db: &State<DbPool>,
) -> Result<Status, ApiError> {
    authorize_admin(cfg, &token)?;
    reverse_check_in(&db.0, check_in_id, FdDateTime::now().trimmed_to_sec()).await?;
    Ok(Status::NoContent)
}

#[post("/api/checkin/<check_in_id>/notes", data = "<posted>")]
async fn post_checkin_notes(
    check_in_id: CheckInId,
    posted: Json<PostedNotes>,
    db: &State<DbPool>,
) -> Result<Json<CheckInDetail>, ApiError> {
    Ok(Json(update_notes(&db.0, check_in_id, &posted.notes).await?))
}

#[get("/api/event/<event_id>/checkin")]
async fn get_event_checkins(event_id: EventId, db: &State<DbPool>) -> Result<Json<Vec<CheckInDetail>>, ApiError> {
    Ok(Json(list_event_check_ins(&db.0, event_id).await?))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_checkin,
            delete_checkin,
            post_checkin_notes,
            get_event_checkins,
        ])
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::{Days, NaiveDate};
    use rocket::tokio::task::JoinSet;
    use crate::db::test_pool;

    pub(crate) async fn seed_athlete(
        pool: &SqlitePool,
        name: &str,
        has_valid_waiver: bool,
        waiver_expiration_date: Option<FdDateTime>,
    ) -> AthleteId {
        let now = FdDateTime::now().trimmed_to_sec();
        let id: (i64,) = query_as(
            "INSERT INTO athletes(name, date_of_birth, has_valid_waiver, waiver_expiration_date, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap())
        .bind(has_valid_waiver)
        .bind(waiver_expiration_date.map(|d| d.0))
        .bind(now.0)
        .bind(now.0)
        .fetch_one(pool)
        .await
        .unwrap();
        id.0
    }

    pub(crate) async fn seed_event(
        pool: &SqlitePool,
        max_capacity: i64,
        date: NaiveDate,
        is_active: bool,
    ) -> EventId {
        let now = FdDateTime::now().trimmed_to_sec();
        let id: (i64,) = query_as(
            "INSERT INTO events(name, date, max_capacity, current_capacity, is_active, \
             created_at, updated_at) VALUES (?, ?, ?, 0, ?, ?, ?) RETURNING id",
        )
        .bind("Test event")
        .bind(date)
        .bind(max_capacity)
        .bind(is_active)
        .bind(now.0)
        .bind(now.0)
        .fetch_one(pool)
        .await
        .unwrap();
        id.0
    }

    async fn checkin_count(pool: &SqlitePool, event_id: EventId) -> i64 {
        let cnt: (i64,) = query_as("SELECT COUNT(*) FROM checkins WHERE event_id=?")
            .bind(event_id)
            .fetch_one(pool)
            .await
            .unwrap();
        cnt.0
    }

    #[rocket::async_test]
    async fn concurrent_check_ins_never_overbook() {
        for max_capacity in 1..=5_i64 {
            let pool = test_pool().await;
            let now = FdDateTime::now().trimmed_to_sec();
            let event_id = seed_event(&pool, max_capacity, now.date(), true).await;
            let mut athletes = Vec::new();
            for n in 0..10 {
                athletes.push(seed_athlete(&pool, &format!("Athlete {n}"), true, None).await);
            }

            let mut tasks = JoinSet::new();
            for athlete_id in athletes {
                let pool = pool.clone();
                tasks.spawn(async move {
                    create_check_in(&pool, athlete_id, event_id, None, now).await
                });
            }
            let mut successes = 0i64;
            while let Some(res) = tasks.join_next().await {
                match res.unwrap() {
                    Ok(detail) => {
                        assert_eq!(detail.event_id, event_id);
                        successes += 1;
                    }
                    Err(err) => assert_eq!(err.kind(), "conflict", "unexpected failure: {err}"),
                }
            }
            assert_eq!(successes, max_capacity);
            let event = crate::event::load_event(&pool, event_id).await.unwrap();
            assert_eq!(event.current_capacity, max_capacity);
            assert_eq!(checkin_count(&pool, event_id).await, max_capacity);
        }
    }

    #[rocket::async_test]
    async fn concurrent_duplicate_check_in_yields_one_success() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 5, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Repeat Offender", true, None).await;

        let mut tasks = JoinSet::new();
        for _ in 0..2 {
            let pool = pool.clone();
            tasks.spawn(async move { create_check_in(&pool, athlete_id, event_id, None, now).await });
        }
        let mut successes = 0;
        while let Some(res) = tasks.join_next().await {
            match res.unwrap() {
                Ok(_) => successes += 1,
                Err(err) => assert_eq!(err.kind(), "conflict"),
            }
        }
        assert_eq!(successes, 1);
        // the loser's capacity increment must have been rolled back
        let event = crate::event::load_event(&pool, event_id).await.unwrap();
        assert_eq!(event.current_capacity, 1);
        assert_eq!(checkin_count(&pool, event_id).await, 1);
    }

    #[rocket::async_test]
    async fn reversal_restores_exactly_one_slot() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 2, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "In And Out", true, None).await;

        let detail = create_check_in(&pool, athlete_id, event_id, None, now).await.unwrap();
        let event = crate::event::load_event(&pool, event_id).await.unwrap();
        assert_eq!(event.current_capacity, 1);

        reverse_check_in(&pool, detail.id, now).await.unwrap();
        let event = crate::event::load_event(&pool, event_id).await.unwrap();
        assert_eq!(event.current_capacity, 0);
        assert_eq!(checkin_count(&pool, event_id).await, 0);

        let err = reverse_check_in(&pool, detail.id, now).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[rocket::async_test]
    async fn reversal_of_corrupted_capacity_fails_loudly() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 2, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Ghost", true, None).await;
        let detail = create_check_in(&pool, athlete_id, event_id, None, now).await.unwrap();

        // simulate a prior invariant breach
        query("UPDATE events SET current_capacity=0 WHERE id=?")
            .bind(event_id)
            .execute(&pool)
            .await
            .unwrap();
        let err = reverse_check_in(&pool, detail.id, now).await.unwrap_err();
        assert_eq!(err.kind(), "internal_consistency");
        // nothing may have been deleted
        assert_eq!(checkin_count(&pool, event_id).await, 1);
    }

    #[rocket::async_test]
    async fn past_and_disabled_events_reject_check_ins() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let athlete_id = seed_athlete(&pool, "Early Bird", true, None).await;

        let past_event = seed_event(&pool, 5, now.date() - Days::new(1), true).await;
        let err = create_check_in(&pool, athlete_id, past_event, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let disabled_event = seed_event(&pool, 5, now.date(), false).await;
        let err = create_check_in(&pool, athlete_id, disabled_event, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let future_event = seed_event(&pool, 5, now.date() + Days::new(1), false).await;
        let err = create_check_in(&pool, athlete_id, future_event, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        for event_id in [past_event, disabled_event, future_event] {
            let event = crate::event::load_event(&pool, event_id).await.unwrap();
            assert_eq!(event.current_capacity, 0);
            assert_eq!(checkin_count(&pool, event_id).await, 0);
        }
    }

    #[rocket::async_test]
    async fn unknown_ids_are_not_found() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 5, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Known", true, None).await;

        let err = create_check_in(&pool, 9999, event_id, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = create_check_in(&pool, athlete_id, 9999, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        // a rejected check-in must not leak a capacity increment
        let event = crate::event::load_event(&pool, event_id).await.unwrap();
        assert_eq!(event.current_capacity, 0);

        // an unknown athlete stays not_found even when the event would also
        // reject the check-in on its own
        let full_event = seed_event(&pool, 1, now.date(), true).await;
        create_check_in(&pool, athlete_id, full_event, None, now).await.unwrap();
        let err = create_check_in(&pool, 9999, full_event, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let event = crate::event::load_event(&pool, full_event).await.unwrap();
        assert_eq!(event.current_capacity, 1);

        let disabled_event = seed_event(&pool, 5, now.date(), false).await;
        let err = create_check_in(&pool, 9999, disabled_event, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let event = crate::event::load_event(&pool, disabled_event).await.unwrap();
        assert_eq!(event.current_capacity, 0);
    }

    #[rocket::async_test]
    async fn waiver_snapshot_is_frozen_at_check_in() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 5, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Signed Up", true, None).await;

        let detail = create_check_in(&pool, athlete_id, event_id, None, now).await.unwrap();
        assert!(detail.waiver_validated);

        // revoking the waiver later does not rewrite history
        query("UPDATE athletes SET has_valid_waiver=0 WHERE id=?")
            .bind(athlete_id)
            .execute(&pool)
            .await
            .unwrap();
        let rows = list_event_check_ins(&pool, event_id).await.unwrap();
        assert!(rows.iter().all(|c| c.waiver_validated));

        // an invalid waiver is flagged but does not fail the check-in
        let unsigned = seed_athlete(&pool, "Unsigned", false, None).await;
        let detail = create_check_in(&pool, unsigned, event_id, None, now).await.unwrap();
        assert!(!detail.waiver_validated);
    }

    #[rocket::async_test]
    async fn check_in_sets_last_visited() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 5, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Regular", true, None).await;
        create_check_in(&pool, athlete_id, event_id, Some("first visit"), now).await.unwrap();
        let athlete = crate::athlete::load_athlete(&pool, athlete_id).await.unwrap();
        assert_eq!(athlete.last_visited, Some(now.date()));
    }

    #[rocket::async_test]
    async fn notes_update_is_metadata_only() {
        let pool = test_pool().await;
        let now = FdDateTime::now().trimmed_to_sec();
        let event_id = seed_event(&pool, 5, now.date(), true).await;
        let athlete_id = seed_athlete(&pool, "Scribble", true, None).await;
        let detail = create_check_in(&pool, athlete_id, event_id, None, now).await.unwrap();
        assert_eq!(detail.notes, None);

        let detail = update_notes(&pool, detail.id, "left shoes at the desk").await.unwrap();
        assert_eq!(detail.notes.as_deref(), Some("left shoes at the desk"));
        let event = crate::event::load_event(&pool, event_id).await.unwrap();
        assert_eq!(event.current_capacity, 1);

        let err = update_notes(&pool, 9999, "nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[rocket::async_test]
    async fn notes_update_racing_a_reversal_is_never_transient() {
        for _ in 0..10 {
            let pool = test_pool().await;
            let now = FdDateTime::now().trimmed_to_sec();
            let event_id = seed_event(&pool, 5, now.date(), true).await;
            let athlete_id = seed_athlete(&pool, "Fickle", true, None).await;
            let detail = create_check_in(&pool, athlete_id, event_id, None, now).await.unwrap();

            let notes = {
                let pool = pool.clone();
                let check_in_id = detail.id;
                rocket::tokio::spawn(async move {
                    update_notes(&pool, check_in_id, "changed my mind").await
                })
            };
            let reversal = {
                let pool = pool.clone();
                let check_in_id = detail.id;
                rocket::tokio::spawn(async move { reverse_check_in(&pool, check_in_id, now).await })
            };
            // losing the row to the reversal is not_found, never a store error
            if let Err(err) = notes.await.unwrap() {
                assert_eq!(err.kind(), "not_found", "unexpected failure: {err}");
            }
            let _ = reversal.await.unwrap();
            let event = crate::event::load_event(&pool, event_id).await.unwrap();
            assert_eq!(event.current_capacity, checkin_count(&pool, event_id).await);
        }
    }
}
