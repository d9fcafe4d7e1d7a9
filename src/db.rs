use log::{error, info};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[cfg(test)]
use sqlx::sqlite::SqlitePool;

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations"); // Auto-discovers migrations in `db/migrations/`

pub struct DbPool(pub sqlx::SqlitePool);

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite | Kind::Liftoff,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (database_url, max_connections) = if cfg!(test) {
            // in-memory SQLite is per-connection, keep the pool at one
            ("sqlite::memory:".to_string(), 1)
        } else {
            let figment = rocket.figment();
            let database_url = figment.extract_inner::<String>("database_url").expect("database_url");
            if database_url.starts_with("sqlite://") {
                let db_path = database_url.trim_start_matches("sqlite://");
                if !Path::new(db_path).exists() {
                    std::fs::File::create(db_path).expect("Failed to create SQLite database file");
                }
            }
            (database_url, 5)
        };

        info!("Opening database: {database_url}");
        let opts = SqliteConnectOptions::from_str(&database_url).expect("valid sqlite url")
            .journal_mode(SqliteJournalMode::Wal) // use WAL for better concurrency
            .busy_timeout(Duration::from_secs(5)) // concurrent writers queue instead of failing
            .foreign_keys(true);
        let pool = match SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        Ok(rocket.manage(DbPool(pool)))
    }
}

/// File-backed pool for tests that exercise real writer concurrency;
/// `sqlite::memory:` cannot be shared between pooled connections.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let path = std::env::temp_dir().join(format!(
        "frontdesk-test-{}.sqlite",
        crate::auth::generate_random_string(12)
    ));
    let opts = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();
    pool
}
