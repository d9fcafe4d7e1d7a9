#[macro_use] extern crate rocket;

use log::info;
use rocket::serde::json::Json;
use serde::Serialize;
use crate::db::DbPoolFairing;

mod athlete;
mod auth;
mod checkin;
mod db;
mod error;
mod event;
mod fdatetime;
mod stats;

pub struct AppConfig {
    pub admin_token: String,
}

#[derive(Serialize, Debug)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[get("/api/status")]
fn get_status() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(DbPoolFairing())
        .mount("/", routes![get_status]);
    let admin_token = rocket
        .figment()
        .extract_inner::<String>("admin_token")
        .ok()
        .unwrap_or_else(|| {
            let token = auth::generate_random_string(16);
            info!("admin_token not configured, using one-off token: {token}");
            token
        });
    let rocket = athlete::extend(rocket);
    let rocket = event::extend(rocket);
    let rocket = checkin::extend(rocket);
    let rocket = stats::extend(rocket);
    rocket.manage(AppConfig { admin_token })
}
