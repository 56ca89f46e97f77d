#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod clock;
mod config;
mod db;
mod env;
mod error;
mod models;
mod telemetry;
#[cfg(test)]
mod test;
mod upload;
mod validation;

use std::sync::Arc;

use api::{
    api_active_reading_session, api_change_password, api_create_book, api_dashboard_stats,
    api_end_reading_session, api_get_book, api_get_pending_users, api_login, api_me,
    api_register_user, api_reset_password, api_security_question, api_set_approval,
    api_start_reading_session, api_student_dashboard, api_update_progress, health,
};
use auth::{ApprovalStatus, Role, forbidden_api, unauthorized_api};
use clock::{Clock, SystemClock};
use config::AppConfig;
use db::{NewUser, admin_exists, create_user};
use error::AppError;
use rocket::data::{Limits, ToByteUnit};
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use sqlx::SqlitePool;
use telemetry::{TelemetryFairing, init_tracing, shutdown_telemetry};
use thiserror::Error;
use tracing::{error, info};
use upload::api_upload;
use validation::{bad_request_api, not_found_api, unprocessable_api};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Figment(#[from] rocket::figment::Error),
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

#[launch]
async fn rocket() -> _ {
    if let Err(e) = env::load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }

    init_tracing();

    match build().await {
        Ok(rocket) => rocket,
        Err(e) => {
            error!("Startup failed: {}", e);
            panic!("Startup failed: {}", e);
        }
    }
}

async fn build() -> Result<Rocket<Build>, Error> {
    let config = AppConfig::from_env()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://reading-tracker.db?mode=rwc".to_string());

    let pool = SqlitePool::connect(&database_url).await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed successfully");

    bootstrap_admin(&pool, &config).await?;

    Ok(init_rocket(pool, config, Arc::new(SystemClock)).await)
}

/// Creates the configured admin account if the database has none yet.
async fn bootstrap_admin(pool: &SqlitePool, config: &AppConfig) -> Result<(), AppError> {
    let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password) else {
        return Ok(());
    };

    if admin_exists(pool).await? {
        return Ok(());
    }

    create_user(
        pool,
        NewUser {
            username,
            password,
            role: Role::Admin,
            display_name: Some("Administrator"),
            approval_status: ApprovalStatus::Approved,
            security_question: None,
            security_answer: None,
        },
        config.bcrypt_cost,
    )
    .await?;

    info!(username = %username, "Bootstrapped admin account");
    Ok(())
}

pub async fn init_rocket(
    pool: SqlitePool,
    config: AppConfig,
    clock: Arc<dyn Clock>,
) -> Rocket<Build> {
    info!("Starting reading tracker");

    let limits = Limits::default().limit("file", config.max_upload_mib.mebibytes());
    let figment = rocket::Config::figment().merge(("limits", limits));

    rocket::custom(figment)
        .manage(pool)
        .manage(config)
        .manage(clock)
        .mount(
            "/api",
            routes![
                api_login,
                api_me,
                api_register_user,
                api_change_password,
                api_security_question,
                api_reset_password,
                api_get_pending_users,
                api_set_approval,
                api_create_book,
                api_get_book,
                api_start_reading_session,
                api_end_reading_session,
                api_active_reading_session,
                api_update_progress,
                api_student_dashboard,
                api_dashboard_stats,
                api_upload,
                health,
            ],
        )
        .register(
            "/api",
            catchers![
                bad_request_api,
                unauthorized_api,
                forbidden_api,
                not_found_api,
                unprocessable_api
            ],
        )
        .attach(TelemetryFairing)
        .attach(AdHoc::on_shutdown("Telemetry shutdown", |_| {
            Box::pin(async move { shutdown_telemetry() })
        }))
}
