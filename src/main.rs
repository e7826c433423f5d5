pub mod applications;
pub mod assessments;
pub mod auth;
pub mod batches;
pub mod bills;
pub mod colleges;
pub mod config;
pub mod courses;
pub mod err;
pub mod io;
pub mod lifecycle;
pub mod materials;
pub mod models;
pub mod notify;
pub mod onboarding;
pub mod reporting;
pub mod schedules;
#[cfg(test)]
mod testing;
pub mod users;

use std::sync::Arc;

use axum::handler::Handler;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::notify::SharedNotifier;

pub type Payload<T> = Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}

/// Shared, cheaply cloned request context.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub notifier: SharedNotifier,
}

pub fn app(pg: PgPool, state: AppState) -> Router {
    Router::new()
        .route("/token", post(auth::login))
        .route("/auth/set-password", post(auth::set_password))
        .route("/users", get(users::list_users).post(users::create_user))
        .route(
            "/users/bulk_create_students",
            post(users::bulk_create_students),
        )
        .route(
            "/users/:id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/users/:id/assign_materials", post(users::assign_materials))
        .route("/users/:id/view_resume", get(users::view_resume))
        .route(
            "/colleges",
            get(colleges::list_colleges).post(colleges::create_college),
        )
        .route(
            "/colleges/:id",
            get(colleges::get_college)
                .patch(colleges::update_college)
                .delete(colleges::delete_college),
        )
        .route(
            "/courses",
            get(courses::list_courses).post(courses::create_course),
        )
        .route(
            "/courses/:id",
            get(courses::get_course)
                .patch(courses::update_course)
                .delete(courses::delete_course),
        )
        .route(
            "/batches",
            get(batches::list_batches).post(batches::create_batch),
        )
        .route(
            "/batches/create_with_students",
            post(batches::create_with_students),
        )
        .route(
            "/batches/:id",
            get(batches::get_batch)
                .patch(batches::update_batch)
                .delete(batches::delete_batch),
        )
        .route("/batches/:id/add_students", post(batches::add_students))
        .route(
            "/batches/:id/remove_students",
            post(batches::remove_students),
        )
        .route(
            "/batches/:id/add_students_from_file",
            post(batches::add_students_from_file),
        )
        .route(
            "/materials",
            get(materials::list_materials).post(materials::create_material),
        )
        .route(
            "/materials/:id",
            get(materials::get_material)
                .patch(materials::update_material)
                .delete(materials::delete_material),
        )
        .route("/materials/:id/view_content", get(materials::view_content))
        .route(
            "/schedules",
            get(schedules::list_schedules).post(schedules::create_schedule),
        )
        .route(
            "/schedules/:id",
            get(schedules::get_schedule)
                .patch(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route(
            "/applications",
            get(applications::list_applications).post(applications::submit_application),
        )
        .route("/applications/:id", get(applications::get_application))
        .route("/applications/:id/approve", post(applications::approve))
        .route("/applications/:id/decline", post(applications::decline))
        .route(
            "/applications/:id/view_resume",
            get(applications::view_resume),
        )
        .route("/bills", get(bills::list_bills).post(bills::create_bill))
        .route(
            "/bills/:id",
            get(bills::get_bill).delete(bills::delete_bill),
        )
        .route("/bills/:id/mark_as_paid", post(bills::mark_as_paid))
        .route(
            "/assessments",
            get(assessments::list_assessments).post(assessments::create_assessment),
        )
        .route(
            "/assessments/:id",
            get(assessments::get_assessment)
                .patch(assessments::update_assessment)
                .delete(assessments::delete_assessment),
        )
        .route(
            "/attempts",
            get(assessments::list_attempts).post(assessments::record_attempt),
        )
        .route(
            "/attempts/:id",
            get(assessments::get_attempt).delete(assessments::delete_attempt),
        )
        .route("/reporting", get(reporting::dashboard))
        .fallback(err::handler404.into_service())
        .layer(Extension(pg))
        .layer(Extension(state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load()?;
    io::prepare_io(&config.media_root).await?;

    let pg = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pg).await?;

    let state = AppState {
        notifier: notify::from_config(&config),
        config: Arc::new(config),
    };
    let addr = state.config.bind_addr;
    let app = app(pg, state);

    log::info!("Starting Parc HTTP Server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
