//! Postgres fixtures for tests that drive the write paths.
//!
//! They run against `DATABASE_URL` and are skipped when it is not set.
//! Every fixture row gets fresh ids and emails, so tests can share one
//! database and run in parallel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::models::{Role, UserData, UNUSABLE_PASSWORD};
use crate::notify::{self, SharedNotifier};
use crate::users::insert_user;
use crate::{AppState, Error, Payload};

pub async fn database() -> Option<PgPool> {
    dotenv::dotenv().ok();
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL is not set, skipping database test");
            return None;
        }
    };
    let pg = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pg).await.unwrap();
    Some(pg)
}

pub fn state(notifier: SharedNotifier) -> AppState {
    AppState {
        config: Arc::new(Config::for_tests()),
        notifier,
    }
}

pub fn outbox() -> SharedNotifier {
    let mut config = Config::for_tests();
    config.mail_transport = crate::config::MailTransport::Outbox;
    notify::from_config(&config)
}

pub fn admin() -> AuthUser {
    AuthUser {
        id: Uuid::new_v4(),
        username: "admin@parc.test".to_string(),
        role: Role::Admin,
    }
}

pub fn unwrap_payload<T>(payload: Payload<T>) -> Result<T, Error> {
    payload?.into_result()
}

pub async fn user(pg: &PgPool, role: Role) -> UserData {
    let email = format!("{}@parc.test", Uuid::new_v4());
    let user = UserData::new("Test Person", &email, role, UNUSABLE_PASSWORD.to_string());
    insert_user(pg, &user).await.unwrap();
    user
}

pub async fn trainer(pg: &PgPool, is_active: bool, expiry: Option<DateTime<Utc>>) -> UserData {
    let mut trainer = user(pg, Role::Trainer).await;
    sqlx::query("UPDATE users SET is_active = $2, access_expiry_date = $3 WHERE id = $1")
        .bind(trainer.id)
        .bind(is_active)
        .bind(expiry)
        .execute(pg)
        .await
        .unwrap();
    trainer.is_active = is_active;
    trainer.access_expiry_date = expiry;
    trainer
}

pub async fn stored(pg: &PgPool, id: Uuid) -> UserData {
    sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_one(pg)
        .await
        .unwrap()
}

pub async fn college(pg: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO colleges (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(format!("College {}", id))
        .execute(pg)
        .await
        .unwrap();
    id
}

/// The temporary password from a credentials mail.
pub fn mailed_password(body: &str) -> String {
    body.lines()
        .find_map(|line| line.strip_prefix("Password: "))
        .unwrap()
        .to_string()
}
