use axum::extract::{Multipart, Path};
use axum::response::Response;
use axum::Extension;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::io::{self, Form, RESUMES_DIR};
use crate::models::{ApplicationData, ApplicationStatus, Role, UserData, UNUSABLE_PASSWORD};
use crate::notify::Mail;
use crate::users::{email_taken, insert_user};
use crate::{breaks, proceeds, AppState, Error, Payload};

async fn fetch_application(pg: &PgPool, id: Uuid) -> Result<ApplicationData, Error> {
    sqlx::query_as::<_, ApplicationData>("SELECT * FROM trainer_applications WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Application `{}` does not exist", id)))
}

/// Only pending applications can be decided on.
async fn lock_pending(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<ApplicationData, Error> {
    sqlx::query_as::<_, ApplicationData>(
        "SELECT * FROM trainer_applications WHERE id = $1 AND status = 'PENDING' FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::not_found(format!("No pending application `{}`", id)))
}

async fn set_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: ApplicationStatus,
) -> Result<(), Error> {
    sqlx::query("UPDATE trainer_applications SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(&mut *tx)
        .await?;
    Ok(())
}

/// The account an approved applicant receives: a trainer that cannot log
/// in until the first schedule issues credentials.
pub fn trainer_from_application(application: &ApplicationData) -> UserData {
    let mut trainer = UserData::new(
        &application.name,
        &application.email,
        Role::Trainer,
        UNUSABLE_PASSWORD.to_string(),
    );
    trainer.phone = Some(application.phone.clone());
    trainer.expertise = Some(application.expertise_domains.clone());
    trainer.experience = Some(application.experience);
    trainer.resume = application.resume.clone();
    trainer.is_active = false;
    trainer
}

pub async fn list_applications(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<ApplicationData>> {
    caller.require_admin()?;
    let applications = sqlx::query_as::<_, ApplicationData>(
        "SELECT * FROM trainer_applications WHERE status = 'PENDING' ORDER BY submitted_at",
    )
    .fetch_all(&pg)
    .await?;
    proceeds(applications.into())
}

pub async fn get_application(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<ApplicationData> {
    caller.require_admin()?;
    proceeds(fetch_application(&pg, id).await?)
}

/// Public endpoint used by the "become a trainer" form.
pub async fn submit_application(
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    multipart: Multipart,
) -> Payload<ApplicationData> {
    let form = Form::read(multipart).await?;
    let name = form.required("name")?;
    let email = form.required("email")?.to_lowercase();
    if !email.contains('@') {
        return breaks(Error::field("email", "Enter a valid email address."));
    }
    let phone = form.required("phone")?;
    let experience = form
        .parse::<i32>("experience")?
        .ok_or_else(|| Error::field("experience", "This field is required."))?;
    if experience < 0 {
        return breaks(Error::field(
            "experience",
            "Ensure this value is greater than or equal to 0.",
        ));
    }
    let tech_stack = form.required("tech_stack")?;
    let expertise_domains = form.required("expertise_domains")?;
    let upload = form.file("resume")?;

    let resume = io::store_upload(
        &state.config.media_root,
        RESUMES_DIR,
        &upload.file_name,
        &upload.bytes,
    )
    .await?;
    let inserted = sqlx::query_as::<_, ApplicationData>(
        "INSERT INTO trainer_applications \
         (id, name, email, phone, experience, tech_stack, expertise_domains, resume) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(&email)
    .bind(phone)
    .bind(experience)
    .bind(tech_stack)
    .bind(expertise_domains)
    .bind(&resume)
    .fetch_one(&pg)
    .await;

    match inserted {
        Ok(application) => {
            log::info!("trainer application received from {}", application.email);
            proceeds(application)
        }
        Err(err) => {
            io::remove_io_file(&state.config.media_root, &resume).await;
            breaks(err.into())
        }
    }
}

pub async fn approve(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Payload<UserData> {
    caller.require_admin()?;

    let mut tx = pg.begin().await?;
    let application = lock_pending(&mut tx, id).await?;
    if email_taken(&mut tx, &application.email).await? {
        return breaks(Error::invalid("A user with this email already exists."));
    }

    let trainer = trainer_from_application(&application);
    insert_user(&mut tx, &trainer).await?;
    set_status(&mut tx, id, ApplicationStatus::Approved).await?;
    state
        .notifier
        .send(&mut tx, &Mail::application_approved(&trainer.first_name, &trainer.email))
        .await?;
    tx.commit().await?;

    log::info!("application {} approved, trainer {} created", id, trainer.email);
    proceeds(trainer)
}

pub async fn decline(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Payload<ApplicationData> {
    caller.require_admin()?;

    let mut tx = pg.begin().await?;
    let mut application = lock_pending(&mut tx, id).await?;
    set_status(&mut tx, id, ApplicationStatus::Declined).await?;
    state
        .notifier
        .send(&mut tx, &Mail::application_declined(&application.name, &application.email))
        .await?;
    tx.commit().await?;

    log::info!("application {} from {} declined", id, application.email);
    application.status = ApplicationStatus::Declined;
    proceeds(application)
}

pub async fn view_resume(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, Error> {
    caller.require_admin()?;
    let application = fetch_application(&pg, id).await?;
    match application.resume {
        Some(path) => io::file_response(&state.config.media_root, &path).await,
        None => Err(Error::not_found("Resume not found.")),
    }
}
