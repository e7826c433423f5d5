use std::collections::HashMap;

use axum::extract::{Multipart, Path, Query};
use axum::response::Response;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::auth::{generate_password, hash_password, AuthUser};
use crate::err::Page;
use crate::io::{self, Form};
use crate::models::{split_name, Role, UserData, UNUSABLE_PASSWORD};
use crate::notify::Mail;
use crate::onboarding::{self, ExistingUsers, OnboardingReport, Target};
use crate::{breaks, proceeds, AppState, Error, Payload};

pub async fn insert_user<'e, E>(executor: E, user: &UserData) -> Result<(), Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO users (id, username, email, first_name, last_name, role, expertise, \
         experience, phone, course, college, resume, password_hash, is_active, \
         must_change_password, access_expiry_date, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(user.id)
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(user.role)
    .bind(&user.expertise)
    .bind(user.experience)
    .bind(&user.phone)
    .bind(&user.course)
    .bind(&user.college)
    .bind(&user.resume)
    .bind(&user.password_hash)
    .bind(user.is_active)
    .bind(user.must_change_password)
    .bind(user.access_expiry_date)
    .bind(user.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn fetch_user<'e, E>(executor: E, id: Uuid) -> Result<UserData, Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("User `{}` does not exist", id)))
}

pub async fn email_taken<'e, E>(executor: E, email: &str) -> Result<bool, Error>
where
    E: Executor<'e, Database = Postgres>,
{
    Ok(
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)")
            .bind(email.trim().to_lowercase())
            .fetch_one(executor)
            .await?,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: UserData,
    pub full_name: String,
    pub batches: Vec<Uuid>,
    pub assigned_materials: Vec<Uuid>,
}

fn group_by_user(pairs: Vec<(Uuid, Uuid)>) -> HashMap<Uuid, Vec<Uuid>> {
    let mut grouped: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (user, other) in pairs {
        grouped.entry(user).or_default().push(other);
    }
    grouped
}

async fn views(pg: &PgPool, users: Vec<UserData>) -> Result<Vec<UserView>, Error> {
    let ids: Vec<Uuid> = users.iter().map(|u| u.id).collect();
    let mut batches = group_by_user(
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT student_id, batch_id FROM batch_students WHERE student_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(pg)
        .await?,
    );
    let mut materials = group_by_user(
        sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT user_id, material_id FROM user_materials WHERE user_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(pg)
        .await?,
    );

    Ok(users
        .into_iter()
        .map(|user| UserView {
            full_name: user.full_name(),
            batches: batches.remove(&user.id).unwrap_or_default(),
            assigned_materials: materials.remove(&user.id).unwrap_or_default(),
            user,
        })
        .collect())
}

async fn view(pg: &PgPool, user: UserData) -> Result<UserView, Error> {
    views(pg, vec![user])
        .await?
        .pop()
        .ok_or_else(|| Error::unknown("user view went missing"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserFilter {
    pub role: Option<Role>,
}

pub async fn list_users(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<UserFilter>,
) -> Payload<Page<UserView>> {
    let users = if caller.role == Role::Student {
        vec![fetch_user(&pg, caller.id).await?]
    } else {
        sqlx::query_as::<_, UserData>(
            "SELECT * FROM users WHERE $1::user_role IS NULL OR role = $1 ORDER BY created_at",
        )
        .bind(filter.role)
        .fetch_all(&pg)
        .await?
    };
    proceeds(views(&pg, users).await?.into())
}

pub async fn get_user(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<UserView> {
    if caller.role == Role::Student && caller.id != id {
        return breaks(Error::denied("Students may only view their own account."));
    }
    let user = fetch_user(&pg, id).await?;
    proceeds(view(&pg, user).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub expertise: Option<String>,
    pub experience: Option<i32>,
    pub phone: Option<String>,
    pub course: Option<String>,
    pub college: Option<String>,
    #[serde(default)]
    pub batches: Vec<Uuid>,
}

/// Trainers start locked out until their first schedule; everybody else
/// gets a temporary password that must be changed at first login.
pub async fn create_user(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateUser>,
) -> Payload<UserView> {
    caller.require_admin()?;
    if body.name.trim().is_empty() {
        return breaks(Error::field("name", "This field is required."));
    }
    if !body.email.contains('@') {
        return breaks(Error::field("email", "Enter a valid email address."));
    }
    if email_taken(&pg, &body.email).await? {
        return breaks(Error::field(
            "email",
            "A user with this email already exists.",
        ));
    }

    let password = match body.role {
        Role::Trainer => None,
        Role::Admin | Role::Student => Some(generate_password()),
    };
    let password_hash = match &password {
        Some(password) => hash_password(password)?,
        None => UNUSABLE_PASSWORD.to_string(),
    };

    let mut user = UserData::new(&body.name, &body.email, body.role, password_hash);
    user.expertise = body.expertise;
    user.experience = body.experience;
    user.phone = body.phone;
    user.course = body.course;
    user.college = body.college;
    user.is_active = body.role != Role::Trainer;
    user.must_change_password = password.is_some();

    let mut tx = pg.begin().await?;
    insert_user(&mut tx, &user).await?;
    if !body.batches.is_empty() {
        sqlx::query(
            "INSERT INTO batch_students (batch_id, student_id) \
             SELECT batch, $1 FROM UNNEST($2::uuid[]) AS batch",
        )
        .bind(user.id)
        .bind(&body.batches)
        .execute(&mut tx)
        .await?;
    }
    if let Some(password) = &password {
        state
            .notifier
            .send(
                &mut tx,
                &Mail::student_credentials(&user.first_name, &user.email, password),
            )
            .await?;
    }
    tx.commit().await?;

    log::info!("created {:?} account {}", user.role, user.email);
    proceeds(view(&pg, user).await?)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub expertise: Option<String>,
    pub experience: Option<i32>,
    pub phone: Option<String>,
    pub course: Option<String>,
    pub college: Option<String>,
    pub is_active: Option<bool>,
    pub batches: Option<Vec<Uuid>>,
}

impl UpdateUser {
    /// Fields only an administrator may change.
    fn touches_admin_fields(&self) -> bool {
        self.email.is_some()
            || self.role.is_some()
            || self.course.is_some()
            || self.college.is_some()
            || self.is_active.is_some()
            || self.batches.is_some()
    }
}

pub async fn update_user(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUser>,
) -> Payload<UserView> {
    if !caller.is_admin() {
        if caller.id != id {
            return breaks(Error::denied("You may only edit your own profile."));
        }
        if body.touches_admin_fields() {
            return breaks(Error::denied(
                "Only an administrator can change these fields.",
            ));
        }
    }

    let (first_name, last_name) = match body.name.as_deref().map(split_name) {
        Some((first, last)) => (Some(first), Some(last)),
        None => (None, None),
    };
    let email = body.email.as_deref().map(|e| e.trim().to_lowercase());

    let mut tx = pg.begin().await?;
    let user = sqlx::query_as::<_, UserData>(
        "UPDATE users SET first_name = COALESCE($2, first_name), \
         last_name = COALESCE($3, last_name), \
         email = COALESCE($4, email), username = COALESCE($4, username), \
         role = COALESCE($5, role), expertise = COALESCE($6, expertise), \
         experience = COALESCE($7, experience), phone = COALESCE($8, phone), \
         course = COALESCE($9, course), college = COALESCE($10, college), \
         is_active = COALESCE($11, is_active) \
         WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(body.role)
    .bind(body.expertise)
    .bind(body.experience)
    .bind(body.phone)
    .bind(body.course)
    .bind(body.college)
    .bind(body.is_active)
    .fetch_optional(&mut tx)
    .await?
    .ok_or_else(|| Error::not_found(format!("User `{}` does not exist", id)))?;

    if let Some(batches) = &body.batches {
        sqlx::query("DELETE FROM batch_students WHERE student_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        sqlx::query(
            "INSERT INTO batch_students (batch_id, student_id) \
             SELECT batch, $1 FROM UNNEST($2::uuid[]) AS batch",
        )
        .bind(id)
        .bind(batches)
        .execute(&mut tx)
        .await?;
    }
    tx.commit().await?;

    proceeds(view(&pg, user).await?)
}

#[derive(Debug, Clone, Serialize)]
pub struct Deleted {
    pub id: Uuid,
}

pub async fn delete_user(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let resume = sqlx::query_scalar::<_, Option<String>>(
        "DELETE FROM users WHERE id = $1 RETURNING resume",
    )
    .bind(id)
    .fetch_optional(&pg)
    .await?;

    match resume {
        None => breaks(Error::not_found(format!("User `{}` does not exist", id))),
        Some(resume) => {
            if let Some(path) = resume {
                io::remove_io_file(&state.config.media_root, &path).await;
            }
            proceeds(Deleted { id })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignMaterials {
    #[serde(default)]
    pub material_ids: Vec<Uuid>,
}

/// Replaces the student's assigned materials with exactly `material_ids`.
pub async fn assign_materials(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<AssignMaterials>,
) -> Payload<UserView> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    let user = fetch_user(&pg, id).await?;
    if user.role != Role::Student {
        return breaks(Error::invalid("Can only assign materials to students."));
    }

    let mut ids = body.material_ids;
    ids.sort();
    ids.dedup();
    let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM materials WHERE id = ANY($1)")
        .bind(&ids)
        .fetch_one(&pg)
        .await?;
    if known != ids.len() as i64 {
        return breaks(Error::invalid("One or more material IDs are invalid."));
    }

    let mut tx = pg.begin().await?;
    sqlx::query("DELETE FROM user_materials WHERE user_id = $1")
        .bind(id)
        .execute(&mut tx)
        .await?;
    sqlx::query(
        "INSERT INTO user_materials (user_id, material_id) \
         SELECT $1, material FROM UNNEST($2::uuid[]) AS material",
    )
    .bind(id)
    .bind(&ids)
    .execute(&mut tx)
    .await?;
    tx.commit().await?;

    proceeds(view(&pg, user).await?)
}

pub async fn view_resume(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, Error> {
    if caller.role == Role::Student && caller.id != id {
        return Err(Error::denied("Students may only view their own account."));
    }
    let user = fetch_user(&pg, id).await?;
    match user.resume {
        Some(path) => io::file_response(&state.config.media_root, &path).await,
        None => Err(Error::not_found("Resume not found for this user.")),
    }
}

pub async fn bulk_create_students(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    multipart: Multipart,
) -> Payload<OnboardingReport> {
    caller.require_admin()?;
    let form = Form::read(multipart).await?;
    let roster = onboarding::parse_roster(&form.file("file")?.bytes)?;

    let batch_id = form.parse::<Uuid>("batch")?;
    let course = match batch_id {
        Some(batch_id) => Some(
            sqlx::query_scalar::<_, String>(
                "SELECT c.name FROM batches b JOIN courses c ON c.id = b.course_id WHERE b.id = $1",
            )
            .bind(batch_id)
            .fetch_optional(&pg)
            .await?
            .ok_or_else(|| Error::field("batch", format!("Batch `{}` does not exist", batch_id)))?,
        ),
        None => None,
    };
    let target = Target {
        batch_id,
        college: form.text("college").map(str::to_string),
        course,
        strict: false,
    };

    let report = onboarding::onboard(
        &pg,
        state.notifier.as_ref(),
        roster,
        ExistingUsers::Skip,
        &target,
    )
    .await?;
    proceeds(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memberships_group_per_user() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let grouped = group_by_user(vec![(a, x), (b, y), (a, y)]);
        assert_eq!(grouped[&a], vec![x, y]);
        assert_eq!(grouped[&b], vec![y]);
    }

    #[test]
    fn self_service_edits_are_limited() {
        let own = UpdateUser {
            name: Some("New Name".into()),
            phone: Some("555".into()),
            ..UpdateUser::default()
        };
        assert!(!own.touches_admin_fields());

        let escalate = UpdateUser {
            role: Some(Role::Admin),
            ..UpdateUser::default()
        };
        assert!(escalate.touches_admin_fields());
    }

    #[test]
    fn user_view_hides_the_hash_and_flattens() {
        let user = UserData::new("Ada Lovelace", "ada@example.com", Role::Student, "secret".into());
        let json = serde_json::to_value(UserView {
            full_name: user.full_name(),
            batches: vec![],
            assigned_materials: vec![],
            user,
        })
        .unwrap();
        assert_eq!(json["email"], "ada@example.com");
        assert_eq!(json["full_name"], "Ada Lovelace");
        assert_eq!(json["role"], "STUDENT");
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn create_payload_defaults_batches() {
        let body: CreateUser = serde_json::from_str(
            r#"{"name": "Sam", "email": "sam@example.com", "role": "STUDENT"}"#,
        )
        .unwrap();
        assert!(body.batches.is_empty());
        assert_eq!(body.role, Role::Student);
    }
}
