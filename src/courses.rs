use axum::extract::Path;
use axum::{Extension, Json};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::models::CourseData;
use crate::users::Deleted;
use crate::{breaks, proceeds, Error, Payload};

pub async fn fetch_course(pg: &PgPool, id: Uuid) -> Result<CourseData, Error> {
    sqlx::query_as::<_, CourseData>("SELECT * FROM courses WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Course `{}` does not exist", id)))
}

pub async fn list_courses(
    _caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<CourseData>> {
    let courses = sqlx::query_as::<_, CourseData>("SELECT * FROM courses ORDER BY name")
        .fetch_all(&pg)
        .await?;
    proceeds(courses.into())
}

pub async fn get_course(
    _caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<CourseData> {
    proceeds(fetch_course(&pg, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCourse {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cover_photo: Option<String>,
}

pub async fn create_course(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateCourse>,
) -> Payload<CourseData> {
    caller.require_admin()?;
    if body.name.trim().is_empty() {
        return breaks(Error::field("name", "This field is required."));
    }
    let course = sqlx::query_as::<_, CourseData>(
        "INSERT INTO courses (id, name, description, cover_photo) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(body.name.trim())
    .bind(&body.description)
    .bind(&body.cover_photo)
    .fetch_one(&pg)
    .await?;
    proceeds(course)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCourse {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cover_photo: Option<String>,
}

pub async fn update_course(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateCourse>,
) -> Payload<CourseData> {
    caller.require_admin()?;
    let course = sqlx::query_as::<_, CourseData>(
        "UPDATE courses SET name = COALESCE($2, name), description = COALESCE($3, description), \
         cover_photo = COALESCE($4, cover_photo) WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(body.name.as_deref().map(str::trim))
    .bind(&body.description)
    .bind(&body.cover_photo)
    .fetch_optional(&pg)
    .await?;
    match course {
        Some(course) => proceeds(course),
        None => breaks(Error::not_found(format!("Course `{}` does not exist", id))),
    }
}

pub async fn delete_course(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM courses WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Course `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}
