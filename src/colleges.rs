use std::collections::HashMap;

use axum::extract::Path;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::models::{CollegeData, CourseData};
use crate::users::Deleted;
use crate::{breaks, proceeds, Error, Payload};

#[derive(Debug, Clone, Serialize)]
pub struct CollegeView {
    #[serde(flatten)]
    pub college: CollegeData,
    pub courses: Vec<CourseData>,
}

#[derive(sqlx::FromRow)]
struct LinkedCourse {
    college_id: Uuid,
    #[sqlx(flatten)]
    course: CourseData,
}

async fn views(pg: &PgPool, colleges: Vec<CollegeData>) -> Result<Vec<CollegeView>, Error> {
    let ids: Vec<Uuid> = colleges.iter().map(|c| c.id).collect();
    let links = sqlx::query_as::<_, LinkedCourse>(
        "SELECT cc.college_id, c.* FROM college_courses cc \
         JOIN courses c ON c.id = cc.course_id \
         WHERE cc.college_id = ANY($1) ORDER BY c.name",
    )
    .bind(&ids)
    .fetch_all(pg)
    .await?;

    let mut courses: HashMap<Uuid, Vec<CourseData>> = HashMap::new();
    for link in links {
        courses.entry(link.college_id).or_default().push(link.course);
    }
    Ok(colleges
        .into_iter()
        .map(|college| CollegeView {
            courses: courses.remove(&college.id).unwrap_or_default(),
            college,
        })
        .collect())
}

async fn fetch_college(pg: &PgPool, id: Uuid) -> Result<CollegeData, Error> {
    sqlx::query_as::<_, CollegeData>("SELECT * FROM colleges WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("College `{}` does not exist", id)))
}

async fn link_courses(
    tx: &mut Transaction<'_, Postgres>,
    college_id: Uuid,
    course_ids: &[Uuid],
) -> Result<(), Error> {
    sqlx::query("DELETE FROM college_courses WHERE college_id = $1")
        .bind(college_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO college_courses (college_id, course_id) \
         SELECT $1, course FROM UNNEST($2::uuid[]) AS course ON CONFLICT DO NOTHING",
    )
    .bind(college_id)
    .bind(course_ids)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

pub async fn list_colleges(
    _caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<CollegeView>> {
    let colleges = sqlx::query_as::<_, CollegeData>("SELECT * FROM colleges ORDER BY name")
        .fetch_all(&pg)
        .await?;
    proceeds(views(&pg, colleges).await?.into())
}

pub async fn get_college(
    _caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<CollegeView> {
    let college = fetch_college(&pg, id).await?;
    let mut found = views(&pg, vec![college]).await?;
    match found.pop() {
        Some(view) => proceeds(view),
        None => breaks(Error::not_found(format!("College `{}` does not exist", id))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCollege {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub contact_person: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub contact_phone: String,
    #[serde(default)]
    pub course_ids: Vec<Uuid>,
}

pub async fn create_college(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateCollege>,
) -> Payload<CollegeView> {
    caller.require_admin()?;
    if body.name.trim().is_empty() {
        return breaks(Error::field("name", "This field is required."));
    }

    let mut tx = pg.begin().await?;
    let college = sqlx::query_as::<_, CollegeData>(
        "INSERT INTO colleges (id, name, address, contact_person, contact_email, contact_phone) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(body.name.trim())
    .bind(&body.address)
    .bind(&body.contact_person)
    .bind(&body.contact_email)
    .bind(&body.contact_phone)
    .fetch_one(&mut tx)
    .await?;
    link_courses(&mut tx, college.id, &body.course_ids).await?;
    tx.commit().await?;

    get_college(caller, Extension(pg), Path(college.id)).await
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCollege {
    pub name: Option<String>,
    pub address: Option<String>,
    pub contact_person: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub course_ids: Option<Vec<Uuid>>,
}

pub async fn update_college(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateCollege>,
) -> Payload<CollegeView> {
    caller.require_admin()?;

    let mut tx = pg.begin().await?;
    let res = sqlx::query(
        "UPDATE colleges SET name = COALESCE($2, name), address = COALESCE($3, address), \
         contact_person = COALESCE($4, contact_person), \
         contact_email = COALESCE($5, contact_email), \
         contact_phone = COALESCE($6, contact_phone) WHERE id = $1",
    )
    .bind(id)
    .bind(body.name.as_deref().map(str::trim))
    .bind(&body.address)
    .bind(&body.contact_person)
    .bind(&body.contact_email)
    .bind(&body.contact_phone)
    .execute(&mut tx)
    .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("College `{}` does not exist", id)));
    }
    if let Some(course_ids) = &body.course_ids {
        link_courses(&mut tx, id, course_ids).await?;
    }
    tx.commit().await?;

    get_college(caller, Extension(pg), Path(id)).await
}

pub async fn delete_college(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM colleges WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("College `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_fields_default_to_blank() {
        let body: CreateCollege = serde_json::from_str(r#"{"name": "North Campus"}"#).unwrap();
        assert_eq!(body.address, "");
        assert!(body.course_ids.is_empty());
    }

    #[test]
    fn college_view_nests_courses() {
        let view = CollegeView {
            college: CollegeData {
                id: Uuid::new_v4(),
                name: "North Campus".into(),
                address: String::new(),
                contact_person: "Dean".into(),
                contact_email: "dean@example.com".into(),
                contact_phone: String::new(),
            },
            courses: vec![CourseData {
                id: Uuid::new_v4(),
                name: "Rust".into(),
                description: String::new(),
                cover_photo: None,
            }],
        };
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["name"], "North Campus");
        assert_eq!(json["courses"][0]["name"], "Rust");
    }
}
