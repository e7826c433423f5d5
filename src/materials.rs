use axum::extract::{Multipart, Path};
use axum::response::Response;
use axum::Extension;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::io::{self, Form, MATERIALS_DIR};
use crate::models::{MaterialData, MaterialType, Role};
use crate::users::Deleted;
use crate::{proceeds, AppState, Error, Payload};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MaterialView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub material: MaterialData,
    pub course_name: String,
}

/// Students only see what was assigned to them or belongs to a course
/// they are enrolled in through a batch.
const VISIBLE_MATERIALS: &str = "SELECT m.*, c.name AS course_name FROM materials m \
     JOIN courses c ON c.id = m.course_id \
     WHERE ($1::uuid IS NULL \
        OR m.id IN (SELECT material_id FROM user_materials WHERE user_id = $1) \
        OR m.course_id IN (SELECT b.course_id FROM batches b \
            JOIN batch_students bs ON bs.batch_id = b.id WHERE bs.student_id = $1))";

fn viewer(caller: &AuthUser) -> Option<Uuid> {
    (caller.role == Role::Student).then(|| caller.id)
}

async fn fetch_visible(pg: &PgPool, caller: &AuthUser, id: Uuid) -> Result<MaterialView, Error> {
    sqlx::query_as::<_, MaterialView>(&format!("{} AND m.id = $2", VISIBLE_MATERIALS))
        .bind(viewer(caller))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Material `{}` does not exist", id)))
}

pub fn parse_material_type(raw: &str) -> Result<MaterialType, Error> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "PDF" => Ok(MaterialType::Pdf),
        "PPT" => Ok(MaterialType::Ppt),
        "DOC" => Ok(MaterialType::Doc),
        "VIDEO" => Ok(MaterialType::Video),
        other => Err(Error::field(
            "type",
            format!("`{}` is not a valid choice.", other),
        )),
    }
}

/// Admins may change anything; trainers only what they uploaded.
pub fn may_modify(caller: &AuthUser, material: &MaterialData) -> Result<(), Error> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Trainer if material.uploader_id == Some(caller.id) => Ok(()),
        Role::Trainer => Err(Error::denied(
            "You can only modify materials that you uploaded.",
        )),
        Role::Student => Err(Error::denied(
            "You do not have permission to perform this action.",
        )),
    }
}

pub async fn list_materials(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<MaterialView>> {
    let materials = sqlx::query_as::<_, MaterialView>(&format!(
        "{} ORDER BY c.name, m.title",
        VISIBLE_MATERIALS
    ))
    .bind(viewer(&caller))
    .fetch_all(&pg)
    .await?;
    proceeds(materials.into())
}

pub async fn get_material(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<MaterialView> {
    proceeds(fetch_visible(&pg, &caller, id).await?)
}

pub async fn create_material(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    multipart: Multipart,
) -> Payload<MaterialView> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    let form = Form::read(multipart).await?;
    let title = form.required("title")?.to_string();
    let course = form
        .parse::<Uuid>("course")?
        .ok_or_else(|| Error::field("course", "This field is required."))?;
    let kind = parse_material_type(form.required("type")?)?;
    let duration = form.parse::<i32>("duration_in_minutes")?;
    let upload = form.file("content")?;

    let content = io::store_upload(
        &state.config.media_root,
        MATERIALS_DIR,
        &upload.file_name,
        &upload.bytes,
    )
    .await?;
    let id = Uuid::new_v4();
    let inserted = sqlx::query(
        "INSERT INTO materials (id, title, course_id, type, content, uploader_id, duration_in_minutes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(&title)
    .bind(course)
    .bind(kind)
    .bind(&content)
    .bind(caller.id)
    .bind(duration)
    .execute(&pg)
    .await;
    if let Err(err) = inserted {
        io::remove_io_file(&state.config.media_root, &content).await;
        return Err(err.into());
    }

    log::info!("{} uploaded material `{}`", caller.username, title);
    proceeds(fetch_visible(&pg, &caller, id).await?)
}

/// Multipart like creation; every field is optional and a new `content`
/// file replaces the stored one.
pub async fn update_material(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Payload<MaterialView> {
    let current = fetch_visible(&pg, &caller, id).await?;
    may_modify(&caller, &current.material)?;

    let form = Form::read(multipart).await?;
    let kind = form.text("type").map(parse_material_type).transpose()?;
    let course = form.parse::<Uuid>("course")?;
    let duration = form.parse::<i32>("duration_in_minutes")?;
    let content = match form.files.get("content").filter(|u| !u.bytes.is_empty()) {
        Some(upload) => Some(
            io::store_upload(
                &state.config.media_root,
                MATERIALS_DIR,
                &upload.file_name,
                &upload.bytes,
            )
            .await?,
        ),
        None => None,
    };

    sqlx::query(
        "UPDATE materials SET title = COALESCE($2, title), course_id = COALESCE($3, course_id), \
         type = COALESCE($4, type), content = COALESCE($5, content), \
         duration_in_minutes = COALESCE($6, duration_in_minutes) WHERE id = $1",
    )
    .bind(id)
    .bind(form.text("title"))
    .bind(course)
    .bind(kind)
    .bind(&content)
    .bind(duration)
    .execute(&pg)
    .await?;

    if content.is_some() {
        io::remove_io_file(&state.config.media_root, &current.material.content).await;
    }
    proceeds(fetch_visible(&pg, &caller, id).await?)
}

pub async fn delete_material(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    let current = fetch_visible(&pg, &caller, id).await?;
    may_modify(&caller, &current.material)?;

    sqlx::query("DELETE FROM materials WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    io::remove_io_file(&state.config.media_root, &current.material.content).await;
    proceeds(Deleted { id })
}

pub async fn view_content(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, Error> {
    let material = fetch_visible(&pg, &caller, id).await?;
    io::file_response(&state.config.media_root, &material.material.content).await
}
