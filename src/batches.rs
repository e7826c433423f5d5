use axum::extract::{Multipart, Path};
use axum::{Extension, Json};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::io::Form;
use crate::models::{BatchData, Role};
use crate::onboarding::{self, ExistingUsers, OnboardingReport, Target};
use crate::users::Deleted;
use crate::{breaks, proceeds, AppState, Error, Payload};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BatchView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub batch: BatchData,
    pub course_name: String,
    pub college_name: Option<String>,
    pub student_count: i64,
}

const BATCH_VIEW_SELECT: &str = "SELECT b.*, c.name AS course_name, col.name AS college_name, \
     (SELECT COUNT(*) FROM batch_students bs WHERE bs.batch_id = b.id) AS student_count \
     FROM batches b \
     JOIN courses c ON c.id = b.course_id \
     LEFT JOIN colleges col ON col.id = b.college_id";

async fn fetch_view(pg: &PgPool, id: Uuid) -> Result<BatchView, Error> {
    sqlx::query_as::<_, BatchView>(&format!("{} WHERE b.id = $1", BATCH_VIEW_SELECT))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Batch `{}` does not exist", id)))
}

pub async fn list_batches(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<BatchView>> {
    let member = (caller.role == Role::Student).then(|| caller.id);
    let batches = sqlx::query_as::<_, BatchView>(&format!(
        "{} WHERE $1::uuid IS NULL \
         OR b.id IN (SELECT batch_id FROM batch_students WHERE student_id = $1) \
         ORDER BY b.start_date DESC, b.name",
        BATCH_VIEW_SELECT
    ))
    .bind(member)
    .fetch_all(&pg)
    .await?;
    proceeds(batches.into())
}

pub async fn get_batch(
    _caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<BatchView> {
    proceeds(fetch_view(&pg, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBatch {
    pub course: Uuid,
    pub college: Option<Uuid>,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

async fn insert_batch(pg: &PgPool, body: &CreateBatch) -> Result<Uuid, Error> {
    if body.name.trim().is_empty() {
        return Err(Error::field("name", "This field is required."));
    }
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO batches (id, course_id, college_id, name, start_date, end_date) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(body.course)
    .bind(body.college)
    .bind(body.name.trim())
    .bind(body.start_date)
    .bind(body.end_date)
    .execute(pg)
    .await?;
    Ok(id)
}

pub async fn create_batch(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateBatch>,
) -> Payload<BatchView> {
    caller.require_admin()?;
    let id = insert_batch(&pg, &body).await?;
    proceeds(fetch_view(&pg, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBatch {
    pub course: Option<Uuid>,
    pub college: Option<Uuid>,
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

pub async fn update_batch(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateBatch>,
) -> Payload<BatchView> {
    caller.require_admin()?;
    let res = sqlx::query(
        "UPDATE batches SET course_id = COALESCE($2, course_id), \
         college_id = COALESCE($3, college_id), name = COALESCE($4, name), \
         start_date = COALESCE($5, start_date), end_date = COALESCE($6, end_date) \
         WHERE id = $1",
    )
    .bind(id)
    .bind(body.course)
    .bind(body.college)
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.start_date)
    .bind(body.end_date)
    .execute(&pg)
    .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Batch `{}` does not exist", id)));
    }
    proceeds(fetch_view(&pg, id).await?)
}

pub async fn delete_batch(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM batches WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Batch `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudentIds {
    #[serde(default)]
    pub student_ids: Vec<Uuid>,
}

impl StudentIds {
    fn distinct(mut self) -> Vec<Uuid> {
        self.student_ids.sort();
        self.student_ids.dedup();
        self.student_ids
    }
}

pub async fn add_students(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<StudentIds>,
) -> Payload<BatchView> {
    caller.require_admin()?;
    fetch_view(&pg, id).await?;

    let ids = body.distinct();
    let students = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM users WHERE id = ANY($1) AND role = 'STUDENT'",
    )
    .bind(&ids)
    .fetch_one(&pg)
    .await?;
    if students != ids.len() as i64 {
        return breaks(Error::invalid("One or more student IDs are invalid."));
    }

    sqlx::query(
        "INSERT INTO batch_students (batch_id, student_id) \
         SELECT $1, student FROM UNNEST($2::uuid[]) AS student ON CONFLICT DO NOTHING",
    )
    .bind(id)
    .bind(&ids)
    .execute(&pg)
    .await?;
    proceeds(fetch_view(&pg, id).await?)
}

pub async fn remove_students(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<StudentIds>,
) -> Payload<BatchView> {
    caller.require_admin()?;
    fetch_view(&pg, id).await?;
    sqlx::query("DELETE FROM batch_students WHERE batch_id = $1 AND student_id = ANY($2)")
        .bind(id)
        .bind(body.distinct())
        .execute(&pg)
        .await?;
    proceeds(fetch_view(&pg, id).await?)
}

/// Students named in the file join the batch; unknown emails get accounts.
pub async fn add_students_from_file(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Payload<OnboardingReport> {
    caller.require_admin()?;
    let batch = fetch_view(&pg, id).await?;
    let form = Form::read(multipart).await?;
    let roster = onboarding::parse_roster(&form.file("file")?.bytes)?;

    let target = Target {
        batch_id: Some(batch.batch.id),
        college: batch.college_name,
        course: Some(batch.course_name),
        strict: false,
    };
    let report = onboarding::onboard(
        &pg,
        state.notifier.as_ref(),
        roster,
        ExistingUsers::AttachStudents,
        &target,
    )
    .await?;
    log::info!("batch {} roster upload: {}", batch.batch.name, report.status());
    proceeds(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchWithStudents {
    pub batch: BatchView,
    pub students: OnboardingReport,
}

fn batch_fields(form: &Form) -> Result<CreateBatch, Error> {
    let missing = |key: &str| Error::field(key, "This field is required.");
    Ok(CreateBatch {
        course: form.parse("course")?.ok_or_else(|| missing("course"))?,
        college: form.parse("college")?,
        name: form.required("name")?.to_string(),
        start_date: form.parse("start_date")?.ok_or_else(|| missing("start_date"))?,
        end_date: form.parse("end_date")?.ok_or_else(|| missing("end_date"))?,
    })
}

/// All or nothing from the caller's point of view: if any row fails the
/// batch is deleted again. Students created before the failure remain.
pub async fn create_with_students(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    multipart: Multipart,
) -> Payload<BatchWithStudents> {
    caller.require_admin()?;
    let form = Form::read(multipart).await?;
    let fields = batch_fields(&form)?;
    let roster = onboarding::parse_roster(&form.file("file")?.bytes)?;

    let id = insert_batch(&pg, &fields).await?;
    let batch = fetch_view(&pg, id).await?;
    let target = Target {
        batch_id: Some(id),
        college: batch.college_name.clone(),
        course: Some(batch.course_name.clone()),
        strict: true,
    };

    match onboarding::onboard(
        &pg,
        state.notifier.as_ref(),
        roster,
        ExistingUsers::AttachStudents,
        &target,
    )
    .await
    {
        Ok(students) => proceeds(BatchWithStudents {
            batch: fetch_view(&pg, id).await?,
            students,
        }),
        Err(err) => {
            log::warn!("discarding batch {} after failed roster: {}", batch.batch.name, err);
            sqlx::query("DELETE FROM batches WHERE id = $1")
                .bind(id)
                .execute(&pg)
                .await?;
            breaks(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_ids_are_deduplicated() {
        let a = Uuid::new_v4();
        let ids = StudentIds {
            student_ids: vec![a, a],
        };
        assert_eq!(ids.distinct(), vec![a]);
    }

    #[test]
    fn multipart_batch_fields_are_validated() {
        let course = Uuid::new_v4();
        let mut form = Form::default();
        form.fields.insert("course".into(), course.to_string());
        form.fields.insert("name".into(), "Spring cohort".into());
        form.fields.insert("start_date".into(), "2024-03-01".into());

        match batch_fields(&form) {
            Err(Error::Validation { fields }) => assert!(fields.contains_key("end_date")),
            other => panic!("expected a validation error, got {:?}", other),
        }

        form.fields.insert("end_date".into(), "2024-06-30".into());
        let fields = batch_fields(&form).unwrap();
        assert_eq!(fields.course, course);
        assert_eq!(fields.college, None);
        assert_eq!(fields.end_date, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
    }

    #[test]
    fn batch_view_flattens_the_batch() {
        let view = BatchView {
            batch: BatchData {
                id: Uuid::new_v4(),
                course_id: Uuid::new_v4(),
                college_id: None,
                name: "B1".into(),
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            },
            course_name: "Rust".into(),
            college_name: None,
            student_count: 3,
        };
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["name"], "B1");
        assert_eq!(json["student_count"], 3);
        assert_eq!(json["start_date"], "2024-01-01");
    }
}
