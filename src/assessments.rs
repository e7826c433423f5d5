use axum::extract::Path;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::models::{AssessmentData, AssessmentType, Role};
use crate::reporting::{AttemptView, ATTEMPT_VIEW_SELECT};
use crate::users::Deleted;
use crate::{breaks, proceeds, Error, Payload};

const DEFAULT_TOTAL_MARKS: i32 = 100;

/// Students see assessments for the courses of their batches.
const VISIBLE_ASSESSMENTS: &str = "SELECT * FROM assessments WHERE $1::uuid IS NULL \
     OR course IN (SELECT c.name FROM batch_students bs \
         JOIN batches b ON b.id = bs.batch_id \
         JOIN courses c ON c.id = b.course_id WHERE bs.student_id = $1)";

fn student_scope(caller: &AuthUser) -> Option<Uuid> {
    (caller.role == Role::Student).then(|| caller.id)
}

async fn fetch_assessment(pg: &PgPool, caller: &AuthUser, id: Uuid) -> Result<AssessmentData, Error> {
    sqlx::query_as::<_, AssessmentData>(&format!("{} AND id = $2", wrap(VISIBLE_ASSESSMENTS)))
        .bind(student_scope(caller))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Assessment `{}` does not exist", id)))
}

/// Parenthesises the visibility filter so further conditions bind tighter.
fn wrap(select: &str) -> String {
    select.replacen("WHERE ", "WHERE (", 1) + ")"
}

pub async fn list_assessments(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<AssessmentData>> {
    let assessments = sqlx::query_as::<_, AssessmentData>(&format!(
        "{} ORDER BY due_date NULLS LAST, title",
        VISIBLE_ASSESSMENTS
    ))
    .bind(student_scope(&caller))
    .fetch_all(&pg)
    .await?;
    proceeds(assessments.into())
}

pub async fn get_assessment(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<AssessmentData> {
    proceeds(fetch_assessment(&pg, &caller, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssessment {
    pub title: String,
    pub course: String,
    #[serde(rename = "type")]
    pub kind: AssessmentType,
    pub total_marks: Option<i32>,
    pub due_date: Option<DateTime<Utc>>,
}

pub async fn create_assessment(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<CreateAssessment>,
) -> Payload<AssessmentData> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    if body.title.trim().is_empty() {
        return breaks(Error::field("title", "This field is required."));
    }
    let total_marks = body.total_marks.unwrap_or(DEFAULT_TOTAL_MARKS);
    if total_marks <= 0 {
        return breaks(Error::field("total_marks", "Total marks must be positive."));
    }
    let assessment = sqlx::query_as::<_, AssessmentData>(
        "INSERT INTO assessments (id, title, course, type, total_marks, due_date) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(body.title.trim())
    .bind(body.course.trim())
    .bind(body.kind)
    .bind(total_marks)
    .bind(body.due_date)
    .fetch_one(&pg)
    .await?;
    proceeds(assessment)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAssessment {
    pub title: Option<String>,
    pub course: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<AssessmentType>,
    pub total_marks: Option<i32>,
    pub due_date: Option<DateTime<Utc>>,
}

pub async fn update_assessment(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAssessment>,
) -> Payload<AssessmentData> {
    caller.require(&[Role::Admin, Role::Trainer])?;
    if matches!(body.total_marks, Some(marks) if marks <= 0) {
        return breaks(Error::field("total_marks", "Total marks must be positive."));
    }
    let assessment = sqlx::query_as::<_, AssessmentData>(
        "UPDATE assessments SET title = COALESCE($2, title), course = COALESCE($3, course), \
         type = COALESCE($4, type), total_marks = COALESCE($5, total_marks), \
         due_date = COALESCE($6, due_date) WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(body.title.as_deref().map(str::trim))
    .bind(body.course.as_deref().map(str::trim))
    .bind(body.kind)
    .bind(body.total_marks)
    .bind(body.due_date)
    .fetch_optional(&pg)
    .await?;
    match assessment {
        Some(assessment) => proceeds(assessment),
        None => breaks(Error::not_found(format!("Assessment `{}` does not exist", id))),
    }
}

pub async fn delete_assessment(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM assessments WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Assessment `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}

pub async fn list_attempts(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<AttemptView>> {
    let attempts = sqlx::query_as::<_, AttemptView>(&format!(
        "{} WHERE $1::uuid IS NULL OR a.student_id = $1 ORDER BY a.timestamp DESC",
        ATTEMPT_VIEW_SELECT
    ))
    .bind(student_scope(&caller))
    .fetch_all(&pg)
    .await?;
    proceeds(attempts.into())
}

async fn fetch_attempt(pg: &PgPool, caller: &AuthUser, id: Uuid) -> Result<AttemptView, Error> {
    sqlx::query_as::<_, AttemptView>(&format!("{} WHERE a.id = $1", ATTEMPT_VIEW_SELECT))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .filter(|attempt| caller.role != Role::Student || attempt.student == caller.id)
        .ok_or_else(|| Error::not_found(format!("Attempt `{}` does not exist", id)))
}

pub async fn get_attempt(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<AttemptView> {
    proceeds(fetch_attempt(&pg, &caller, id).await?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordAttempt {
    pub student: Option<Uuid>,
    pub assessment: Uuid,
    pub score: i32,
}

/// Students record their own attempts; staff must name the student.
pub fn attempt_owner(caller: &AuthUser, requested: Option<Uuid>) -> Result<Uuid, Error> {
    match (caller.role, requested) {
        (Role::Student, Some(student)) if student != caller.id => Err(Error::denied(
            "Students may only record their own attempts.",
        )),
        (Role::Student, _) => Ok(caller.id),
        (_, Some(student)) => Ok(student),
        (_, None) => Err(Error::field("student", "This field is required.")),
    }
}

pub fn check_score(score: i32, total_marks: i32) -> Result<(), Error> {
    if (0..=total_marks).contains(&score) {
        Ok(())
    } else {
        Err(Error::field(
            "score",
            format!("Score must be between 0 and {}.", total_marks),
        ))
    }
}

pub async fn record_attempt(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<RecordAttempt>,
) -> Payload<AttemptView> {
    let student = attempt_owner(&caller, body.student)?;
    let assessment = fetch_assessment(&pg, &caller, body.assessment).await?;
    check_score(body.score, assessment.total_marks)?;

    let is_student = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1 AND role = 'STUDENT')",
    )
    .bind(student)
    .fetch_one(&pg)
    .await?;
    if !is_student {
        return breaks(Error::field(
            "student",
            format!("User `{}` is not a student", student),
        ));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO student_attempts (id, student_id, assessment_id, score) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(student)
    .bind(assessment.id)
    .bind(body.score)
    .execute(&pg)
    .await?;
    proceeds(fetch_attempt(&pg, &caller, id).await?)
}

pub async fn delete_attempt(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<Deleted> {
    caller.require_admin()?;
    let res = sqlx::query("DELETE FROM student_attempts WHERE id = $1")
        .bind(id)
        .execute(&pg)
        .await?;
    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!("Attempt `{}` does not exist", id)));
    }
    proceeds(Deleted { id })
}
