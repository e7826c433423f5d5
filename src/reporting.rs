use std::collections::HashMap;

use axum::Extension;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::models::Role;
use crate::{proceeds, Payload};

pub const RECENT_ATTEMPTS: i64 = 10;

/// One recorded score, already joined with the student's name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScoredAttempt {
    pub student_id: Uuid,
    pub student_name: String,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    #[serde(rename = "studentName")]
    pub student_name: String,
    #[serde(rename = "totalScore")]
    pub total_score: i64,
}

/// Sums scores per student; students without attempts never appear.
/// Highest total first, ties broken by name.
pub fn leaderboard(attempts: &[ScoredAttempt]) -> Vec<LeaderboardEntry> {
    let mut totals: HashMap<Uuid, LeaderboardEntry> = HashMap::new();
    for attempt in attempts {
        totals
            .entry(attempt.student_id)
            .or_insert_with(|| LeaderboardEntry {
                student_name: attempt.student_name.trim().to_string(),
                total_score: 0,
            })
            .total_score += i64::from(attempt.score);
    }

    let mut entries: Vec<LeaderboardEntry> = totals.into_values().collect();
    entries.sort_by(|a, b| {
        b.total_score
            .cmp(&a.total_score)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    entries
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AttemptView {
    pub id: Uuid,
    pub student: Uuid,
    pub student_name: String,
    pub assessment: Uuid,
    pub assessment_title: String,
    pub course: String,
    pub score: i32,
    pub timestamp: DateTime<Utc>,
}

pub const ATTEMPT_VIEW_SELECT: &str = "SELECT a.id, a.student_id AS student, \
     TRIM(u.first_name || ' ' || u.last_name) AS student_name, \
     a.assessment_id AS assessment, s.title AS assessment_title, s.course, a.score, a.timestamp \
     FROM student_attempts a \
     JOIN users u ON u.id = a.student_id \
     JOIN assessments s ON s.id = a.assessment_id";

pub async fn dashboard(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Dashboard> {
    caller.require(&[Role::Admin, Role::Trainer])?;

    let scored = sqlx::query_as::<_, ScoredAttempt>(
        "SELECT a.student_id, TRIM(u.first_name || ' ' || u.last_name) AS student_name, a.score \
         FROM student_attempts a JOIN users u ON u.id = a.student_id \
         WHERE u.role = 'STUDENT'",
    )
    .fetch_all(&pg)
    .await?;

    let recent = sqlx::query_as::<_, AttemptView>(&format!(
        "{} ORDER BY a.timestamp DESC LIMIT $1",
        ATTEMPT_VIEW_SELECT
    ))
    .bind(RECENT_ATTEMPTS)
    .fetch_all(&pg)
    .await?;

    proceeds(Dashboard {
        leaderboard: leaderboard(&scored),
        student_attempts: recent,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub student_attempts: Vec<AttemptView>,
}
