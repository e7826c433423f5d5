use axum::extract::Path;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::err::Page;
use crate::lifecycle::{self, AccessStatus};
use crate::models::{Role, ScheduleData, UserData};
use crate::notify::Notifier;
use crate::users::Deleted;
use crate::{breaks, proceeds, AppState, Error, Payload};

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub schedule: ScheduleData,
    pub trainer_name: String,
    pub college_name: String,
    pub batch_name: Option<String>,
    pub material_ids: Vec<Uuid>,
}

const SCHEDULE_VIEW_SELECT: &str = "SELECT s.*, \
     TRIM(t.first_name || ' ' || t.last_name) AS trainer_name, \
     col.name AS college_name, b.name AS batch_name, \
     ARRAY(SELECT material_id FROM schedule_materials sm WHERE sm.schedule_id = s.id) AS material_ids \
     FROM schedules s \
     JOIN users t ON t.id = s.trainer_id \
     JOIN colleges col ON col.id = s.college_id \
     LEFT JOIN batches b ON b.id = s.batch_id";

async fn fetch_view(pg: &PgPool, id: Uuid) -> Result<ScheduleView, Error> {
    sqlx::query_as::<_, ScheduleView>(&format!("{} WHERE s.id = $1", SCHEDULE_VIEW_SELECT))
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found(format!("Schedule `{}` does not exist", id)))
}

/// Schedule plus the access its trainer holds after the write.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleWrite {
    #[serde(flatten)]
    pub schedule: ScheduleView,
    pub trainer_access: AccessStatus,
}

pub async fn list_schedules(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
) -> Payload<Page<ScheduleView>> {
    let (trainer, student) = match caller.role {
        Role::Admin => (None, None),
        Role::Trainer => (Some(caller.id), None),
        Role::Student => (None, Some(caller.id)),
    };
    let schedules = sqlx::query_as::<_, ScheduleView>(&format!(
        "{} WHERE ($1::uuid IS NULL OR s.trainer_id = $1) \
         AND ($2::uuid IS NULL OR s.batch_id IN \
             (SELECT batch_id FROM batch_students WHERE student_id = $2)) \
         ORDER BY s.start_date",
        SCHEDULE_VIEW_SELECT
    ))
    .bind(trainer)
    .bind(student)
    .fetch_all(&pg)
    .await?;
    proceeds(schedules.into())
}

pub async fn get_schedule(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Payload<ScheduleView> {
    let view = fetch_view(&pg, id).await?;
    if caller.role == Role::Trainer && view.schedule.trainer_id != caller.id {
        return breaks(Error::denied("This schedule belongs to another trainer."));
    }
    proceeds(view)
}

async fn link_materials(
    tx: &mut Transaction<'_, Postgres>,
    schedule_id: Uuid,
    material_ids: &[Uuid],
) -> Result<(), Error> {
    sqlx::query("DELETE FROM schedule_materials WHERE schedule_id = $1")
        .bind(schedule_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO schedule_materials (schedule_id, material_id) \
         SELECT $1, material FROM UNNEST($2::uuid[]) AS material ON CONFLICT DO NOTHING",
    )
    .bind(schedule_id)
    .bind(material_ids)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Trainers touched by a write, in lock order.
pub fn trainers_to_sync(before: Option<Uuid>, after: Uuid) -> Vec<Uuid> {
    let mut trainers: Vec<Uuid> = before.into_iter().chain(Some(after)).collect();
    trainers.sort();
    trainers.dedup();
    trainers
}

/// Locks the trainer row of schedule `id` for the rest of the transaction.
async fn lock_schedule(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Uuid, Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT trainer_id FROM schedules WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found(format!("Schedule `{}` does not exist", id)))
}

async fn sync_all(
    tx: &mut Transaction<'_, Postgres>,
    notifier: &dyn Notifier,
    trainers: &[UserData],
    subject: Uuid,
) -> Result<AccessStatus, Error> {
    let now = Utc::now();
    let mut access = AccessStatus::Inactive;
    for trainer in trainers {
        let status = lifecycle::sync_trainer(tx, notifier, trainer, now).await?;
        if trainer.id == subject {
            access = status;
        }
    }
    Ok(access)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchedule {
    pub trainer: Uuid,
    pub college: Uuid,
    pub course: String,
    pub batch: Option<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub material_ids: Vec<Uuid>,
}

pub async fn create_schedule(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateSchedule>,
) -> Payload<ScheduleWrite> {
    caller.require_admin()?;
    if body.course.trim().is_empty() {
        return breaks(Error::field("course", "This field is required."));
    }

    let id = Uuid::new_v4();
    let mut tx = pg.begin().await?;
    let trainers = lifecycle::lock_trainers(&mut tx, &[body.trainer]).await?;
    sqlx::query(
        "INSERT INTO schedules (id, trainer_id, college_id, course, batch_id, start_date, end_date) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(body.trainer)
    .bind(body.college)
    .bind(body.course.trim())
    .bind(body.batch)
    .bind(body.start_date)
    .bind(body.end_date)
    .execute(&mut tx)
    .await?;
    link_materials(&mut tx, id, &body.material_ids).await?;
    let trainer_access = sync_all(
        &mut tx,
        state.notifier.as_ref(),
        &trainers,
        body.trainer,
    )
    .await?;
    tx.commit().await?;

    proceeds(ScheduleWrite {
        schedule: fetch_view(&pg, id).await?,
        trainer_access,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSchedule {
    pub trainer: Option<Uuid>,
    pub college: Option<Uuid>,
    pub course: Option<String>,
    pub batch: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub material_ids: Option<Vec<Uuid>>,
}

/// Moving a schedule to another trainer recomputes both trainers.
pub async fn update_schedule(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSchedule>,
) -> Payload<ScheduleWrite> {
    caller.require_admin()?;

    let mut tx = pg.begin().await?;
    let before = lock_schedule(&mut tx, id).await?;
    let after = body.trainer.unwrap_or(before);
    let trainers =
        lifecycle::lock_trainers(&mut tx, &trainers_to_sync(Some(before), after)).await?;

    sqlx::query(
        "UPDATE schedules SET trainer_id = COALESCE($2, trainer_id), \
         college_id = COALESCE($3, college_id), course = COALESCE($4, course), \
         batch_id = COALESCE($5, batch_id), start_date = COALESCE($6, start_date), \
         end_date = COALESCE($7, end_date) WHERE id = $1",
    )
    .bind(id)
    .bind(body.trainer)
    .bind(body.college)
    .bind(body.course.as_deref().map(str::trim))
    .bind(body.batch)
    .bind(body.start_date)
    .bind(body.end_date)
    .execute(&mut tx)
    .await?;

    if let Some(material_ids) = &body.material_ids {
        link_materials(&mut tx, id, material_ids).await?;
    }
    let trainer_access = sync_all(
        &mut tx,
        state.notifier.as_ref(),
        &trainers,
        after,
    )
    .await?;
    tx.commit().await?;

    proceeds(ScheduleWrite {
        schedule: fetch_view(&pg, id).await?,
        trainer_access,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDeleted {
    #[serde(flatten)]
    pub deleted: Deleted,
    pub trainer: Uuid,
    pub trainer_access: AccessStatus,
}

pub async fn delete_schedule(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Payload<ScheduleDeleted> {
    caller.require_admin()?;

    let mut tx = pg.begin().await?;
    let trainer = lock_schedule(&mut tx, id).await?;
    let trainers = lifecycle::lock_trainers(&mut tx, &[trainer]).await?;
    sqlx::query("DELETE FROM schedules WHERE id = $1")
        .bind(id)
        .execute(&mut tx)
        .await?;

    let trainer_access = sync_all(&mut tx, state.notifier.as_ref(), &trainers, trainer).await?;
    tx.commit().await?;

    proceeds(ScheduleDeleted {
        deleted: Deleted { id },
        trainer,
        trainer_access,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn reassignment_syncs_both_trainers_in_stable_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(trainers_to_sync(Some(a), b), expected);
        assert_eq!(trainers_to_sync(Some(b), a), expected);
        assert_eq!(trainers_to_sync(Some(a), a), vec![a]);
        assert_eq!(trainers_to_sync(None, b), vec![b]);
    }

    #[test]
    fn views_omit_missing_batch() {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let view = ScheduleView {
            schedule: ScheduleData {
                id: Uuid::new_v4(),
                trainer_id: Uuid::new_v4(),
                college_id: Uuid::new_v4(),
                course: "Rust".into(),
                batch_id: None,
                start_date: start,
                end_date: start + chrono::Duration::days(5),
            },
            trainer_name: "Grace Hopper".into(),
            college_name: "North Campus".into(),
            batch_name: None,
            material_ids: vec![],
        };
        let json = serde_json::to_value(view).unwrap();
        assert_eq!(json["trainer_name"], "Grace Hopper");
        assert!(json.get("batch_name").is_none());
        assert_eq!(json["course"], "Rust");
    }

    #[test]
    fn create_payload_accepts_rfc3339_dates() {
        let body: CreateSchedule = serde_json::from_str(
            r#"{
                "trainer": "6f1c1a0e-8a43-4a55-9d38-1f0e9c6f4b11",
                "college": "0d7f3c52-5a51-4b9b-a6d5-3a3c2f41d0a2",
                "course": "Rust",
                "start_date": "2024-06-03T09:00:00Z",
                "end_date": "2024-06-07T17:00:00+02:00"
            }"#,
        )
        .unwrap();
        assert!(body.batch.is_none());
        assert!(body.material_ids.is_empty());
        assert_eq!(
            body.end_date,
            Utc.with_ymd_and_hms(2024, 6, 7, 15, 0, 0).unwrap()
        );
    }

    mod writes {
        use std::sync::Arc;

        use chrono::{Duration, TimeZone};
        use sqlx::PgPool;

        use super::super::*;
        use crate::auth::verify_password;
        use crate::models::UNUSABLE_PASSWORD;
        use crate::notify::testing::RecordingNotifier;
        use crate::testing::{
            admin, college, database, mailed_password, outbox, state, stored, trainer,
            unwrap_payload, user,
        };

        fn in_days(days: i64) -> DateTime<Utc> {
            Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap() + Duration::days(days)
        }

        fn new_schedule(trainer: Uuid, college: Uuid, end_date: DateTime<Utc>) -> CreateSchedule {
            CreateSchedule {
                trainer,
                college,
                course: "Rust".into(),
                batch: None,
                start_date: end_date - Duration::days(2),
                end_date,
                material_ids: vec![],
            }
        }

        async fn create(
            pg: &PgPool,
            state: AppState,
            body: CreateSchedule,
        ) -> Result<ScheduleWrite, Error> {
            unwrap_payload(
                create_schedule(admin(), Extension(pg.clone()), Extension(state), Json(body)).await,
            )
        }

        async fn schedules_of(pg: &PgPool, trainer: Uuid) -> Vec<Uuid> {
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM schedules WHERE trainer_id = $1")
                .bind(trainer)
                .fetch_all(pg)
                .await
                .unwrap()
        }

        #[tokio::test]
        async fn first_schedule_mails_the_password_that_is_stored() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let notifier = Arc::new(RecordingNotifier::default());
            let grace = trainer(&pg, false, None).await;
            let end = in_days(10);

            let write = create(
                &pg,
                state(notifier.clone()),
                new_schedule(grace.id, college(&pg).await, end),
            )
            .await
            .unwrap();
            assert_eq!(write.trainer_access, AccessStatus::ActiveWithExpiry(end));

            let sent = notifier.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].to, grace.email);
            let row = stored(&pg, grace.id).await;
            assert!(row.is_active);
            assert_eq!(row.access_expiry_date, Some(end));
            assert!(verify_password(&row.password_hash, &mailed_password(&sent[0].body)));
        }

        #[tokio::test]
        async fn active_trainer_is_extended_without_mail() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let notifier = Arc::new(RecordingNotifier::default());
            let grace = trainer(&pg, true, Some(in_days(5))).await;
            let end = in_days(20);

            let write = create(
                &pg,
                state(notifier.clone()),
                new_schedule(grace.id, college(&pg).await, end),
            )
            .await
            .unwrap();
            assert_eq!(write.trainer_access, AccessStatus::ActiveWithExpiry(end));
            assert!(notifier.sent().is_empty());
            let row = stored(&pg, grace.id).await;
            assert_eq!(row.password_hash, grace.password_hash);
            assert_eq!(row.access_expiry_date, Some(end));
        }

        #[tokio::test]
        async fn failed_mail_keeps_trainer_and_schedules_unchanged() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let grace = trainer(&pg, false, None).await;

            let res = create(
                &pg,
                state(Arc::new(RecordingNotifier::failing())),
                new_schedule(grace.id, college(&pg).await, in_days(10)),
            )
            .await;
            assert!(matches!(res, Err(Error::NotificationFailed { .. })));

            assert!(schedules_of(&pg, grace.id).await.is_empty());
            let row = stored(&pg, grace.id).await;
            assert!(!row.is_active);
            assert_eq!(row.password_hash, UNUSABLE_PASSWORD);
            assert_eq!(row.access_expiry_date, None);
        }

        #[tokio::test]
        async fn moving_to_a_non_trainer_changes_nothing() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let campus = college(&pg).await;
            let grace = trainer(&pg, false, None).await;
            let student = user(&pg, Role::Student).await;
            let schedule = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO schedules (id, trainer_id, college_id, course, start_date, end_date) \
                 VALUES ($1, $2, $3, 'Rust', $4, $5)",
            )
            .bind(schedule)
            .bind(grace.id)
            .bind(campus)
            .bind(in_days(1))
            .bind(in_days(3))
            .execute(&pg)
            .await
            .unwrap();

            let body = UpdateSchedule {
                trainer: Some(student.id),
                college: None,
                course: None,
                batch: None,
                start_date: None,
                end_date: None,
                material_ids: None,
            };
            let res = unwrap_payload(
                update_schedule(
                    admin(),
                    Extension(pg.clone()),
                    Extension(state(outbox())),
                    Path(schedule),
                    Json(body),
                )
                .await,
            );
            assert!(matches!(res, Err(Error::Validation { .. })));

            assert_eq!(schedules_of(&pg, grace.id).await, vec![schedule]);
            assert_eq!(stored(&pg, grace.id).await.password_hash, UNUSABLE_PASSWORD);
            let queued = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM mail_outbox WHERE recipient = $1",
            )
            .bind(&grace.email)
            .fetch_one(&pg)
            .await
            .unwrap();
            assert_eq!(queued, 0);
        }

        #[tokio::test]
        async fn failed_reassignment_rolls_back_both_trainers() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let notifier = Arc::new(RecordingNotifier::default());
            let from = trainer(&pg, false, None).await;
            let to = trainer(&pg, false, None).await;
            let write = create(
                &pg,
                state(notifier),
                new_schedule(from.id, college(&pg).await, in_days(7)),
            )
            .await
            .unwrap();
            let schedule = write.schedule.schedule.id;
            let before = stored(&pg, from.id).await;

            let body = UpdateSchedule {
                trainer: Some(to.id),
                college: None,
                course: None,
                batch: None,
                start_date: None,
                end_date: None,
                material_ids: None,
            };
            let res = unwrap_payload(
                update_schedule(
                    admin(),
                    Extension(pg.clone()),
                    Extension(state(Arc::new(RecordingNotifier::failing()))),
                    Path(schedule),
                    Json(body),
                )
                .await,
            );
            assert!(matches!(res, Err(Error::NotificationFailed { .. })));

            assert_eq!(schedules_of(&pg, from.id).await, vec![schedule]);
            let after = stored(&pg, from.id).await;
            assert!(after.is_active);
            assert_eq!(after.access_expiry_date, before.access_expiry_date);
            assert_eq!(after.password_hash, before.password_hash);
            let untouched = stored(&pg, to.id).await;
            assert!(!untouched.is_active);
            assert_eq!(untouched.password_hash, UNUSABLE_PASSWORD);
        }

        #[tokio::test]
        async fn concurrent_writes_for_one_trainer_both_succeed() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let notifier = Arc::new(RecordingNotifier::default());
            let grace = trainer(&pg, false, None).await;
            let campus = college(&pg).await;
            let (soon, later) = (in_days(4), in_days(9));

            let (a, b) = tokio::join!(
                create(&pg, state(notifier.clone()), new_schedule(grace.id, campus, soon)),
                create(&pg, state(notifier.clone()), new_schedule(grace.id, campus, later)),
            );
            assert!(a.is_ok(), "{:?}", a.err());
            assert!(b.is_ok(), "{:?}", b.err());

            assert_eq!(schedules_of(&pg, grace.id).await.len(), 2);
            assert_eq!(notifier.sent().len(), 1);
            assert_eq!(stored(&pg, grace.id).await.access_expiry_date, Some(later));
        }

        #[tokio::test]
        async fn deleting_the_last_schedule_locks_the_trainer_out() {
            let pg = match database().await {
                Some(pg) => pg,
                None => return,
            };
            let notifier = Arc::new(RecordingNotifier::default());
            let grace = trainer(&pg, false, None).await;
            let write = create(
                &pg,
                state(notifier.clone()),
                new_schedule(grace.id, college(&pg).await, in_days(3)),
            )
            .await
            .unwrap();

            let deleted = unwrap_payload(
                delete_schedule(
                    admin(),
                    Extension(pg.clone()),
                    Extension(state(notifier.clone())),
                    Path(write.schedule.schedule.id),
                )
                .await,
            )
            .unwrap();
            assert_eq!(deleted.trainer_access, AccessStatus::Inactive);

            let row = stored(&pg, grace.id).await;
            assert!(!row.is_active);
            assert_eq!(row.access_expiry_date, None);
            assert_eq!(notifier.sent().len(), 1);
        }
    }
}
