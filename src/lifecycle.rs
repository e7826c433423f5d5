//! Trainer access lifecycle.
//!
//! A trainer may log in only while they hold a schedule that has not ended
//! yet. Every schedule write re-derives the trainer's access from the full
//! set of their schedules: [`recompute`] decides, [`sync_trainer`] applies
//! the decision to the database and sends the credentials mail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::auth::{generate_password, hash_password};
use crate::models::{Role, UserData};
use crate::notify::{Mail, Notifier};
use crate::Error;

/// Login-relevant fields of a trainer as currently stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainerAccess {
    pub is_active: bool,
    pub access_expiry_date: Option<DateTime<Utc>>,
}

impl From<&UserData> for TrainerAccess {
    fn from(user: &UserData) -> Self {
        TrainerAccess {
            is_active: user.is_active,
            access_expiry_date: user.access_expiry_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "expires_at")]
pub enum AccessStatus {
    Inactive,
    ActiveWithExpiry(DateTime<Utc>),
}

impl AccessStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AccessStatus::ActiveWithExpiry(_))
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            AccessStatus::Inactive => None,
            AccessStatus::ActiveWithExpiry(at) => Some(*at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Replace the stored password with a freshly generated one.
    RotatePassword,
    /// Mail the rotated password to the trainer.
    SendCredentials { valid_until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recomputation {
    pub status: AccessStatus,
    pub effects: Vec<Effect>,
}

impl Recomputation {
    pub fn rotates_password(&self) -> bool {
        self.effects.contains(&Effect::RotatePassword)
    }

    pub fn sends_credentials(&self) -> bool {
        self.effects
            .iter()
            .any(|effect| matches!(effect, Effect::SendCredentials { .. }))
    }
}

/// Maximum `end_date` among schedules that have not ended at `now`.
pub fn latest_future_end(
    end_dates: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    end_dates.iter().copied().filter(|end| *end >= now).max()
}

/// Inactive trainers and trainers whose previous access already ran out
/// get new credentials. Evaluated against the state before the write.
pub fn needs_reissue(current: &TrainerAccess, now: DateTime<Utc>) -> bool {
    !current.is_active || matches!(current.access_expiry_date, Some(expiry) if expiry < now)
}

pub fn recompute(
    current: &TrainerAccess,
    end_dates: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Recomputation {
    let reissue = needs_reissue(current, now);
    let mut effects = Vec::new();
    if reissue {
        effects.push(Effect::RotatePassword);
    }

    let status = match latest_future_end(end_dates, now) {
        Some(valid_until) => {
            if reissue {
                effects.push(Effect::SendCredentials { valid_until });
            }
            AccessStatus::ActiveWithExpiry(valid_until)
        }
        None => AccessStatus::Inactive,
    };

    Recomputation { status, effects }
}

/// Locks the rows of every trainer a schedule write touches.
///
/// Must run before the write itself: the schedule's foreign key takes a
/// share lock on the same rows, and upgrading that later deadlocks against
/// a concurrent writer. Rows are locked in id order.
pub async fn lock_trainers(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[Uuid],
) -> Result<Vec<UserData>, Error> {
    let trainers = sqlx::query_as::<_, UserData>(
        "SELECT * FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut *tx)
    .await?;

    for id in ids {
        match trainers.iter().find(|trainer| trainer.id == *id) {
            None => {
                return Err(Error::field(
                    "trainer",
                    format!("User `{}` does not exist", id),
                ))
            }
            Some(user) if user.role != Role::Trainer => {
                return Err(Error::field(
                    "trainer",
                    format!("User `{}` is not a trainer", user.email),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(trainers)
}

/// Re-establishes the access invariant for one trainer inside `tx`.
///
/// `trainer` must come from [`lock_trainers`] in the same transaction. The
/// mail goes out through `tx` before the caller commits, so a delivery
/// failure rolls the password change back together with the schedule write.
pub async fn sync_trainer(
    tx: &mut Transaction<'_, Postgres>,
    notifier: &dyn Notifier,
    trainer: &UserData,
    now: DateTime<Utc>,
) -> Result<AccessStatus, Error> {
    let trainer_id = trainer.id;
    let end_dates =
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT end_date FROM schedules WHERE trainer_id = $1")
            .bind(trainer_id)
            .fetch_all(&mut *tx)
            .await?;

    let outcome = recompute(&TrainerAccess::from(trainer), &end_dates, now);

    let password = if outcome.rotates_password() {
        Some(generate_password())
    } else {
        None
    };
    let password_hash = match &password {
        Some(password) => Some(hash_password(password)?),
        None => None,
    };

    sqlx::query(
        "UPDATE users SET is_active = $2, access_expiry_date = $3, \
         password_hash = COALESCE($4, password_hash) WHERE id = $1",
    )
    .bind(trainer_id)
    .bind(outcome.status.is_active())
    .bind(outcome.status.expiry())
    .bind(password_hash)
    .execute(&mut *tx)
    .await?;

    for effect in &outcome.effects {
        if let Effect::SendCredentials { valid_until } = effect {
            let password = password.as_deref().ok_or_else(|| {
                Error::unknown("credentials mail requested without a new password")
            })?;
            notifier
                .send(
                    &mut *tx,
                    &Mail::trainer_credentials(
                        &trainer.first_name,
                        &trainer.email,
                        password,
                        *valid_until,
                    ),
                )
                .await?;
        }
    }

    match outcome.status {
        AccessStatus::ActiveWithExpiry(until) if outcome.sends_credentials() => {
            log::info!("trainer {} activated until {}", trainer.email, until)
        }
        AccessStatus::ActiveWithExpiry(until) => {
            log::debug!("trainer {} access extended to {}", trainer.email, until)
        }
        AccessStatus::Inactive if trainer.is_active => {
            log::info!("trainer {} deactivated, no upcoming schedules", trainer.email)
        }
        AccessStatus::Inactive => {}
    }

    Ok(outcome.status)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn inactive() -> TrainerAccess {
        TrainerAccess {
            is_active: false,
            access_expiry_date: None,
        }
    }

    fn active_until(at: DateTime<Utc>) -> TrainerAccess {
        TrainerAccess {
            is_active: true,
            access_expiry_date: Some(at),
        }
    }

    #[test]
    fn first_schedule_activates_and_mails_credentials() {
        let next_week = now() + Duration::weeks(1);
        let outcome = recompute(&inactive(), &[next_week], now());

        assert_eq!(outcome.status, AccessStatus::ActiveWithExpiry(next_week));
        assert_eq!(
            outcome.effects,
            vec![
                Effect::RotatePassword,
                Effect::SendCredentials {
                    valid_until: next_week
                }
            ]
        );
    }

    #[test]
    fn later_schedule_extends_active_trainer_without_mail() {
        let next_week = now() + Duration::weeks(1);
        let two_weeks = now() + Duration::weeks(2);
        let outcome = recompute(&active_until(next_week), &[next_week, two_weeks], now());

        assert_eq!(outcome.status, AccessStatus::ActiveWithExpiry(two_weeks));
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn deleting_the_only_schedule_deactivates() {
        let next_week = now() + Duration::weeks(1);
        let outcome = recompute(&active_until(next_week), &[], now());

        assert_eq!(outcome.status, AccessStatus::Inactive);
        assert_eq!(outcome.status.expiry(), None);
        assert!(!outcome.sends_credentials());
    }

    #[test]
    fn only_past_schedules_count_as_none() {
        let last_month = now() - Duration::days(30);
        let outcome = recompute(&active_until(now() + Duration::days(1)), &[last_month], now());
        assert_eq!(outcome.status, AccessStatus::Inactive);
    }

    #[test]
    fn expired_trainer_is_reissued_even_if_still_flagged_active() {
        let yesterday = now() - Duration::days(1);
        let next_month = now() + Duration::days(30);
        let outcome = recompute(&active_until(yesterday), &[yesterday, next_month], now());

        assert_eq!(outcome.status, AccessStatus::ActiveWithExpiry(next_month));
        assert!(outcome.rotates_password());
        assert!(outcome.sends_credentials());
    }

    #[test]
    fn active_trainer_without_expiry_is_not_reissued() {
        let current = TrainerAccess {
            is_active: true,
            access_expiry_date: None,
        };
        let outcome = recompute(&current, &[now() + Duration::days(3)], now());
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn inactive_trainer_without_schedules_rotates_silently() {
        let outcome = recompute(&inactive(), &[], now());
        assert_eq!(outcome.status, AccessStatus::Inactive);
        assert_eq!(outcome.effects, vec![Effect::RotatePassword]);
    }

    #[test]
    fn schedule_ending_exactly_now_still_counts() {
        let outcome = recompute(&inactive(), &[now()], now());
        assert_eq!(outcome.status, AccessStatus::ActiveWithExpiry(now()));
    }

    #[test]
    fn repeated_updates_mail_only_once() {
        let ends = [now() + Duration::days(10), now() + Duration::days(20)];
        let mut access = inactive();
        let mut mails = 0;
        for _ in 0..3 {
            let outcome = recompute(&access, &ends, now());
            if outcome.sends_credentials() {
                mails += 1;
            }
            access = TrainerAccess {
                is_active: outcome.status.is_active(),
                access_expiry_date: outcome.status.expiry(),
            };
        }
        assert_eq!(mails, 1);
        assert_eq!(access.access_expiry_date, Some(ends[1]));
    }

    #[test]
    fn expiry_always_tracks_latest_future_end() {
        let offsets = [-40i64, -3, 0, 2, 9, 17, 33];
        for window in 1..=offsets.len() {
            for start in 0..=(offsets.len() - window) {
                let ends: Vec<_> = offsets[start..start + window]
                    .iter()
                    .map(|days| now() + Duration::days(*days))
                    .collect();
                let expected = ends.iter().copied().filter(|end| *end >= now()).max();
                for current in [inactive(), active_until(now() + Duration::days(1))] {
                    let outcome = recompute(&current, &ends, now());
                    assert_eq!(outcome.status.expiry(), expected);
                    assert_eq!(outcome.status.is_active(), expected.is_some());
                    assert_eq!(outcome.rotates_password(), !current.is_active);
                }
            }
        }
    }

    #[test]
    fn status_serializes_with_expiry() {
        let json = serde_json::to_value(AccessStatus::ActiveWithExpiry(now())).unwrap();
        assert_eq!(json["state"], "ActiveWithExpiry");
        assert!(json["expires_at"].is_string());
    }
}
