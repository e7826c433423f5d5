use async_trait::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::headers::authorization::Bearer;
use axum::headers::Authorization;
use axum::{Extension, Json, TypedHeader};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Role, UserData};
use crate::{breaks, proceeds, AppState, Error, Payload};

const GENERATED_PASSWORD_LEN: usize = 12;
const MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

/// Unusable or malformed hashes never match.
pub fn verify_password(password_hash: &str, password: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(hash) => Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok(),
        Err(_) => false,
    }
}

/// Temporary URL-safe password handed out by mail.
pub fn generate_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRefusal {
    Inactive,
    AccessExpired,
}

impl LoginRefusal {
    pub fn message(&self) -> &'static str {
        match self {
            LoginRefusal::Inactive => "Your account is inactive. Please contact an administrator.",
            LoginRefusal::AccessExpired => {
                "Your access period has expired. Please contact an administrator to be assigned to a new schedule."
            }
        }
    }
}

/// Decides whether a user holding valid credentials may log in at `now`.
pub fn login_gate(user: &UserData, now: DateTime<Utc>) -> Result<(), LoginRefusal> {
    if !user.is_active {
        return Err(LoginRefusal::Inactive);
    }
    if user.role == Role::Trainer {
        if let Some(expiry) = user.access_expiry_date {
            if expiry < now {
                return Err(LoginRefusal::AccessExpired);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub name: String,
    pub must_change_password: bool,
    pub batches: Vec<Uuid>,
    pub courses: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(claims: &Claims, secret: &str) -> Result<String, Error> {
    Ok(encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Caller identity taken from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require(&self, roles: &[Role]) -> Result<(), Error> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(Error::denied(
                "You do not have permission to perform this action.",
            ))
        }
    }

    pub fn require_admin(&self) -> Result<(), Error> {
        self.require(&[Role::Admin])
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
impl<B> FromRequest<B> for AuthUser
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request(req)
                .await
                .map_err(|_| {
                    Error::unauthenticated("Authentication credentials were not provided.")
                })?;
        let Extension(state) = Extension::<AppState>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "ExtensionError",
                message: err.to_string(),
            })?;

        let claims = decode_token(bearer.token(), &state.config.jwt_secret)?;
        let Extension(pg) = Extension::<PgPool>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "ExtensionError",
                message: err.to_string(),
            })?;
        let user = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE id = $1")
            .bind(claims.sub)
            .fetch_optional(&pg)
            .await?;
        admit(&claims, user.as_ref(), Utc::now())
    }
}

/// A valid token only counts while its user still exists and may log in.
/// Role and username are taken from the stored row, not from the token.
pub fn admit(
    claims: &Claims,
    user: Option<&UserData>,
    now: DateTime<Utc>,
) -> Result<AuthUser, Error> {
    let user = user.ok_or_else(|| Error::unauthenticated("User not found"))?;
    if let Err(refusal) = login_gate(user, now) {
        log::debug!("token for {} refused: {:?}", claims.username, refusal);
        return Err(Error::unauthenticated(refusal.message()));
    }
    Ok(AuthUser {
        id: user.id,
        username: user.username.clone(),
        role: user.role,
    })
}

pub async fn login(
    Extension(pg): Extension<PgPool>,
    Extension(state): Extension<AppState>,
    Json(login): Json<LoginRequest>,
) -> Payload<LoggedIn> {
    if login.username.trim().is_empty() || login.password.is_empty() {
        return breaks(Error::InvalidPayload {
            message: "`username` and `password` are required".to_string(),
        });
    }

    let username = login.username.trim().to_lowercase();
    let user = sqlx::query_as::<_, UserData>(
        "SELECT * FROM users WHERE username = $1 OR email = $1 LIMIT 1",
    )
    .bind(&username)
    .fetch_optional(&pg)
    .await
    .map_err(Error::from)?;

    let user = match user {
        Some(user) if verify_password(&user.password_hash, &login.password) => user,
        _ => {
            log::warn!("rejected login for `{}`", username);
            return breaks(Error::unauthenticated(
                "No active account found with the given credentials",
            ));
        }
    };

    let now = Utc::now();
    if let Err(refusal) = login_gate(&user, now) {
        if refusal == LoginRefusal::AccessExpired {
            sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
                .bind(user.id)
                .execute(&pg)
                .await?;
            log::info!("trainer {} deactivated at login, access expired", user.email);
        }
        return breaks(Error::unauthenticated(refusal.message()));
    }

    let (batches, courses) = if user.role == Role::Student {
        let memberships = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT b.id, c.name FROM batch_students bs \
             JOIN batches b ON b.id = bs.batch_id \
             JOIN courses c ON c.id = b.course_id \
             WHERE bs.student_id = $1",
        )
        .bind(user.id)
        .fetch_all(&pg)
        .await?;
        let batches = memberships.iter().map(|(id, _)| *id).collect();
        let mut courses: Vec<String> = memberships.into_iter().map(|(_, name)| name).collect();
        courses.sort();
        courses.dedup();
        (batches, courses)
    } else {
        (Vec::new(), Vec::new())
    };

    let expires_at = now + Duration::hours(state.config.token_ttl_hours);
    let claims = Claims {
        sub: user.id,
        username: user.username.clone(),
        role: user.role,
        name: user.full_name(),
        must_change_password: user.must_change_password,
        batches,
        courses,
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    proceeds(LoggedIn {
        access: issue_token(&claims, &state.config.jwt_secret)?,
        expires_at,
        must_change_password: user.must_change_password,
    })
}

pub async fn set_password(
    caller: AuthUser,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<SetPassword>,
) -> Payload<PasswordChanged> {
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return breaks(Error::field(
            "password",
            format!("Password must be at least {} characters long.", MIN_PASSWORD_LEN),
        ));
    }

    let res = sqlx::query(
        "UPDATE users SET password_hash = $2, must_change_password = FALSE WHERE id = $1",
    )
    .bind(caller.id)
    .bind(hash_password(&body.password)?)
    .execute(&pg)
    .await?;

    if res.rows_affected() < 1 {
        return breaks(Error::not_found(format!(
            "User `{}` does not exist",
            caller.username
        )));
    }

    proceeds(PasswordChanged {
        user_id: caller.id,
        status: "Password updated successfully.",
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub access: String,
    pub expires_at: DateTime<Utc>,
    pub must_change_password: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPassword {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordChanged {
    pub user_id: Uuid,
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNUSABLE_PASSWORD;

    fn user(role: Role, is_active: bool, expiry: Option<DateTime<Utc>>) -> UserData {
        UserData {
            id: Uuid::new_v4(),
            username: "t@example.com".into(),
            email: "t@example.com".into(),
            first_name: "T".into(),
            last_name: String::new(),
            role,
            expertise: None,
            experience: None,
            phone: None,
            course: None,
            college: None,
            resume: None,
            password_hash: UNUSABLE_PASSWORD.into(),
            is_active,
            must_change_password: false,
            access_expiry_date: expiry,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn generated_passwords_are_url_safe_and_distinct() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), GENERATED_PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn hashes_verify_only_their_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "battery staple"));
        assert!(!verify_password(UNUSABLE_PASSWORD, ""));
    }

    #[test]
    fn gate_rejects_inactive_and_expired_trainers() {
        let now = Utc::now();
        assert_eq!(
            login_gate(&user(Role::Trainer, false, None), now),
            Err(LoginRefusal::Inactive)
        );
        assert_eq!(
            login_gate(
                &user(Role::Trainer, true, Some(now - Duration::minutes(1))),
                now
            ),
            Err(LoginRefusal::AccessExpired)
        );
        assert_eq!(
            login_gate(&user(Role::Trainer, true, Some(now + Duration::days(1))), now),
            Ok(())
        );
        // expiry is only meaningful for trainers
        assert_eq!(
            login_gate(&user(Role::Student, true, Some(now - Duration::days(1))), now),
            Ok(())
        );
    }

    #[test]
    fn tokens_carry_role_and_memberships() {
        let now = Utc::now();
        let batch = Uuid::new_v4();
        let claims = Claims {
            sub: Uuid::new_v4(),
            username: "s@example.com".into(),
            role: Role::Student,
            name: "Sam Student".into(),
            must_change_password: true,
            batches: vec![batch],
            courses: vec!["Rust 101".into()],
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let token = issue_token(&claims, "secret").unwrap();

        let decoded = decode_token(&token, "secret").unwrap();
        assert_eq!(decoded.role, Role::Student);
        assert_eq!(decoded.batches, vec![batch]);
        assert!(decoded.must_change_password);

        assert!(matches!(
            decode_token(&token, "other-secret"),
            Err(Error::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let past = Utc::now() - Duration::hours(3);
        let claims = Claims {
            sub: Uuid::new_v4(),
            username: "a@example.com".into(),
            role: Role::Admin,
            name: "A".into(),
            must_change_password: false,
            batches: vec![],
            courses: vec![],
            iat: past.timestamp(),
            exp: (past + Duration::hours(1)).timestamp(),
        };
        let token = issue_token(&claims, "secret").unwrap();
        assert!(decode_token(&token, "secret").is_err());
    }

    fn claims_for(user: &UserData) -> Claims {
        let now = Utc::now();
        Claims {
            sub: user.id,
            username: user.username.clone(),
            role: Role::Admin,
            name: user.full_name(),
            must_change_password: false,
            batches: vec![],
            courses: vec![],
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        }
    }

    #[test]
    fn tokens_stop_working_once_the_user_is_locked_out() {
        let now = Utc::now();
        let trainer = user(Role::Trainer, true, Some(now + Duration::days(2)));
        let claims = claims_for(&trainer);

        let caller = admit(&claims, Some(&trainer), now).unwrap();
        assert_eq!(caller.id, trainer.id);
        // the stored role wins over whatever the token claims
        assert_eq!(caller.role, Role::Trainer);

        let deactivated = UserData {
            is_active: false,
            access_expiry_date: None,
            ..trainer.clone()
        };
        assert!(matches!(
            admit(&claims, Some(&deactivated), now),
            Err(Error::AuthenticationFailure { .. })
        ));

        let expired = UserData {
            access_expiry_date: Some(now - Duration::minutes(5)),
            ..trainer.clone()
        };
        assert!(matches!(
            admit(&claims, Some(&expired), now),
            Err(Error::AuthenticationFailure { .. })
        ));

        assert!(matches!(
            admit(&claims, None, now),
            Err(Error::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn role_guard_denies_other_roles() {
        let caller = AuthUser {
            id: Uuid::new_v4(),
            username: "t@example.com".into(),
            role: Role::Trainer,
        };
        assert!(caller.require(&[Role::Admin, Role::Trainer]).is_ok());
        assert!(matches!(
            caller.require_admin(),
            Err(Error::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn login_ignores_username_case() {
        let pg = match crate::testing::database().await {
            Some(pg) => pg,
            None => return,
        };
        let student = crate::testing::user(&pg, Role::Student).await;
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(student.id)
            .bind(hash_password("correct horse").unwrap())
            .execute(&pg)
            .await
            .unwrap();
        let state = crate::testing::state(std::sync::Arc::new(
            crate::notify::testing::RecordingNotifier::default(),
        ));

        let payload = login(
            Extension(pg),
            Extension(state),
            Json(LoginRequest {
                username: format!(" {} ", student.email.to_uppercase()),
                password: "correct horse".into(),
            }),
        )
        .await;
        let logged_in = crate::testing::unwrap_payload(payload).unwrap();
        assert!(!logged_in.access.is_empty());
    }
}
