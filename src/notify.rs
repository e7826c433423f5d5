use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::config::{Config, MailTransport};
use crate::Error;

const SIGNATURE: &str = "Best regards,\nThe Parc Platform Team";

/// A rendered plain-text mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Mail {
    pub fn student_credentials(first_name: &str, email: &str, password: &str) -> Mail {
        Mail {
            to: email.to_string(),
            subject: "Your Parc Platform Account Credentials".to_string(),
            body: format!(
                "Hi {},\n\nAn account has been created for you on the Parc Platform. \
                 Please use the following temporary credentials to log in. \
                 You will be required to change your password upon your first login.\n\n\
                 Username: {}\nPassword: {}\n\n{}",
                first_name, email, password, SIGNATURE
            ),
        }
    }

    pub fn trainer_credentials(
        first_name: &str,
        email: &str,
        password: &str,
        valid_until: DateTime<Utc>,
    ) -> Mail {
        Mail {
            to: email.to_string(),
            subject: "Your Parc Platform Login Credentials".to_string(),
            body: format!(
                "Hi {},\n\nYou have been assigned to a new schedule. \
                 Please use the following temporary credentials to log in.\n\n\
                 Username: {}\nPassword: {}\n\n\
                 Your access will be valid until: {}\n\n{}",
                first_name,
                email,
                password,
                valid_until.format("%Y-%m-%d %H:%M"),
                SIGNATURE
            ),
        }
    }

    pub fn application_approved(first_name: &str, email: &str) -> Mail {
        Mail {
            to: email.to_string(),
            subject: "Your Application has been Approved!".to_string(),
            body: format!(
                "Hi {},\n\nCongratulations! Your application to become a trainer at Parc Platform \
                 has been approved. You will receive another email with your login credentials \
                 once you have been assigned to your first schedule.\n\n{}",
                first_name, SIGNATURE
            ),
        }
    }

    pub fn application_declined(name: &str, email: &str) -> Mail {
        Mail {
            to: email.to_string(),
            subject: "Update on your Parc Platform Application".to_string(),
            body: format!(
                "Hi {},\n\nThank you for your interest in becoming a trainer at Parc Platform. \
                 After careful review we are unable to move forward with your application \
                 at this time.\n\n{}",
                name, SIGNATURE
            ),
        }
    }
}

/// Mail delivery bound to the write that caused it.
///
/// `send` runs inside the caller's open transaction. A transport that
/// persists mail must do so through `tx`, so the mail is kept only if the
/// write commits.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, tx: &mut Transaction<'_, Postgres>, mail: &Mail) -> Result<(), Error>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

pub fn from_config(config: &Config) -> SharedNotifier {
    match config.mail_transport {
        MailTransport::Log => Arc::new(LogNotifier {
            from: config.mail_from.clone(),
        }),
        MailTransport::Outbox => Arc::new(OutboxNotifier {
            from: config.mail_from.clone(),
        }),
    }
}

pub struct LogNotifier {
    from: String,
}

/// Mail bodies with every `Password:` line blanked out.
pub fn redacted(body: &str) -> String {
    body.lines()
        .map(|line| {
            if line.trim_start().starts_with("Password:") {
                "Password: ********"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, _tx: &mut Transaction<'_, Postgres>, mail: &Mail) -> Result<(), Error> {
        log::info!(
            "mail from={} to={} subject={:?}",
            self.from,
            mail.to,
            mail.subject
        );
        log::debug!("mail body for {}:\n{}", mail.to, redacted(&mail.body));
        Ok(())
    }
}

pub struct OutboxNotifier {
    from: String,
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, tx: &mut Transaction<'_, Postgres>, mail: &Mail) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO mail_outbox (id, sender, recipient, subject, body) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(&self.from)
        .bind(&mail.to)
        .bind(&mail.subject)
        .bind(&mail.body)
        .execute(&mut *tx)
        .await
        .map_err(|err| Error::NotificationFailed {
            message: format!("Could not queue mail for {}: {}", mail.to, err),
        })?;
        log::info!("queued mail for {} ({})", mail.to, mail.subject);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every mail instead of delivering it; optionally fails.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Mail>>,
        pub fail: bool,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn sent(&self) -> Vec<Mail> {
            self.sent.lock().unwrap().clone()
        }

        pub fn record(&self, mail: &Mail) -> Result<(), Error> {
            if self.fail {
                return Err(Error::NotificationFailed {
                    message: format!("refusing to deliver to {}", mail.to),
                });
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            mail: &Mail,
        ) -> Result<(), Error> {
            self.record(mail)
        }
    }
}
