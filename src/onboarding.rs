//! Student onboarding from uploaded CSV rosters.
//!
//! Parsing and planning are pure; [`onboard`] applies a plan, creating one
//! student per transaction so that a failed credentials mail only loses that
//! row.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{generate_password, hash_password};
use crate::models::{Role, UserData};
use crate::notify::{Mail, Notifier};
use crate::users::insert_user;
use crate::Error;

/// Splits one CSV line, honouring quotes and doubled quotes inside them.
pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

/// Splits text into CSV records, each paired with the 1-based line it
/// starts on. Line breaks inside quoted fields stay part of the record.
pub fn split_records(text: &str) -> Vec<(usize, String)> {
    let mut records = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut start = 1;
    for ch in text.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                buf.push(ch);
            }
            '\n' if in_quotes => {
                line += 1;
                buf.push(ch);
            }
            '\n' => {
                line += 1;
                if buf.ends_with('\r') {
                    buf.pop();
                }
                records.push((start, std::mem::take(&mut buf)));
                start = line;
            }
            _ => buf.push(ch),
        }
    }
    if !buf.is_empty() {
        records.push((start, buf));
    }
    records
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRow {
    /// 1-based line in the file; the header is line 1.
    pub line: usize,
    pub name: String,
    pub email: String,
    pub course: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub rows: Vec<RosterRow>,
    pub errors: Vec<String>,
}

struct Columns {
    name: usize,
    email: usize,
    course: Option<usize>,
}

impl Columns {
    fn locate(header: &[String]) -> Result<Columns, Error> {
        let find = |wanted: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(wanted))
        };
        match (find("name"), find("email")) {
            (Some(name), Some(email)) => Ok(Columns {
                name,
                email,
                course: find("course"),
            }),
            _ => Err(Error::invalid(
                "Invalid file format. The file must contain 'name' and 'email' columns.",
            )),
        }
    }
}

fn cell(record: &[String], index: usize) -> &str {
    record.get(index).map(|v| v.trim()).unwrap_or_default()
}

/// Reads a roster. Whole-file problems are returned as an error; row
/// problems are collected in [`Roster::errors`] and the row is dropped.
pub fn parse_roster(bytes: &[u8]) -> Result<Roster, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::invalid("The uploaded file must be a UTF-8 encoded CSV file."))?;
    let text = text.trim_start_matches('\u{feff}');

    let mut records = split_records(text)
        .into_iter()
        .filter(|(_, record)| !record.trim().is_empty());

    let (_, header) = records
        .next()
        .ok_or_else(|| Error::invalid("The uploaded file is empty."))?;
    let columns = Columns::locate(&parse_csv_record(&header))?;

    let mut roster = Roster::default();
    let mut seen: HashSet<String> = HashSet::new();
    for (line, raw) in records {
        let record = parse_csv_record(&raw);
        let name = cell(&record, columns.name);
        let email = cell(&record, columns.email).to_lowercase();
        let course = columns
            .course
            .map(|idx| cell(&record, idx))
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if name.is_empty() || email.is_empty() {
            roster
                .errors
                .push(format!("Row {}: Missing name or email.", line));
            continue;
        }
        if !email.contains('@') {
            roster
                .errors
                .push(format!("Row {}: Invalid email address `{}`.", line, email));
            continue;
        }
        if !seen.insert(email.clone()) {
            roster.errors.push(format!(
                "Row {}: Duplicate email `{}` in the uploaded file.",
                line, email
            ));
            continue;
        }
        roster.rows.push(RosterRow {
            line,
            name: name.to_string(),
            email,
            course,
        });
    }

    if roster.rows.is_empty() && roster.errors.is_empty() {
        return Err(Error::invalid("The uploaded file contains no student rows."));
    }
    Ok(roster)
}

/// What to do with roster rows whose email already has an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingUsers {
    Skip,
    AttachStudents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    Create,
    Attach(Uuid),
    Skip,
    Reject(String),
}

pub fn plan(
    rows: &[RosterRow],
    existing: &HashMap<String, (Uuid, Role)>,
    policy: ExistingUsers,
) -> Vec<RowAction> {
    rows.iter()
        .map(|row| match (existing.get(&row.email), policy) {
            (None, _) => RowAction::Create,
            (Some(_), ExistingUsers::Skip) => RowAction::Skip,
            (Some((id, Role::Student)), ExistingUsers::AttachStudents) => RowAction::Attach(*id),
            (Some((_, role)), ExistingUsers::AttachStudents) => RowAction::Reject(format!(
                "Row {}: `{}` belongs to a {:?} account and cannot join a batch.",
                row.line, row.email, role
            )),
        })
        .collect()
}

/// Where created students go.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub batch_id: Option<Uuid>,
    pub college: Option<String>,
    /// Used when a row does not name a course.
    pub course: Option<String>,
    /// Abort on the first problem instead of collecting row errors.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedStudent {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OnboardingReport {
    pub created: Vec<CreatedStudent>,
    pub attached: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

impl OnboardingReport {
    pub fn applied(&self) -> usize {
        self.created.len() + self.attached.len()
    }

    pub fn status(&self) -> String {
        format!(
            "{} students created, {} added to batch, {} skipped, {} errors.",
            self.created.len(),
            self.attached.len(),
            self.skipped.len(),
            self.errors.len()
        )
    }
}

async fn existing_accounts(
    pg: &PgPool,
    rows: &[RosterRow],
) -> Result<HashMap<String, (Uuid, Role)>, Error> {
    let emails: Vec<String> = rows.iter().map(|row| row.email.clone()).collect();
    let found = sqlx::query_as::<_, (String, Uuid, Role)>(
        "SELECT email, id, role FROM users WHERE email = ANY($1)",
    )
    .bind(&emails)
    .fetch_all(pg)
    .await?;
    Ok(found
        .into_iter()
        .map(|(email, id, role)| (email, (id, role)))
        .collect())
}

async fn create_student(
    pg: &PgPool,
    notifier: &dyn Notifier,
    row: &RosterRow,
    target: &Target,
) -> Result<Uuid, Error> {
    let password = generate_password();
    let mut student = UserData::new(&row.name, &row.email, Role::Student, hash_password(&password)?);
    student.must_change_password = true;
    student.course = row.course.clone().or_else(|| target.course.clone());
    student.college = target.college.clone();

    let mut tx = pg.begin().await?;
    insert_user(&mut tx, &student).await?;
    if let Some(batch_id) = target.batch_id {
        sqlx::query("INSERT INTO batch_students (batch_id, student_id) VALUES ($1, $2)")
            .bind(batch_id)
            .bind(student.id)
            .execute(&mut tx)
            .await?;
    }
    notifier
        .send(
            &mut tx,
            &Mail::student_credentials(&student.first_name, &student.email, &password),
        )
        .await?;
    tx.commit().await?;
    Ok(student.id)
}

pub async fn onboard(
    pg: &PgPool,
    notifier: &dyn Notifier,
    roster: Roster,
    policy: ExistingUsers,
    target: &Target,
) -> Result<OnboardingReport, Error> {
    if target.strict && !roster.errors.is_empty() {
        return Err(Error::BulkRejected {
            errors: roster.errors,
        });
    }

    let existing = existing_accounts(pg, &roster.rows).await?;
    let actions = plan(&roster.rows, &existing, policy);

    let mut report = OnboardingReport {
        errors: roster.errors,
        ..OnboardingReport::default()
    };
    for (row, action) in roster.rows.iter().zip(actions) {
        match action {
            RowAction::Create => match create_student(pg, notifier, row, target).await {
                Ok(id) => report.created.push(CreatedStudent {
                    id,
                    email: row.email.clone(),
                }),
                Err(err) if target.strict => return Err(err),
                Err(err) => {
                    log::warn!("roster row {} ({}) failed: {}", row.line, row.email, err);
                    report.errors.push(format!("Row {}: {}", row.line, err));
                }
            },
            RowAction::Attach(student_id) => {
                if let Some(batch_id) = target.batch_id {
                    sqlx::query(
                        "INSERT INTO batch_students (batch_id, student_id) VALUES ($1, $2) \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind(batch_id)
                    .bind(student_id)
                    .execute(pg)
                    .await?;
                }
                report.attached.push(row.email.clone());
            }
            RowAction::Skip => report.skipped.push(row.email.clone()),
            RowAction::Reject(reason) if target.strict => {
                return Err(Error::BulkRejected {
                    errors: vec![reason],
                })
            }
            RowAction::Reject(reason) => report.errors.push(reason),
        }
    }

    if !report.errors.is_empty() && report.applied() == 0 {
        return Err(Error::BulkRejected {
            errors: report.errors,
        });
    }
    log::info!("roster processed: {}", report.status());
    Ok(report)
}
