use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Trainer,
    Student,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "material_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MaterialType {
    Pdf,
    Ppt,
    Doc,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "assessment_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AssessmentType {
    Test,
    Assignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bill_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BillStatus {
    Pending,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "application_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "expense_type")]
pub enum ExpenseType {
    Travel,
    Accommodation,
    Food,
    Materials,
    Other,
}

/// Stored in place of a hash for accounts that cannot log in yet.
pub const UNUSABLE_PASSWORD: &str = "!";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserData {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub expertise: Option<String>,
    pub experience: Option<i32>,
    pub phone: Option<String>,
    pub course: Option<String>,
    pub college: Option<String>,
    pub resume: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
    pub must_change_password: bool,
    pub access_expiry_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserData {
    /// Fresh account with the username taken from the (lower-cased) email.
    pub fn new(full_name: &str, email: &str, role: Role, password_hash: String) -> UserData {
        let (first_name, last_name) = split_name(full_name);
        let email = email.trim().to_lowercase();
        UserData {
            id: Uuid::new_v4(),
            username: email.clone(),
            email,
            first_name,
            last_name,
            role,
            expertise: None,
            experience: None,
            phone: None,
            course: None,
            college: None,
            resume: None,
            password_hash,
            is_active: true,
            must_change_password: false,
            access_expiry_date: None,
            created_at: Utc::now(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// `"Ada King Lovelace"` -> `("Ada", "King Lovelace")`
pub fn split_name(full_name: &str) -> (String, String) {
    let trimmed = full_name.trim();
    match trimmed.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollegeData {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub contact_person: String,
    pub contact_email: String,
    pub contact_phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CourseData {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub cover_photo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BatchData {
    pub id: Uuid,
    pub course_id: Uuid,
    pub college_id: Option<Uuid>,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MaterialData {
    pub id: Uuid,
    pub title: String,
    pub course_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: MaterialType,
    pub content: String,
    pub uploader_id: Option<Uuid>,
    pub duration_in_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleData {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub college_id: Uuid,
    pub course: String,
    pub batch_id: Option<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApplicationData {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub experience: i32,
    pub tech_stack: String,
    pub expertise_domains: String,
    pub resume: Option<String>,
    pub status: ApplicationStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillData {
    pub id: Uuid,
    pub trainer_id: Uuid,
    pub date: NaiveDate,
    pub status: BillStatus,
    pub invoice_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExpenseData {
    pub id: Uuid,
    pub bill_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: ExpenseType,
    pub description: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssessmentData {
    pub id: Uuid,
    pub title: String,
    pub course: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: AssessmentType,
    pub total_marks: i32,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttemptData {
    pub id: Uuid,
    pub student_id: Uuid,
    pub assessment_id: Uuid,
    pub score: i32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_split_on_first_space() {
        assert_eq!(
            split_name("Ada King Lovelace"),
            ("Ada".to_string(), "King Lovelace".to_string())
        );
        assert_eq!(split_name("  Plato "), ("Plato".to_string(), String::new()));
    }

    #[test]
    fn new_users_are_keyed_by_lower_case_email() {
        let user = UserData::new("Ada Lovelace", " Ada@Example.COM ", Role::Student, "x".into());
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.username, user.email);
        assert_eq!(user.full_name(), "Ada Lovelace");
        assert!(user.is_active);
    }

    #[test]
    fn roles_use_upper_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&Role::Trainer).unwrap(), "\"TRAINER\"");
        let parsed: MaterialType = serde_json::from_str("\"VIDEO\"").unwrap();
        assert_eq!(parsed, MaterialType::Video);
    }
}
