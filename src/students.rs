//! Student roster: listing, search, create, edit and activation toggle.

use std::sync::Arc;

use axum::{
    Extension, Form,
    extract::{Path, State},
    response::Redirect,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::app::AppState;
use crate::error::AppError;
use crate::login::hash_password;
use crate::models::{AccountStatus, FeeStatus, Role, RowId, SessionUser, USERS, User};
use crate::store::{Backend, Order, Query, StoreError, decode_rows};
use crate::views::{Flash, redirect_with};

const ROSTER_PAGE: &str = "/instructor?section=students";

/// Form posted by the create and edit dialogs.
#[derive(Debug, Default, Deserialize)]
pub struct StudentForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub status: Option<String>,
    pub cuota_status: Option<String>,
}

/// A roster line as rendered by the dashboard.
#[derive(Debug, Serialize)]
pub struct StudentCard {
    pub id: RowId,
    pub name: String,
    pub username: String,
    pub initial: String,
    pub active: bool,
    pub status: &'static str,
    pub fee_status: &'static str,
    pub fee_label: &'static str,
}

impl From<&User> for StudentCard {
    fn from(user: &User) -> Self {
        let fee = user.cuota_status.unwrap_or(FeeStatus::Unknown);
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            username: user.username.clone(),
            initial: user
                .name
                .chars()
                .next()
                .map(|c| c.to_uppercase().collect())
                .unwrap_or_else(|| "?".to_string()),
            active: user.status == AccountStatus::Active,
            status: user.status.as_str(),
            fee_status: fee.as_str(),
            fee_label: fee.label(),
        }
    }
}

/// Base query for the students an instructor manages.
pub fn roster_query(instructor: &SessionUser) -> Query {
    Query::table(USERS)
        .eq("role", Role::STUDENT)
        .eq_opt("gym_id", instructor.gym_id.as_ref().map(RowId::to_value))
}

pub async fn list_students(
    backend: &dyn Backend,
    instructor: &SessionUser,
) -> Result<Vec<User>, StoreError> {
    let rows = backend
        .select(
            &roster_query(instructor)
                .select(&["id", "name", "username", "role", "status", "cuota_status", "gym_id", "created_at"])
                .order("name", Order::Asc),
        )
        .await?;
    Ok(decode_rows(USERS, rows))
}

/// Case-insensitive substring match on name or username.
pub fn filter_students<'a>(students: &'a [User], search: &str) -> Vec<&'a User> {
    let needle = search.trim().to_lowercase();
    students
        .iter()
        .filter(|student| {
            needle.is_empty()
                || student.name.to_lowercase().contains(&needle)
                || student.username.to_lowercase().contains(&needle)
        })
        .collect()
}

fn conflict_message(e: StoreError) -> AppError {
    match e {
        StoreError::Conflict(_) => AppError::Validation("That username already exists.".into()),
        other => AppError::Store(other),
    }
}

pub async fn create_student(
    backend: &dyn Backend,
    instructor: &SessionUser,
    form: &StudentForm,
) -> Result<User, AppError> {
    let name = form.name.trim();
    let username = form.username.trim();
    if name.is_empty() || username.is_empty() {
        return Err(AppError::Validation("Name and username are required.".into()));
    }
    if form.password.trim().is_empty() {
        return Err(AppError::Validation("A password is required for new students.".into()));
    }

    let row = backend
        .insert(
            USERS,
            json!({
                "name": name,
                "username": username,
                "password": hash_password(form.password.trim())?,
                "role": Role::STUDENT,
                "status": AccountStatus::Active.as_str(),
                "gym_id": instructor.gym_value(),
            }),
        )
        .await
        .map_err(conflict_message)?;

    serde_json::from_value(row).map_err(|e| AppError::Store(e.into()))
}

pub async fn update_student(
    backend: &dyn Backend,
    instructor: &SessionUser,
    id: &str,
    form: &StudentForm,
) -> Result<(), AppError> {
    let name = form.name.trim();
    let username = form.username.trim();
    if name.is_empty() || username.is_empty() {
        return Err(AppError::Validation("Name and username are required.".into()));
    }

    let mut changes = Map::new();
    changes.insert("name".into(), Value::from(name));
    changes.insert("username".into(), Value::from(username));
    if let Some(status) = form.status.as_deref().filter(|s| !s.is_empty()) {
        changes.insert("status".into(), Value::from(AccountStatus::from(status.to_string()).as_str()));
    }
    if let Some(fee) = form.cuota_status.as_deref() {
        let fee = FeeStatus::from(fee.to_string());
        let value = match fee {
            FeeStatus::Unknown => Value::Null,
            known => Value::from(known.as_str()),
        };
        changes.insert("cuota_status".into(), value);
    }
    if !form.password.trim().is_empty() {
        changes.insert("password".into(), Value::from(hash_password(form.password.trim())?));
    }

    let updated = backend
        .update(&roster_query(instructor).eq("id", id), Value::Object(changes))
        .await
        .map_err(conflict_message)?;

    if updated == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

/// Flips `ACTIVO` and `INACTIVO`; returns the new status.
pub async fn toggle_student_status(
    backend: &dyn Backend,
    instructor: &SessionUser,
    id: &str,
) -> Result<AccountStatus, AppError> {
    let query = roster_query(instructor).eq("id", id);
    let rows = backend.select(&query.clone().select(&["id", "status"]).limit(1)).await?;
    let current = rows
        .first()
        .and_then(|row| row.get("status"))
        .and_then(Value::as_str)
        .map(|status| AccountStatus::from(status.to_string()))
        .ok_or(AppError::NotFound)?;

    let next = current.toggled();
    backend.update(&query, json!({ "status": next.as_str() })).await?;
    Ok(next)
}

fn outcome_redirect(result: Result<String, AppError>, fallback: &str) -> Redirect {
    match result {
        Ok(message) => redirect_with(ROSTER_PAGE, Flash::Notice(message)),
        Err(AppError::Validation(message)) => redirect_with(ROSTER_PAGE, Flash::Error(message)),
        Err(AppError::NotFound) => redirect_with(ROSTER_PAGE, Flash::Error("Student not found.".into())),
        Err(e) => {
            error!("{fallback}: {e}");
            redirect_with(ROSTER_PAGE, Flash::Error(fallback.to_string()))
        }
    }
}

pub async fn handle_create_student(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Form(form): Form<StudentForm>,
) -> Redirect {
    let result = create_student(state.backend.as_ref(), &instructor, &form)
        .await
        .map(|student| {
            info!("{} created student {}", instructor.username, student.username);
            format!("Student {} created.", student.name)
        });
    outcome_redirect(result, "Could not create the student.")
}

pub async fn handle_update_student(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Path(id): Path<String>,
    Form(form): Form<StudentForm>,
) -> Redirect {
    let result = update_student(state.backend.as_ref(), &instructor, &id, &form)
        .await
        .map(|()| "Student updated.".to_string());
    outcome_redirect(result, "Could not save the student.")
}

pub async fn handle_toggle_student(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Redirect {
    let result = toggle_student_status(state.backend.as_ref(), &instructor, &id)
        .await
        .map(|status| match status {
            AccountStatus::Active => "Student activated.".to_string(),
            AccountStatus::Inactive => "Student deactivated.".to_string(),
        });
    outcome_redirect(result, "Could not change the student status.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::authenticate;
    use crate::store::LocalBackend;
    use tempfile::TempDir;

    fn instructor(gym: Option<&str>) -> SessionUser {
        SessionUser {
            id: "coach".into(),
            name: "Coach".into(),
            username: "coach".into(),
            role: Role::INSTRUCTOR.into(),
            status: AccountStatus::Active,
            cuota_status: None,
            gym_id: gym.map(RowId::from),
        }
    }

    fn form(name: &str, username: &str, password: &str) -> StudentForm {
        StudentForm {
            name: name.into(),
            username: username.into(),
            password: password.into(),
            ..StudentForm::default()
        }
    }

    async fn backend(dir: &TempDir) -> LocalBackend {
        LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap()
    }

    #[tokio::test]
    async fn create_validates_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let coach = instructor(Some("g1"));

        let err = create_student(&backend, &coach, &form(" ", "ana", "pw")).await.unwrap_err();
        assert_eq!(err.to_string(), "Name and username are required.");

        let err = create_student(&backend, &coach, &form("Ana", "ana", "")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let ana = create_student(&backend, &coach, &form(" Ana Perez ", " ana ", "pw")).await.unwrap();
        assert_eq!(ana.name, "Ana Perez");
        assert_eq!(ana.username, "ana");
        assert_eq!(ana.gym_id, Some(RowId::from("g1")));
        assert_eq!(ana.role, Role::STUDENT);

        let err = create_student(&backend, &coach, &form("Other", "ana", "pw")).await.unwrap_err();
        assert_eq!(err.to_string(), "That username already exists.");
    }

    #[tokio::test]
    async fn roster_is_scoped_sorted_and_searchable() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let coach = instructor(Some("g1"));

        create_student(&backend, &coach, &form("Zoe", "zoe", "pw")).await.unwrap();
        create_student(&backend, &coach, &form("Ana", "ana.p", "pw")).await.unwrap();
        create_student(&backend, &instructor(Some("g2")), &form("Bea", "bea", "pw")).await.unwrap();

        let students = list_students(&backend, &coach).await.unwrap();
        let names: Vec<&str> = students.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Zoe"]);

        assert_eq!(filter_students(&students, "ANA").len(), 1);
        assert_eq!(filter_students(&students, "p").len(), 1);
        assert_eq!(filter_students(&students, "  ").len(), 2);

        let everyone = list_students(&backend, &instructor(None)).await.unwrap();
        assert_eq!(everyone.len(), 3);
    }

    #[tokio::test]
    async fn edit_keeps_password_unless_given() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let coach = instructor(None);
        let ana = create_student(&backend, &coach, &form("Ana", "ana", "first")).await.unwrap();

        let mut edit = form("Ana Maria", "ana", "");
        edit.cuota_status = Some("VENCIDA".into());
        update_student(&backend, &coach, ana.id.as_str(), &edit).await.unwrap();
        let user = authenticate(&backend, "ana", "first").await.unwrap();
        assert_eq!(user.name, "Ana Maria");
        assert_eq!(user.cuota_status, Some(FeeStatus::Expired));

        update_student(&backend, &coach, ana.id.as_str(), &form("Ana Maria", "ana", "second"))
            .await
            .unwrap();
        assert!(authenticate(&backend, "ana", "first").await.is_err());
        assert!(authenticate(&backend, "ana", "second").await.is_ok());

        let missing = update_student(&backend, &coach, "nope", &form("X", "x", "")).await;
        assert!(matches!(missing, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn toggling_blocks_and_restores_login() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        let coach = instructor(None);
        let ana = create_student(&backend, &coach, &form("Ana", "ana", "pw")).await.unwrap();

        let status = toggle_student_status(&backend, &coach, ana.id.as_str()).await.unwrap();
        assert_eq!(status, AccountStatus::Inactive);
        assert!(authenticate(&backend, "ana", "pw").await.is_err());

        let status = toggle_student_status(&backend, &coach, ana.id.as_str()).await.unwrap();
        assert_eq!(status, AccountStatus::Active);
        assert!(authenticate(&backend, "ana", "pw").await.is_ok());
    }

    #[test]
    fn cards_show_initial_and_fee_badge() {
        let user: User = serde_json::from_value(json!({
            "id": 1, "name": "ana", "username": "ana", "cuota_status": "POR_VENCER",
        }))
        .unwrap();
        let card = StudentCard::from(&user);
        assert_eq!(card.initial, "A");
        assert_eq!(card.fee_label, "Due soon");
        assert!(card.active);
    }
}
