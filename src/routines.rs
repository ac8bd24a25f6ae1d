//! Routine PDFs: upload to object storage, signed downloads, deletion.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension,
    extract::{Multipart, Path, Query as QueryParams, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app::AppState;
use crate::error::AppError;
use crate::models::{ROUTINES, ROUTINES_BUCKET, Routine, RowId, SessionUser, USERS, User};
use crate::store::{Backend, Order, Query, StoreError, decode_rows};
use crate::students::roster_query;
use crate::views::{Flash, redirect_with};

/// Lifetime of a download link, in seconds.
pub const SIGNED_URL_TTL: u64 = 3600;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

const PDF: &str = "application/pdf";
const ROUTINES_PAGE: &str = "/instructor?section=routines";

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// File name with every whitespace run replaced by `_`.
pub fn safe_file_name(name: &str) -> String {
    WHITESPACE.replace_all(name, "_").into_owned()
}

/// Storage path of an uploaded routine: `{student}/{millis}_{name}`.
pub fn object_path(student_id: &str, file_name: &str, millis: i64) -> String {
    format!("{student_id}/{millis}_{}", safe_file_name(file_name))
}

/// Short date of a `created_at` timestamp.
pub fn display_timestamp(created_at: Option<&str>) -> String {
    created_at
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.format("%-d %b %Y").to_string())
        .or_else(|| created_at.map(|raw| raw.chars().take(10).collect()))
        .unwrap_or_default()
}

/// A routine joined with its student's name.
#[derive(Debug, Clone, Serialize)]
pub struct RoutineRow {
    pub id: RowId,
    pub name: String,
    pub student_name: String,
    pub created_on: String,
}

pub async fn list_routines(
    backend: &dyn Backend,
    instructor: &SessionUser,
) -> Result<Vec<RoutineRow>, StoreError> {
    let students = backend
        .select(&roster_query(instructor).select(&["id", "name"]))
        .await?;
    let names: HashMap<RowId, String> = decode_rows::<User>(USERS, students)
        .into_iter()
        .map(|user| (user.id, user.name))
        .collect();

    let rows = backend
        .select(
            &Query::table(ROUTINES)
                .select(&["id", "nombre", "file_url", "created_at", "student_id", "gym_id"])
                .eq_opt("gym_id", instructor.gym_id.as_ref().map(RowId::to_value))
                .order("created_at", Order::Desc),
        )
        .await?;

    Ok(decode_rows::<Routine>(ROUTINES, rows)
        .into_iter()
        .map(|routine| RoutineRow {
            student_name: routine
                .student_id
                .as_ref()
                .and_then(|id| names.get(id).cloned())
                .unwrap_or_else(|| "—".to_string()),
            created_on: display_timestamp(routine.created_at.as_deref()),
            id: routine.id,
            name: routine.name,
        })
        .collect())
}

/// A routine upload as read from the multipart form.
#[derive(Debug, Default)]
pub struct Upload {
    pub student_id: String,
    pub name: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub async fn upload_routine(
    backend: &dyn Backend,
    instructor: &SessionUser,
    upload: Upload,
    millis: i64,
) -> Result<Routine, AppError> {
    let student_id = upload.student_id.trim();
    if student_id.is_empty() || upload.file_name.is_empty() {
        return Err(AppError::Validation("Select a student and a PDF file.".into()));
    }
    if upload.content_type != PDF {
        return Err(AppError::Validation("Only PDF files are accepted.".into()));
    }

    let path = object_path(student_id, &upload.file_name, millis);
    backend.upload(ROUTINES_BUCKET, &path, upload.bytes, PDF).await?;

    let name = match upload.name.trim() {
        "" => upload.file_name.as_str(),
        given => given,
    };
    let row = json!({
        "student_id": student_id,
        "gym_id": instructor.gym_value(),
        "profesor_id": instructor.id.to_value(),
        "nombre": name,
        "file_url": path,
    });

    match backend.insert(ROUTINES, row).await {
        Ok(stored) => serde_json::from_value(stored).map_err(|e| AppError::Store(e.into())),
        Err(e) => {
            if let Err(cleanup) = backend.remove(ROUTINES_BUCKET, &[path.clone()]).await {
                warn!("Could not remove orphaned object {path}: {cleanup}");
            }
            Err(e.into())
        }
    }
}

pub async fn find_routine(
    backend: &dyn Backend,
    instructor: &SessionUser,
    id: &str,
) -> Result<Routine, AppError> {
    let rows = backend
        .select(
            &Query::table(ROUTINES)
                .eq("id", id)
                .eq_opt("gym_id", instructor.gym_id.as_ref().map(RowId::to_value))
                .limit(1),
        )
        .await?;
    decode_rows::<Routine>(ROUTINES, rows)
        .into_iter()
        .next()
        .ok_or(AppError::NotFound)
}

pub async fn download_url(backend: &dyn Backend, routine: &Routine) -> Result<String, StoreError> {
    backend
        .signed_url(ROUTINES_BUCKET, &routine.file_url, SIGNED_URL_TTL)
        .await
}

/// Removes the stored object, then the row.
pub async fn delete_routine(
    backend: &dyn Backend,
    instructor: &SessionUser,
    id: &str,
) -> Result<Routine, AppError> {
    let routine = find_routine(backend, instructor, id).await?;
    if !routine.file_url.is_empty() {
        if let Err(e) = backend.remove(ROUTINES_BUCKET, &[routine.file_url.clone()]).await {
            warn!("Could not remove object {}: {e}", routine.file_url);
        }
    }
    backend.delete(&Query::table(ROUTINES).eq("id", id)).await?;
    Ok(routine)
}

/// The student's most recently assigned routine.
pub async fn latest_for_student(
    backend: &dyn Backend,
    student_id: &RowId,
) -> Result<Option<Routine>, StoreError> {
    let rows = backend
        .select(
            &Query::table(ROUTINES)
                .eq("student_id", student_id.to_value())
                .order("created_at", Order::Desc)
                .limit(1),
        )
        .await?;
    Ok(decode_rows(ROUTINES, rows).into_iter().next())
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut upload = Upload::default();
    let malformed = |e: axum::extract::multipart::MultipartError| AppError::MalformedPayload(e.to_string());

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "student_id" => upload.student_id = field.text().await.map_err(malformed)?,
            "name" => upload.name = field.text().await.map_err(malformed)?,
            "file" => {
                upload.file_name = field.file_name().unwrap_or_default().to_string();
                upload.content_type = field.content_type().unwrap_or_default().to_string();
                upload.bytes = field.bytes().await.map_err(malformed)?.to_vec();
            }
            _ => {}
        }
    }

    Ok(upload)
}

pub async fn handle_upload_routine(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    multipart: Multipart,
) -> Redirect {
    let result = match read_upload(multipart).await {
        Ok(upload) => {
            let millis = Utc::now().timestamp_millis();
            upload_routine(state.backend.as_ref(), &instructor, upload, millis).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(routine) => {
            info!("{} uploaded routine {}", instructor.username, routine.file_url);
            redirect_with(ROUTINES_PAGE, Flash::Notice("Routine uploaded.".into()))
        }
        Err(AppError::Validation(message)) => redirect_with(ROUTINES_PAGE, Flash::Error(message)),
        Err(e) => {
            error!("Routine upload failed: {e}");
            redirect_with(ROUTINES_PAGE, Flash::Error("Could not upload the routine.".into()))
        }
    }
}

pub async fn handle_instructor_download(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<Redirect, AppError> {
    let routine = find_routine(state.backend.as_ref(), &instructor, &id).await?;
    let url = download_url(state.backend.as_ref(), &routine).await?;
    Ok(Redirect::to(&url))
}

pub async fn handle_delete_routine(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Redirect {
    match delete_routine(state.backend.as_ref(), &instructor, &id).await {
        Ok(routine) => {
            info!("{} deleted routine {}", instructor.username, routine.file_url);
            redirect_with(ROUTINES_PAGE, Flash::Notice("Routine deleted.".into()))
        }
        Err(AppError::NotFound) => redirect_with(ROUTINES_PAGE, Flash::Error("Routine not found.".into())),
        Err(e) => {
            error!("Routine delete failed: {e}");
            redirect_with(ROUTINES_PAGE, Flash::Error("Could not delete the routine.".into()))
        }
    }
}

pub async fn handle_student_download(
    State(state): State<Arc<AppState>>,
    Extension(student): Extension<SessionUser>,
) -> Redirect {
    let backend = state.backend.as_ref();
    let url = match latest_for_student(backend, &student.id).await {
        Ok(Some(routine)) => download_url(backend, &routine).await.map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };

    match url {
        Ok(Some(url)) => Redirect::to(&url),
        Ok(None) => redirect_with(
            "/student",
            Flash::Warn("Your instructor has not assigned a routine yet.".into()),
        ),
        Err(e) => {
            error!("Routine link for {} failed: {e}", student.username);
            redirect_with("/student", Flash::Error("Could not open the routine.".into()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub token: String,
}

/// Serves objects behind the local backend's signed URLs.
pub async fn serve_signed_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, path)): Path<(String, String)>,
    QueryParams(query): QueryParams<SignedQuery>,
) -> Result<Response, AppError> {
    let bytes = state
        .backend
        .open_signed(&bucket, &path, query.expires, &query.token)
        .await
        .map_err(|e| match e {
            StoreError::Unsupported => AppError::NotFound,
            other => AppError::Store(other),
        })?;

    let content_type = if path.to_ascii_lowercase().ends_with(".pdf") {
        PDF
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
