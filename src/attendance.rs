//! Attendance: daily self check-in for students and the instructor listing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension,
    extract::{Query as QueryParams, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{NaiveDate, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app::AppState;
use crate::downloader;
use crate::error::AppError;
use crate::models::{ATTENDANCES, Attendance, RowId, SessionUser, USERS, User};
use crate::store::{Backend, Order, Query, StoreError, decode_rows};
use crate::views::{Flash, redirect_with};

/// Records shown in a student's history.
pub const HISTORY_LIMIT: usize = 30;

/// Records loaded for the instructor listing.
pub const LISTING_LIMIT: usize = 200;

/// The current calendar date in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Long human form of a `YYYY-MM-DD` date; unparsable values pass through.
pub fn display_date(date: &str) -> String {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|d| d.format("%a %-d %b %Y").to_string())
        .unwrap_or_else(|_| date.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckIn {
    Recorded,
    AlreadyRecorded,
}

/// Marks the student present for `day`, at most once.
pub async fn check_in(
    backend: &dyn Backend,
    student: &SessionUser,
    day: NaiveDate,
) -> Result<CheckIn, StoreError> {
    let date = date_key(day);
    let existing = backend
        .count(
            &Query::table(ATTENDANCES)
                .eq("student_id", student.id.to_value())
                .eq("date", date.as_str()),
        )
        .await?;
    if existing > 0 {
        return Ok(CheckIn::AlreadyRecorded);
    }

    let row = json!({
        "student_id": student.id.to_value(),
        "gym_id": student.gym_value(),
        "date": date,
        "status": Attendance::PRESENT,
    });
    match backend.insert(ATTENDANCES, row).await {
        Ok(_) => Ok(CheckIn::Recorded),
        Err(StoreError::Conflict(_)) => Ok(CheckIn::AlreadyRecorded),
        Err(e) => Err(e),
    }
}

/// Latest records of one student, newest first.
pub async fn student_history(
    backend: &dyn Backend,
    student_id: &RowId,
) -> Result<Vec<Attendance>, StoreError> {
    let rows = backend
        .select(
            &Query::table(ATTENDANCES)
                .select(&["id", "date", "status", "student_id"])
                .eq("student_id", student_id.to_value())
                .order("date", Order::Desc)
                .limit(HISTORY_LIMIT),
        )
        .await?;
    Ok(decode_rows(ATTENDANCES, rows))
}

pub fn checked_in_on(history: &[Attendance], day: NaiveDate) -> bool {
    let key = date_key(day);
    history.iter().any(|record| record.date == key)
}

/// An attendance row joined with its student's name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub id: RowId,
    pub date: String,
    pub date_label: String,
    pub status: String,
    pub student_id: Option<RowId>,
    pub student_name: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct AttendanceFilter {
    pub date: Option<String>,
    pub student: Option<String>,
}

impl AttendanceFilter {
    fn date(&self) -> Option<&str> {
        self.date.as_deref().filter(|d| !d.is_empty())
    }

    fn student(&self) -> Option<&str> {
        self.student.as_deref().filter(|s| !s.is_empty())
    }

    pub fn is_active(&self) -> bool {
        self.date().is_some() || self.student().is_some()
    }

    pub fn matches(&self, entry: &AttendanceEntry) -> bool {
        self.date().is_none_or(|date| entry.date == date)
            && self
                .student()
                .is_none_or(|student| entry.student_id.as_ref().is_some_and(|id| id.as_str() == student))
    }

    /// Query-string form, used by the export links.
    pub fn to_query(&self) -> String {
        let mut pairs = Vec::new();
        if let Some(date) = self.date() {
            pairs.push(format!("date={}", urlencoding::encode(date)));
        }
        if let Some(student) = self.student() {
            pairs.push(format!("student={}", urlencoding::encode(student)));
        }
        pairs.join("&")
    }
}

/// Latest gym records, newest first, joined with student names.
pub async fn gym_attendance(
    backend: &dyn Backend,
    instructor: &SessionUser,
) -> Result<Vec<AttendanceEntry>, StoreError> {
    let rows = backend
        .select(
            &Query::table(ATTENDANCES)
                .select(&["id", "date", "status", "student_id"])
                .eq_opt("gym_id", instructor.gym_id.as_ref().map(RowId::to_value))
                .order("date", Order::Desc)
                .limit(LISTING_LIMIT),
        )
        .await?;
    let records: Vec<Attendance> = decode_rows(ATTENDANCES, rows);

    let mut ids: Vec<RowId> = records.iter().filter_map(|r| r.student_id.clone()).collect();
    ids.sort();
    ids.dedup();

    let names: HashMap<RowId, String> = if ids.is_empty() {
        HashMap::new()
    } else {
        let rows = backend
            .select(
                &Query::table(USERS)
                    .select(&["id", "name"])
                    .is_in("id", ids.iter().map(RowId::to_value)),
            )
            .await?;
        decode_rows::<User>(USERS, rows)
            .into_iter()
            .map(|user| (user.id, user.name))
            .collect()
    };

    Ok(records
        .into_iter()
        .map(|record| {
            let student_name = record
                .student_id
                .as_ref()
                .and_then(|id| names.get(id).cloned())
                .unwrap_or_else(|| "—".to_string());
            AttendanceEntry {
                date_label: display_date(&record.date),
                status: record.status_label().to_string(),
                id: record.id,
                date: record.date,
                student_id: record.student_id,
                student_name,
            }
        })
        .collect())
}

pub fn apply_filter(entries: &[AttendanceEntry], filter: &AttendanceFilter) -> Vec<AttendanceEntry> {
    entries.iter().filter(|e| filter.matches(e)).cloned().collect()
}

/// Students appearing in the listing, in first-seen order.
pub fn distinct_students(entries: &[AttendanceEntry]) -> Vec<(RowId, String)> {
    let mut seen = Vec::<(RowId, String)>::new();
    for entry in entries {
        if let Some(id) = &entry.student_id {
            if !seen.iter().any(|(known, _)| known == id) {
                seen.push((id.clone(), entry.student_name.clone()));
            }
        }
    }
    seen
}

pub fn count_on(entries: &[AttendanceEntry], day: NaiveDate) -> usize {
    let key = date_key(day);
    entries.iter().filter(|e| e.date == key).count()
}

pub async fn handle_check_in(
    State(state): State<Arc<AppState>>,
    Extension(student): Extension<SessionUser>,
) -> Redirect {
    match check_in(state.backend.as_ref(), &student, today()).await {
        Ok(CheckIn::Recorded) => {
            info!("{} checked in", student.username);
            redirect_with("/student", Flash::Notice("Attendance registered. Have a good session!".into()))
        }
        Ok(CheckIn::AlreadyRecorded) => {
            redirect_with("/student", Flash::Warn("You already registered your attendance today.".into()))
        }
        Err(e) => {
            error!("Check-in for {} failed: {e}", student.username);
            redirect_with("/student", Flash::Error("Could not register attendance. Try again.".into()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    #[serde(flatten)]
    pub filter: AttendanceFilter,
}

/// Downloads the (filtered) listing as CSV or XLSX.
pub async fn handle_export(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    QueryParams(query): QueryParams<ExportQuery>,
) -> Result<Response, AppError> {
    let entries = gym_attendance(state.backend.as_ref(), &instructor).await?;
    let entries = apply_filter(&entries, &query.filter);
    let stamp = date_key(today());

    match query.format.as_deref().unwrap_or("csv") {
        "csv" => {
            let body = downloader::to_csv(&entries);
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"attendance-{stamp}.csv\""),
                    ),
                ],
                body,
            )
                .into_response())
        }
        "xlsx" => {
            let body = downloader::to_xlsx(&entries).map_err(AppError::InternalError)?;
            Ok((
                [
                    (
                        header::CONTENT_TYPE,
                        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"attendance-{stamp}.xlsx\""),
                    ),
                ],
                body,
            )
                .into_response())
        }
        other => Err(AppError::Validation(format!("Unknown export format: {other}"))),
    }
}
