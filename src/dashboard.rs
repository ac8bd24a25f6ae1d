//! The two role dashboards, assembled from the section modules.

use std::sync::Arc;

use axum::{
    Extension,
    extract::{Query, State},
    response::Html,
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::attendance::{
    self, AttendanceEntry, AttendanceFilter, apply_filter, checked_in_on, count_on, distinct_students,
    student_history,
};
use crate::error::AppError;
use crate::exercises::{CatalogPage, CatalogRequest, MUSCLE_GROUPS};
use crate::models::{FeeStatus, RowId, SessionUser};
use crate::notifications::TEMPLATES;
use crate::overview::{Stats, fetch_stats};
use crate::routines::{RoutineRow, display_timestamp, latest_for_student, list_routines};
use crate::store::StoreError;
use crate::students::{StudentCard, filter_students, list_students};
use crate::views::Feedback;

const SECTIONS: [(&str, &str); 5] = [
    ("overview", "Overview"),
    ("students", "Students"),
    ("routines", "Routines"),
    ("attendance", "Attendance"),
    ("notifications", "Notifications"),
];

#[derive(Debug, Serialize)]
struct NavItem {
    id: &'static str,
    label: &'static str,
    active: bool,
}

/// An entry of a student `<select>`.
#[derive(Debug, Serialize)]
struct Choice {
    id: RowId,
    name: String,
    selected: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstructorQuery {
    pub section: Option<String>,
    pub q: Option<String>,
    pub date: Option<String>,
    pub student: Option<String>,
    pub notice: Option<String>,
    pub warn: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
struct StudentsSection {
    search: String,
    total: usize,
    total_label: String,
    cards: Vec<StudentCard>,
}

#[derive(Serialize)]
struct RoutinesSection {
    rows: Vec<RoutineRow>,
    students: Vec<Choice>,
}

#[derive(Serialize)]
struct AttendanceSection {
    rows: Vec<AttendanceEntry>,
    today_count: usize,
    filter: AttendanceFilter,
    filtered: bool,
    students: Vec<Choice>,
    export_query: String,
}

#[derive(Serialize)]
struct TemplateCard {
    index: usize,
    label: &'static str,
    title: &'static str,
    body: &'static str,
}

#[derive(Serialize)]
struct NotificationsSection {
    templates: Vec<TemplateCard>,
    students: Vec<Choice>,
    push_enabled: bool,
}

#[derive(Serialize)]
struct InstructorPage {
    user: SessionUser,
    first_name: String,
    section: &'static str,
    nav: Vec<NavItem>,
    feedback: Feedback,
    overview: Option<Stats>,
    students: Option<StudentsSection>,
    routines: Option<RoutinesSection>,
    attendance: Option<AttendanceSection>,
    notifications: Option<NotificationsSection>,
}

/// Logs a failed section load and reports it on the page instead of failing it.
fn or_report<T: Default>(result: Result<T, StoreError>, what: &str, feedback: &mut Feedback) -> T {
    result.unwrap_or_else(|e| {
        error!("Could not load {what}: {e}");
        feedback
            .error
            .get_or_insert_with(|| format!("Could not load {what}."));
        T::default()
    })
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// `GET /instructor?section=...`
pub async fn serve_instructor_dashboard(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(query): Query<InstructorQuery>,
) -> Result<Html<String>, AppError> {
    let backend = state.backend.as_ref();
    let section = SECTIONS
        .iter()
        .map(|(id, _)| *id)
        .find(|id| Some(*id) == query.section.as_deref())
        .unwrap_or("overview");

    let mut feedback = Feedback {
        notice: query.notice.clone(),
        warn: query.warn.clone(),
        error: query.error.clone(),
    };
    let mut page = InstructorPage {
        first_name: user.first_name().to_string(),
        user: user.clone(),
        section,
        nav: SECTIONS
            .iter()
            .map(|&(id, label)| NavItem { id, label, active: id == section })
            .collect(),
        feedback: Feedback::default(),
        overview: None,
        students: None,
        routines: None,
        attendance: None,
        notifications: None,
    };

    match section {
        "students" => {
            let students = or_report(list_students(backend, &user).await, "students", &mut feedback);
            let search = query.q.clone().unwrap_or_default();
            page.students = Some(StudentsSection {
                total: students.len(),
                total_label: plural(students.len(), "registered student"),
                cards: filter_students(&students, &search)
                    .into_iter()
                    .map(StudentCard::from)
                    .collect(),
                search,
            });
        }
        "routines" => {
            let rows = or_report(list_routines(backend, &user).await, "routines", &mut feedback);
            let students = or_report(list_students(backend, &user).await, "students", &mut feedback);
            page.routines = Some(RoutinesSection {
                rows,
                students: students
                    .into_iter()
                    .map(|s| Choice { id: s.id, name: s.name, selected: false })
                    .collect(),
            });
        }
        "attendance" => {
            let entries = or_report(
                attendance::gym_attendance(backend, &user).await,
                "attendance",
                &mut feedback,
            );
            let filter = AttendanceFilter {
                date: query.date.clone(),
                student: query.student.clone(),
            };
            let students = distinct_students(&entries)
                .into_iter()
                .map(|(id, name)| Choice {
                    selected: query.student.as_deref() == Some(id.as_str()),
                    id,
                    name,
                })
                .collect();
            page.attendance = Some(AttendanceSection {
                today_count: count_on(&entries, attendance::today()),
                rows: apply_filter(&entries, &filter),
                filtered: filter.is_active(),
                export_query: filter.to_query(),
                filter,
                students,
            });
        }
        "notifications" => {
            let students = or_report(list_students(backend, &user).await, "students", &mut feedback);
            page.notifications = Some(NotificationsSection {
                templates: TEMPLATES
                    .iter()
                    .enumerate()
                    .map(|(index, t)| TemplateCard { index, label: t.label, title: t.title, body: t.body })
                    .collect(),
                students: students
                    .into_iter()
                    .map(|s| Choice { id: s.id, name: s.name, selected: false })
                    .collect(),
                push_enabled: state.config.vapid.is_some(),
            });
        }
        _ => {
            page.overview = Some(fetch_stats(backend, &user, attendance::today()).await);
        }
    }

    page.feedback = feedback;
    state.views.render("instructor", &page)
}

#[derive(Debug, Default, Deserialize)]
pub struct StudentQuery {
    pub tab: Option<String>,
    pub group: Option<String>,
    pub count: Option<usize>,
    pub search: Option<String>,
    pub notice: Option<String>,
    pub warn: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
struct FeeBadge {
    status: &'static str,
    label: &'static str,
}

#[derive(Serialize)]
struct RoutineCard {
    name: String,
    assigned_on: String,
}

#[derive(Serialize)]
struct HistoryItem {
    date_label: String,
    status: String,
    present: bool,
}

#[derive(Serialize)]
struct GroupChip {
    id: &'static str,
    label: &'static str,
    active: bool,
}

#[derive(Serialize)]
struct StudentPage {
    user: SessionUser,
    first_name: String,
    tab: &'static str,
    feedback: Feedback,
    fee: Option<FeeBadge>,
    today_label: String,
    checked_in_today: bool,
    routine: Option<RoutineCard>,
    history: Vec<HistoryItem>,
    history_label: String,
    groups: Vec<GroupChip>,
    exercises: Option<CatalogPage>,
    push_key: Option<String>,
}

/// `GET /student?tab=home|exercises`
pub async fn serve_student_dashboard(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(query): Query<StudentQuery>,
) -> Result<Html<String>, AppError> {
    let backend = state.backend.as_ref();
    let tab = match query.tab.as_deref() {
        Some("exercises") => "exercises",
        _ => "home",
    };
    let mut feedback = Feedback {
        notice: query.notice.clone(),
        warn: query.warn.clone(),
        error: query.error.clone(),
    };
    let today = attendance::today();

    let mut page = StudentPage {
        first_name: user.first_name().to_string(),
        fee: user
            .cuota_status
            .filter(|fee| *fee != FeeStatus::Unknown)
            .map(|fee| FeeBadge { status: fee.as_str(), label: fee.label() }),
        user: user.clone(),
        tab,
        feedback: Feedback::default(),
        today_label: today.format("%A %-d %B").to_string(),
        checked_in_today: false,
        routine: None,
        history: Vec::new(),
        history_label: String::new(),
        groups: Vec::new(),
        exercises: None,
        push_key: state.config.vapid.as_ref().map(|v| v.public_key.clone()),
    };

    if tab == "exercises" {
        let request = CatalogRequest {
            group: query.group.clone(),
            count: query.count,
            search: query.search.clone(),
        };
        let catalog = state.exercises.browse(&request).await;
        page.groups = MUSCLE_GROUPS
            .iter()
            .map(|g| GroupChip { id: g.id, label: g.label, active: g.id == catalog.group })
            .collect();
        page.exercises = Some(catalog);
    } else {
        let (history, routine) = futures::join!(
            student_history(backend, &user.id),
            latest_for_student(backend, &user.id),
        );
        let history = or_report(history, "attendance history", &mut feedback);
        let routine = or_report(routine, "routine", &mut feedback);

        page.checked_in_today = checked_in_on(&history, today);
        page.history_label = plural(history.len(), "session");
        page.history = history
            .iter()
            .map(|record| HistoryItem {
                date_label: attendance::display_date(&record.date),
                status: record.status_label().to_string(),
                present: record.is_present(),
            })
            .collect();
        page.routine = routine.map(|routine| RoutineCard {
            assigned_on: display_timestamp(routine.created_at.as_deref()),
            name: routine.name,
        });
    }

    page.feedback = feedback;
    state.views.render("student", &page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plural_labels() {
        assert_eq!(plural(1, "session"), "1 session");
        assert_eq!(plural(0, "session"), "0 sessions");
        assert_eq!(plural(3, "registered student"), "3 registered students");
    }

    #[test]
    fn failed_loads_are_reported_once() {
        let mut feedback = Feedback::default();
        let first: Vec<u8> = or_report(Err(StoreError::Unsupported), "students", &mut feedback);
        let _: Vec<u8> = or_report(Err(StoreError::Unsupported), "routines", &mut feedback);
        assert!(first.is_empty());
        assert_eq!(feedback.error.as_deref(), Some("Could not load students."));
    }
}
