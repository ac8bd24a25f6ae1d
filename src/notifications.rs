//! Notification composer and canned templates for the instructor.

use std::sync::Arc;

use axum::{
    Extension, Form,
    extract::{Path, State},
    response::Redirect,
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::error::AppError;
use crate::models::{RowId, SessionUser};
use crate::push::{PushOutcome, PushRequest, PushSender, dispatch};
use crate::store::Backend;
use crate::students::list_students;
use crate::views::{Flash, redirect_with};

const NOTIFICATIONS_PAGE: &str = "/instructor?section=notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Template {
    pub label: &'static str,
    pub title: &'static str,
    pub body: &'static str,
}

pub const TEMPLATES: [Template; 4] = [
    Template {
        label: "Fee due soon",
        title: "Your fee is due soon",
        body: "Remember that your monthly fee is due in the next few days.",
    },
    Template {
        label: "Fee expired",
        title: "Your fee has expired",
        body: "Your monthly fee has expired. Please get up to date to keep training.",
    },
    Template {
        label: "New routine",
        title: "New routine available",
        body: "Your instructor uploaded a new routine. Open the app to download it.",
    },
    Template {
        label: "Training reminder",
        title: "Time to train!",
        body: "Don't forget your session today. We're waiting for you at the gym!",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    All,
    One,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeForm {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub target: Audience,
    #[serde(default)]
    pub student_id: Option<String>,
}

/// Resolves the audience to user ids.
async fn recipients(
    backend: &dyn Backend,
    instructor: &SessionUser,
    form: &ComposeForm,
) -> Result<Vec<RowId>, AppError> {
    match form.target {
        Audience::One => {
            let id = form
                .student_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| AppError::Validation("Select a student.".into()))?;
            Ok(vec![RowId::from(id)])
        }
        Audience::All => Ok(list_students(backend, instructor)
            .await?
            .into_iter()
            .map(|student| student.id)
            .collect()),
    }
}

/// Validates the form, sends it, and words the result for the instructor.
pub async fn compose(
    backend: &dyn Backend,
    sender: &dyn PushSender,
    instructor: &SessionUser,
    form: &ComposeForm,
) -> Result<Flash, AppError> {
    let title = form.title.trim();
    let body = form.body.trim();
    if title.is_empty() || body.is_empty() {
        return Err(AppError::Validation("Title and message are required.".into()));
    }

    let targets = recipients(backend, instructor, form).await?;
    if targets.is_empty() {
        return Err(AppError::Validation("There are no students to notify.".into()));
    }

    let outcome = dispatch(backend, sender, &PushRequest::new(targets, title, body)).await?;
    Ok(feedback(&outcome))
}

pub fn feedback(outcome: &PushOutcome) -> Flash {
    if outcome.sent == 0 && outcome.message.is_some() {
        return Flash::Warn("The recipients have no notifications enabled on their devices.".into());
    }

    let devices = if outcome.sent == 1 { "device" } else { "devices" };
    Flash::Notice(format!("Notification sent to {} {devices}.", outcome.sent))
}

fn outcome_redirect(result: Result<Flash, AppError>) -> Redirect {
    match result {
        Ok(flash) => redirect_with(NOTIFICATIONS_PAGE, flash),
        Err(AppError::Validation(message)) => redirect_with(NOTIFICATIONS_PAGE, Flash::Error(message)),
        Err(e) => {
            error!("Notification failed: {e}");
            redirect_with(
                NOTIFICATIONS_PAGE,
                Flash::Error("Could not send the notification.".into()),
            )
        }
    }
}

pub async fn handle_compose(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Form(form): Form<ComposeForm>,
) -> Redirect {
    let result = compose(state.backend.as_ref(), state.push.as_ref(), &instructor, &form).await;
    outcome_redirect(result)
}

/// Sends one of the canned templates to every student.
pub async fn handle_send_template(
    State(state): State<Arc<AppState>>,
    Extension(instructor): Extension<SessionUser>,
    Path(index): Path<usize>,
) -> Redirect {
    let Some(template) = TEMPLATES.get(index) else {
        return redirect_with(NOTIFICATIONS_PAGE, Flash::Error("Unknown template.".into()));
    };

    let form = ComposeForm {
        title: template.title.to_string(),
        body: template.body.to_string(),
        target: Audience::All,
        student_id: None,
    };
    let result = compose(state.backend.as_ref(), state.push.as_ref(), &instructor, &form).await;
    outcome_redirect(result)
}
