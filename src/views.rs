//! Page templates, flash messages and the installable shell assets.

use axum::{
    http::header,
    response::{Html, IntoResponse, Redirect},
};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

const TEMPLATES: [(&str, &str); 4] = [
    ("login", include_str!("./static/login.hbs")),
    ("instructor", include_str!("./static/instructor.hbs")),
    ("student", include_str!("./static/student.hbs")),
    ("unknown_role", include_str!("./static/unknown_role.hbs")),
];

/// Registry of the embedded page templates.
pub struct Views {
    registry: Handlebars<'static>,
}

impl Views {
    pub fn new() -> Result<Self, AppError> {
        let mut registry = Handlebars::new();
        registry
            .register_partial("head", include_str!("./static/head.hbs"))
            .map_err(|e| AppError::Config(format!("head partial: {e}")))?;

        for (name, source) in TEMPLATES {
            registry
                .register_template_string(name, source)
                .map_err(|e| AppError::Config(format!("{name} template: {e}")))?;
        }

        Ok(Self { registry })
    }

    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<Html<String>, AppError> {
        Ok(Html(self.registry.render(name, data)?))
    }
}

/// One-shot message carried through a redirect in the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flash {
    Notice(String),
    Warn(String),
    Error(String),
}

impl Flash {
    fn key(&self) -> &'static str {
        match self {
            Flash::Notice(_) => "notice",
            Flash::Warn(_) => "warn",
            Flash::Error(_) => "error",
        }
    }

    fn message(&self) -> &str {
        match self {
            Flash::Notice(message) | Flash::Warn(message) | Flash::Error(message) => message,
        }
    }
}

/// Flash messages as read back from the query string.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Feedback {
    pub notice: Option<String>,
    pub warn: Option<String>,
    pub error: Option<String>,
}

pub fn flash_url(path: &str, flash: &Flash) -> String {
    let separator = if path.contains('?') { '&' } else { '?' };
    format!(
        "{path}{separator}{}={}",
        flash.key(),
        urlencoding::encode(flash.message())
    )
}

pub fn redirect_with(path: &str, flash: Flash) -> Redirect {
    Redirect::to(&flash_url(path, &flash))
}

pub fn redirect_with_error(path: &str, message: &str) -> Redirect {
    redirect_with(path, Flash::Error(message.to_string()))
}

pub async fn service_worker() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        include_str!("./static/sw.js"),
    )
}

pub async fn manifest() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/manifest+json")],
        include_str!("./static/manifest.webmanifest"),
    )
}

pub async fn stylesheet() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/css")],
        include_str!("./static/app.css"),
    )
}

pub async fn icon() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "image/svg+xml")],
        include_str!("./static/icon.svg"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flash_urls_encode_and_append() {
        assert_eq!(
            flash_url("/login", &Flash::Error("Fill in all fields.".into())),
            "/login?error=Fill%20in%20all%20fields."
        );
        assert_eq!(
            flash_url("/instructor?section=students", &Flash::Notice("Saved".into())),
            "/instructor?section=students&notice=Saved"
        );
    }

    #[test]
    fn templates_register_and_escape() {
        let views = Views::new().unwrap();
        let Html(page) = views
            .render("login", &json!({ "error": "<b>bad</b>" }))
            .unwrap();
        assert!(page.contains("&lt;b&gt;bad&lt;/b&gt;"));
        assert!(!page.contains("<b>bad</b>"));
    }
}
