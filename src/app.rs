use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::Method,
    middleware,
    routing::{get, post},
};
use log::{info, warn};
use tokio::{
    net::TcpListener,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::attendance::{handle_check_in, handle_export};
use crate::config::Config;
use crate::dashboard::{serve_instructor_dashboard, serve_student_dashboard};
use crate::error::AppError;
use crate::exercises::{ExerciseClient, handle_catalog, proxy_exercises};
use crate::login::{
    current_user, handle_login, handle_logout, require_auth, require_instructor, require_student,
    serve_home, serve_login_page,
};
use crate::notifications::{handle_compose, handle_send_template};
use crate::push::{
    DisabledSender, PushSender, WebPushSender, handle_send_push, handle_subscribe,
    serve_public_key,
};
use crate::routines::{
    MAX_UPLOAD_BYTES, handle_delete_routine, handle_instructor_download, handle_student_download,
    handle_upload_routine, serve_signed_object,
};
use crate::store::{Backend, LocalBackend, RestBackend};
use crate::students::{handle_create_student, handle_toggle_student, handle_update_student};
use crate::views::{Views, icon, manifest, service_worker, stylesheet};

/// Shared state handed to every handler.
pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn Backend>,
    pub push: Arc<dyn PushSender>,
    pub exercises: ExerciseClient,
    pub views: Views,
}

impl AppState {
    /// Picks the hosted backend when one is configured and the on-disk
    /// store otherwise.
    pub async fn from_config(config: Config) -> Result<Self, AppError> {
        let backend: Arc<dyn Backend> = match &config.remote {
            Some(remote) => {
                info!("Using hosted backend at {}", remote.url);
                Arc::new(RestBackend::new(remote)?)
            }
            None => {
                info!("Using local store in {}", config.data_dir.display());
                Arc::new(LocalBackend::open(&config.data_dir, config.signing_secret.clone()).await?)
            }
        };

        let push: Arc<dyn PushSender> = match &config.vapid {
            Some(vapid) => Arc::new(
                WebPushSender::new(vapid).map_err(|e| AppError::Config(e.to_string()))?,
            ),
            None => {
                warn!("VAPID keys not set, push notifications are disabled");
                Arc::new(DisabledSender)
            }
        };

        Self::with_parts(config, backend, push)
    }

    pub fn with_parts(
        config: Config,
        backend: Arc<dyn Backend>,
        push: Arc<dyn PushSender>,
    ) -> Result<Self, AppError> {
        let exercises = ExerciseClient::new(&config.exercise_api_url)
            .map_err(|e| AppError::Config(format!("exercise client: {e}")))?;

        Ok(Self {
            config,
            backend,
            push,
            exercises,
            views: Views::new()?,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let instructor = Router::new()
        .route("/instructor", get(serve_instructor_dashboard))
        .route("/instructor/students", post(handle_create_student))
        .route("/instructor/students/:id", post(handle_update_student))
        .route("/instructor/students/:id/toggle", post(handle_toggle_student))
        .route(
            "/instructor/routines",
            post(handle_upload_routine).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/instructor/routines/:id/download", get(handle_instructor_download))
        .route("/instructor/routines/:id/delete", post(handle_delete_routine))
        .route("/instructor/attendance/export", get(handle_export))
        .route("/instructor/notifications", post(handle_compose))
        .route(
            "/instructor/notifications/templates/:index",
            post(handle_send_template),
        )
        .route("/api/send-push", post(handle_send_push))
        .route_layer(middleware::from_fn(require_instructor));

    let student = Router::new()
        .route("/student", get(serve_student_dashboard))
        .route("/student/attendance", post(handle_check_in))
        .route("/student/routine/download", get(handle_student_download))
        .route_layer(middleware::from_fn(require_student));

    let protected = Router::new()
        .route("/", get(serve_home))
        .route("/api/me", get(current_user))
        .route("/api/push/subscribe", post(handle_subscribe))
        .route("/api/exercises/catalog", get(handle_catalog))
        .merge(instructor)
        .merge(student)
        .route_layer(middleware::from_fn(require_auth));

    let exercise_proxy = Router::new()
        .route("/api/exercises", get(proxy_exercises))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::OPTIONS]),
        );

    Router::new()
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/logout", get(handle_logout).post(handle_logout))
        .route("/api/push/key", get(serve_public_key))
        .route("/storage/:bucket/*path", get(serve_signed_object))
        .route("/sw.js", get(service_worker))
        .route("/manifest.webmanifest", get(manifest))
        .route("/app.css", get(stylesheet))
        .route("/icon.svg", get(icon))
        .merge(exercise_proxy)
        .merge(protected)
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let address = config.address();
    let state = Arc::new(AppState::from_config(config).await?);
    let app = router(state);

    let listener = TcpListener::bind(&address).await?;
    info!("Listening on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
