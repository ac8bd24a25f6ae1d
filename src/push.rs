//! Web-push fan-out: stored subscriptions, VAPID delivery, counting.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Extension, Json,
    extract::State,
    response::{IntoResponse, Response},
};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, URL_SAFE_NO_PAD, VapidSignatureBuilder,
    WebPushClient, WebPushError, WebPushMessage, WebPushMessageBuilder,
};

use crate::app::AppState;
use crate::config::VapidConfig;
use crate::error::AppError;
use crate::models::{PUSH_SUBSCRIPTIONS, PushSubscription, RowId, SessionUser, SubscriptionRow};
use crate::store::{Backend, Query, decode_rows};

#[derive(Error, Debug)]
pub enum PushError {
    #[error("push delivery is not configured")]
    NotConfigured,

    #[error("subscription is no longer valid")]
    Gone,

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Delivers one encrypted payload to one subscription.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

/// VAPID-signed delivery over the standard web-push protocol.
pub struct WebPushSender {
    client: IsahcWebPushClient,
    private_key: String,
    subject: String,
}

impl WebPushSender {
    pub fn new(config: &VapidConfig) -> Result<Self, PushError> {
        let client = IsahcWebPushClient::new().map_err(|e| PushError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            private_key: config.private_key.clone(),
            subject: config.subject.clone(),
        })
    }
}

impl WebPushSender {
    /// Encrypts `payload` for one subscription and signs it with the VAPID key.
    fn sign(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<WebPushMessage, PushError> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut signature = VapidSignatureBuilder::from_base64(&self.private_key, URL_SAFE_NO_PAD, &info)
            .map_err(|e| PushError::InvalidSubscription(e.to_string()))?;
        signature.add_claim("sub", self.subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| PushError::InvalidSubscription(e.to_string()))?;

        let mut message = WebPushMessageBuilder::new(&info);
        message.set_payload(ContentEncoding::Aes128Gcm, payload);
        message.set_vapid_signature(signature);
        message
            .build()
            .map_err(|e| PushError::InvalidSubscription(e.to_string()))
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let message = self.sign(subscription, payload)?;

        match self.client.send(message).await {
            Ok(()) => Ok(()),
            Err(WebPushError::EndpointNotValid { .. } | WebPushError::EndpointNotFound { .. }) => {
                Err(PushError::Gone)
            }
            Err(e) => Err(PushError::Delivery(e.to_string())),
        }
    }
}

/// Stand-in used when no VAPID identity is configured: every delivery fails.
pub struct DisabledSender;

#[async_trait]
impl PushSender for DisabledSender {
    async fn send(&self, _subscription: &PushSubscription, _payload: &[u8]) -> Result<(), PushError> {
        Err(PushError::NotConfigured)
    }
}

fn default_url() -> String {
    "/".to_string()
}

/// Body of `POST /api/send-push`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    #[serde(default)]
    pub user_id: Option<RowId>,
    #[serde(default)]
    pub user_ids: Option<Vec<RowId>>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_url")]
    pub url: String,
}

impl PushRequest {
    pub fn new(user_ids: Vec<RowId>, title: &str, body: &str) -> Self {
        Self {
            user_id: None,
            user_ids: Some(user_ids),
            title: Some(title.to_string()),
            body: Some(body.to_string()),
            url: default_url(),
        }
    }

    /// `userIds` wins over `userId`.
    pub fn targets(&self) -> Vec<RowId> {
        match (&self.user_ids, &self.user_id) {
            (Some(ids), _) => ids.clone(),
            (None, Some(id)) => vec![id.clone()],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    url: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub sent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Sends the request's payload to every stored subscription of its
/// targets, in parallel, and counts the successes.
#[tracing::instrument(skip_all, fields(title = request.title.as_deref()))]
pub async fn dispatch(
    backend: &dyn Backend,
    sender: &dyn PushSender,
    request: &PushRequest,
) -> Result<PushOutcome, AppError> {
    let targets = request.targets();
    if targets.is_empty() {
        return Err(AppError::Validation("userId or userIds required".into()));
    }

    let rows = backend
        .select(
            &Query::table(PUSH_SUBSCRIPTIONS)
                .select(&["user_id", "subscription"])
                .is_in("user_id", targets.iter().map(RowId::to_value)),
        )
        .await?;
    let rows: Vec<SubscriptionRow> = decode_rows(PUSH_SUBSCRIPTIONS, rows);
    if rows.is_empty() {
        return Ok(PushOutcome {
            sent: 0,
            total: None,
            message: Some("No subscriptions registered".into()),
        });
    }

    let payload = serde_json::to_vec(&Payload {
        title: request.title.as_deref(),
        body: request.body.as_deref(),
        url: &request.url,
    })
    .map_err(|e| AppError::InternalError(Box::new(e)))?;

    let deliveries = rows.iter().map(|row| {
        let payload = &payload;
        async move {
            let subscription: PushSubscription = serde_json::from_value(row.subscription.clone())
                .map_err(|e| PushError::InvalidSubscription(e.to_string()))?;
            sender.send(&subscription, payload).await
        }
    });
    let results = join_all(deliveries).await;

    let mut sent = 0;
    for (row, result) in rows.iter().zip(results) {
        match result {
            Ok(()) => sent += 1,
            Err(PushError::Gone) => {
                info!("Dropping expired subscription of user {}", row.user_id);
                let query = Query::table(PUSH_SUBSCRIPTIONS).eq("user_id", row.user_id.to_value());
                if let Err(e) = backend.delete(&query).await {
                    warn!("Could not drop subscription of user {}: {e}", row.user_id);
                }
            }
            Err(e) => warn!("Push to user {} failed: {e}", row.user_id),
        }
    }
    debug!("Push delivered to {sent} of {} subscriptions", rows.len());

    Ok(PushOutcome {
        sent,
        total: Some(rows.len()),
        message: None,
    })
}

pub async fn handle_send_push(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushOutcome>, AppError> {
    let outcome = dispatch(state.backend.as_ref(), state.push.as_ref(), &request).await?;
    Ok(Json(outcome))
}

/// Stores the caller's browser subscription, replacing any previous one.
pub async fn handle_subscribe(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Json(subscription): Json<Value>,
) -> Result<Json<Value>, AppError> {
    serde_json::from_value::<PushSubscription>(subscription.clone())
        .map_err(|e| AppError::MalformedPayload(e.to_string()))?;

    state
        .backend
        .upsert(
            PUSH_SUBSCRIPTIONS,
            json!({ "user_id": user.id.to_value(), "subscription": subscription }),
            "user_id",
        )
        .await?;
    info!("{} enabled push notifications", user.username);

    Ok(Json(json!({ "ok": true })))
}

pub async fn serve_public_key(State(state): State<Arc<AppState>>) -> Response {
    match &state.config.vapid {
        Some(vapid) => Json(json!({ "publicKey": vapid.public_key })).into_response(),
        None => AppError::NotFound.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalBackend;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records payloads; endpoints containing "gone" or "fail" are refused.
    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl PushSender for Recorder {
        async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
            if subscription.endpoint.contains("gone") {
                return Err(PushError::Gone);
            }
            if subscription.endpoint.contains("fail") {
                return Err(PushError::Delivery("503".into()));
            }
            let payload = serde_json::from_slice(payload).unwrap();
            self.delivered
                .lock()
                .unwrap()
                .push((subscription.endpoint.clone(), payload));
            Ok(())
        }
    }

    async fn subscribe(backend: &LocalBackend, user: &str, endpoint: &str) {
        backend
            .upsert(
                PUSH_SUBSCRIPTIONS,
                json!({
                    "user_id": user,
                    "subscription": { "endpoint": endpoint, "keys": { "p256dh": "p", "auth": "a" } },
                }),
                "user_id",
            )
            .await
            .unwrap();
    }

    fn request(body: Value) -> PushRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn user_ids_take_precedence() {
        let req = request(json!({ "userId": "a", "userIds": ["b", 3] }));
        assert_eq!(req.targets(), vec![RowId::from("b"), RowId::from("3")]);
        assert_eq!(req.url, "/");

        let req = request(json!({ "userId": 7 }));
        assert_eq!(req.targets(), vec![RowId::from("7")]);

        assert!(request(json!({ "title": "x" })).targets().is_empty());
    }

    #[tokio::test]
    async fn no_targets_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        let err = dispatch(&backend, &Recorder::default(), &request(json!({ "title": "x" })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "userId or userIds required");
    }

    #[tokio::test]
    async fn no_subscriptions_reports_a_message() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        let outcome = dispatch(&backend, &Recorder::default(), &request(json!({ "userId": "a" })))
            .await
            .unwrap();
        assert_eq!(outcome.sent, 0);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({ "sent": 0, "message": "No subscriptions registered" })
        );
    }

    #[tokio::test]
    async fn counts_successes_and_drops_gone_subscriptions() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        subscribe(&backend, "a", "https://push.example/ok").await;
        subscribe(&backend, "b", "https://push.example/gone").await;
        subscribe(&backend, "c", "https://push.example/fail").await;
        subscribe(&backend, "d", "https://push.example/other").await;

        let recorder = Recorder::default();
        let req = request(json!({ "userIds": ["a", "b", "c"], "title": "Hi", "body": "Train today" }));
        let outcome = dispatch(&backend, &recorder, &req).await.unwrap();

        assert_eq!(outcome, PushOutcome { sent: 1, total: Some(3), message: None });
        let delivered = recorder.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![(
            "https://push.example/ok".to_string(),
            json!({ "title": "Hi", "body": "Train today", "url": "/" })
        )]);

        let left = backend.count(&Query::table(PUSH_SUBSCRIPTIONS)).await.unwrap();
        assert_eq!(left, 3);
    }

    #[tokio::test]
    async fn malformed_subscription_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        backend
            .insert(PUSH_SUBSCRIPTIONS, json!({ "user_id": "a", "subscription": { "endpoint": "x" } }))
            .await
            .unwrap();

        let outcome = dispatch(&backend, &Recorder::default(), &request(json!({ "userId": "a" })))
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome { sent: 0, total: Some(1), message: None });
    }

    #[tokio::test]
    async fn disabled_sender_fails_every_delivery() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        subscribe(&backend, "a", "https://push.example/ok").await;

        let outcome = dispatch(&backend, &DisabledSender, &request(json!({ "userId": "a" })))
            .await
            .unwrap();
        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.total, Some(1));
    }

    fn vapid() -> VapidConfig {
        VapidConfig {
            public_key: String::new(),
            private_key: "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA".into(),
            subject: "mailto:coach@gymdesk.test".into(),
        }
    }

    fn browser_subscription(endpoint: &str) -> PushSubscription {
        serde_json::from_value(json!({
            "endpoint": endpoint,
            "keys": {
                "p256dh": "BGsX0fLhLEJH-Lzm5WOkQPJ3A32BLeszoPShOUXYmMKWT-NC4v4af5uO5-tKfA-eFivOM1drMV7Oy7ZAaDe_UfU",
                "auth": "AAAAAAAAAAAAAAAAAAAAAA",
            },
        }))
        .unwrap()
    }

    #[test]
    fn vapid_sender_signs_and_encrypts() {
        let sender = WebPushSender::new(&vapid()).unwrap();
        let message = sender
            .sign(&browser_subscription("https://push.example/ana"), br#"{"title":"Hi"}"#)
            .unwrap();

        assert_eq!(message.endpoint.host(), Some("push.example"));
        assert!(message.payload.is_some());
    }

    #[test]
    fn unusable_subscription_keys_are_rejected() {
        let sender = WebPushSender::new(&vapid()).unwrap();
        let mut subscription = browser_subscription("https://push.example/ana");
        subscription.keys.p256dh = "not-a-key".into();

        let err = sender.sign(&subscription, b"{}").unwrap_err();
        assert!(matches!(err, PushError::InvalidSubscription(_)));
    }

    #[tokio::test]
    async fn missing_title_and_body_are_left_out() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path(), b"k".to_vec()).await.unwrap();
        subscribe(&backend, "a", "https://push.example/ok").await;

        let recorder = Recorder::default();
        dispatch(&backend, &recorder, &request(json!({ "userId": "a" })))
            .await
            .unwrap();

        let delivered = recorder.delivered.lock().unwrap().clone();
        assert_eq!(delivered[0].1, json!({ "url": "/" }));
    }
}
