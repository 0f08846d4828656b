//! Fulfillment notifications over Web Push
//!
//! Triggered by the reconciliation engine when a request transitions to
//! fulfilled. Looks up the requester's push subscription, encrypts the
//! payload, signs the VAPID header and posts to the subscription endpoint.
//! Stale subscriptions (404/410) are deleted on the spot; nothing retries.

pub mod webpush;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::storage::ItemStore;
use crate::types::{from_item, MediaRequest, PushSubscription};

/// Seam between the reconciliation engine and the push machinery.
#[async_trait]
pub trait FulfillmentNotifier: Send + Sync {
    /// Notify the requester that their request is available.
    /// Returns whether a notification was actually delivered.
    async fn notify_fulfilled(&self, request: &MediaRequest) -> bool;
}

/// VAPID signing material.
#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub private_key: String,
    pub public_key: String,
    pub subject: String,
}

/// Web Push notifier backed by the shared item store.
pub struct PushNotifier {
    store: Arc<dyn ItemStore>,
    http: reqwest::Client,
    vapid: Option<VapidConfig>,
}

impl PushNotifier {
    pub fn new(store: Arc<dyn ItemStore>, vapid: Option<VapidConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { store, http, vapid }
    }

    fn subscription_for(&self, user_name: &str) -> Option<PushSubscription> {
        let item = self
            .store
            .get(&PushSubscription::key_for(user_name))
            .ok()
            .flatten()?;
        from_item(item).ok()
    }

    fn drop_subscription(&self, user_name: &str) {
        if let Err(err) = self.store.delete(&PushSubscription::key_for(user_name)) {
            warn!(user_name, "failed to delete stale push subscription: {err}");
        }
    }
}

/// Notification payload shown by the service worker.
pub(crate) fn build_payload(request: &MediaRequest) -> Value {
    let mut payload = json!({
        "title": "Request available",
        "body": format!("{} has been added to the library", request.title),
        "tag": format!("fulfilled-{}-{}", request.media_type, request.tmdb_id),
    });
    if let Some(poster) = &request.poster_path {
        payload["icon"] = json!(format!("https://image.tmdb.org/t/p/w185{poster}"));
        payload["image"] = json!(format!("https://image.tmdb.org/t/p/w500{poster}"));
    }
    payload
}

#[async_trait]
impl FulfillmentNotifier for PushNotifier {
    async fn notify_fulfilled(&self, request: &MediaRequest) -> bool {
        let Some(vapid) = &self.vapid else {
            debug!("push notifications disabled, no VAPID keys configured");
            return false;
        };
        let Some(user_name) = request.requested_by.as_deref() else {
            return false;
        };
        let Some(subscription) = self.subscription_for(user_name) else {
            debug!(user_name, "no push subscription on file");
            return false;
        };

        let payload = build_payload(request).to_string();
        let body = match webpush::encrypt(
            payload.as_bytes(),
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        ) {
            Ok(body) => body,
            Err(err) => {
                warn!(user_name, "push payload encryption failed: {err}");
                return false;
            }
        };
        let authorization = match webpush::vapid_authorization(
            &subscription.endpoint,
            &vapid.private_key,
            &vapid.subject,
            Utc::now().timestamp(),
        ) {
            Ok(header) => header,
            Err(err) => {
                warn!(user_name, "VAPID signing failed: {err}");
                return false;
            }
        };

        let response = self
            .http
            .post(&subscription.endpoint)
            .header("Authorization", authorization)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Encoding", "aes128gcm")
            .header("TTL", "86400")
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(user_name, title = %request.title, "push notification sent");
                true
            }
            Ok(resp)
                if resp.status() == reqwest::StatusCode::NOT_FOUND
                    || resp.status() == reqwest::StatusCode::GONE =>
            {
                info!(user_name, "push subscription expired, removing");
                self.drop_subscription(user_name);
                false
            }
            Ok(resp) => {
                warn!(user_name, status = %resp.status(), "push endpoint rejected notification");
                false
            }
            Err(err) => {
                warn!(user_name, "push delivery failed: {err}");
                false
            }
        }
    }
}
