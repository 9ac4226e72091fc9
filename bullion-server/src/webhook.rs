//! Inbound webhook dispatcher for the conversational channel.
//!
//! The vendor delivers at-least-once: every request is answered 200
//! immediately, duplicates are dropped by `MessageSid`, and the message is
//! processed on a background task so slow engine calls never stall the
//! callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use bullion_store::repository::accounts;

use crate::AppContext;

const ACCESS_DENIED: &str =
    "Access Denied. This number is not registered with any trading account.";

/// Time-bounded set of recently seen message ids.
pub struct DedupCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record an id. Returns false when it was already seen within the TTL.
    pub fn insert(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = seen.get(id) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }
        seen.insert(id.to_string(), now);
        true
    }

    /// Drop expired entries. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        let ttl = self.ttl;
        seen.retain(|_, at| at.elapsed() < ttl);
        before - seen.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().unwrap().is_empty()
    }
}

/// Form fields posted by the messaging vendor.
#[derive(Debug, Deserialize)]
pub struct WebhookForm {
    #[serde(rename = "Body")]
    pub body: Option<String>,
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
    #[serde(rename = "ProfileName")]
    pub profile_name: Option<String>,
}

/// Outcome of accepting one webhook delivery.
pub enum WebhookAccept {
    /// Accepted; processing continues on a background task.
    Accepted,
    /// Dropped as a duplicate delivery.
    Duplicate,
    /// Required fields were missing.
    Invalid(&'static str),
}

/// Validate, deduplicate and enqueue one delivery. The caller answers the
/// vendor immediately regardless.
pub fn accept(ctx: &Arc<AppContext>, form: WebhookForm) -> WebhookAccept {
    let (Some(body), Some(from), Some(message_sid)) = (form.body, form.from, form.message_sid)
    else {
        return WebhookAccept::Invalid("missing Body, From or MessageSid");
    };
    if body.trim().is_empty() || from.trim().is_empty() || message_sid.trim().is_empty() {
        return WebhookAccept::Invalid("empty Body, From or MessageSid");
    }

    if !ctx.dedup.insert(&message_sid) {
        ctx.metrics.inc_webhook_duplicate();
        info!(%message_sid, "duplicate webhook delivery dropped");
        return WebhookAccept::Duplicate;
    }
    ctx.metrics.inc_webhook();

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        process(ctx, from, body, form.profile_name, message_sid).await;
    });
    WebhookAccept::Accepted
}

async fn process(
    ctx: Arc<AppContext>,
    from: String,
    body: String,
    profile_name: Option<String>,
    message_sid: String,
) {
    let account = match ctx.store.with_conn(|conn| accounts::by_phone(conn, &from)) {
        Ok(account) => account,
        Err(err) => {
            warn!(%message_sid, error = %err, "account lookup failed");
            return;
        }
    };

    let Some(account) = account else {
        info!(%from, "unauthorized sender");
        if let Err(err) = ctx.messenger.send(&from, ACCESS_DENIED).await {
            warn!(error = %err, "failed to send access-denied reply");
        }
        return;
    };

    let reply = ctx
        .sessions
        .handle(&from, &account, profile_name.as_deref(), &body)
        .await;

    if let Err(err) = ctx.messenger.send(&from, &reply.text).await {
        warn!(%message_sid, error = %err, "failed to send reply");
        // A committed trade stays committed; the failed notification is
        // recorded on the order instead.
        if let Some(order_id) = reply.order_id {
            ctx.engine
                .annotate_notification_error(order_id, account.admin_owner, &err.to_string());
        }
    }
}
