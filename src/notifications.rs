use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::core::{Event, Severity, ThreatDetection};
use crate::dispatch::{Subscription, SubscriptionFilter};

/// JSON webhook target for detection alerts.
pub struct WebhookClient {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

impl WebhookClient {
    pub fn new(url: &str, user: Option<&str>, pass: Option<&str>) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = user.map(|user| STANDARD.encode(format!("{user}:{}", pass.unwrap_or_default())));
        Self {
            url: url.to_string(),
            client: Client::new(),
            auth,
        }
    }

    pub async fn post(&self, detection: &ThreatDetection) -> Result<(), reqwest::Error> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(detection);
        if let Some(auth) = &self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }
        req.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Detection alert sender with cooldown to prevent spam.
pub struct Notifier {
    enabled: bool,
    desktop: bool,
    min_severity: Severity,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
    webhook: Option<Arc<WebhookClient>>,
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Self {
        let webhook = config.webhook_url.as_deref().filter(|u| !u.is_empty()).map(|url| {
            Arc::new(WebhookClient::new(
                url,
                config.webhook_user.as_deref(),
                config.webhook_password.as_deref(),
            ))
        });
        Self {
            enabled: config.enabled,
            desktop: config.desktop,
            min_severity: config.min_severity,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            last_sent: Mutex::new(None),
            webhook,
        }
    }

    /// Subscription filter matching what this notifier acts on.
    pub fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter {
            tracked_only: true,
            min_severity: Some(self.min_severity),
            methods: Vec::new(),
        }
    }

    /// Try to send an alert for a detection.
    /// Returns true if an alert was sent, false if skipped.
    pub fn notify(&self, detection: &ThreatDetection) -> bool {
        if !self.enabled {
            return false;
        }
        if detection.severity < self.min_severity {
            return false;
        }
        if !self.check_cooldown() {
            return false;
        }

        if self.desktop {
            self.send_desktop(detection);
        }
        if let Some(webhook) = &self.webhook {
            self.send_webhook(webhook.clone(), detection.clone());
        }
        true
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let mut last = self.last_sent.lock();
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Fire-and-forget: desktop notification on a background thread.
    fn send_desktop(&self, detection: &ThreatDetection) {
        let title = format!("txsentry: {} {}", detection.severity, detection.threat_type.as_str());
        let tx_short = &detection.tx_hash[..12.min(detection.tx_hash.len())];
        let body = format!(
            "{} | confidence {} | {tx_short}\n{}",
            detection.contract_address, detection.confidence, detection.description
        );

        std::thread::spawn(move || {
            if let Err(e) = notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
            {
                debug!("Desktop notification failed: {e}");
            }
        });
    }

    fn send_webhook(&self, webhook: Arc<WebhookClient>, detection: ThreatDetection) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for webhook delivery, skipping");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = webhook.post(&detection).await {
                warn!(detection = %detection.id, "Webhook delivery failed: {e}");
            }
        });
    }

    /// Consume detection events from `subscription` until it ends.
    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(min_severity = %self.min_severity, "Notifier started");
            let mut sent = 0u64;
            while let Some(event) = subscription.recv().await {
                if let Event::ThreatDetection(detection) = event {
                    if self.notify(&detection) {
                        sent += 1;
                    }
                }
            }
            info!("Notifier stopped after {sent} alerts");
        })
    }
}
