// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound flow status notifications.
//!
//! Every status change is fanned out to all configured sinks. Delivery is
//! fire-and-forget relative to the flow state: a failing sink is logged and
//! counted, never retried by the caller and never propagated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use timelock_schema::models::{FlowStatus, TimelockStandard};
use tracing::{debug, info, warn};

use crate::config::{NotificationConfig, TelegramConfig};
use crate::metrics::ScannerMetrics;
use crate::store::Flow;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowNotification {
    pub standard: TimelockStandard,
    pub chain_id: u64,
    pub contract_address: String,
    pub flow_id: String,
    /// `None` when the flow was just created.
    pub status_from: Option<FlowStatus>,
    pub status_to: FlowStatus,
    pub tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub function_signature: Option<String>,
}

impl FlowNotification {
    pub fn for_flow(
        flow: &Flow,
        status_from: Option<FlowStatus>,
        status_to: FlowStatus,
        tx_hash: Option<String>,
    ) -> Self {
        Self {
            standard: flow.key.standard,
            chain_id: flow.key.chain_id,
            contract_address: flow.key.contract_address.clone(),
            flow_id: flow.key.flow_id.clone(),
            status_from,
            status_to,
            tx_hash,
            initiator_address: flow.initiator_address.clone(),
            function_signature: None,
        }
    }

    pub fn with_function_signature(mut self, signature: Option<String>) -> Self {
        self.function_signature = signature;
        self
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn send_flow_notification(&self, notification: &FlowNotification) -> Result<()>;
}

pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    metrics: Arc<ScannerMetrics>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, metrics: Arc<ScannerMetrics>) -> Self {
        Self { sinks, metrics }
    }

    pub fn from_config(config: &NotificationConfig, metrics: Arc<ScannerMetrics>) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if let Some(telegram) = config.telegram.clone().filter(|t| t.is_configured()) {
            sinks.push(Arc::new(TelegramNotifier::new(telegram)?));
        }
        for url in &config.webhooks {
            sinks.push(Arc::new(WebhookNotifier::new(url)?));
        }
        info!("[Notification] {} sinks configured", sinks.len());
        Ok(Self::new(sinks, metrics))
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Sends `notification` to every sink concurrently. Returns the number of
    /// sinks that accepted it.
    pub async fn dispatch(&self, notification: &FlowNotification) -> usize {
        let results = join_all(
            self.sinks
                .iter()
                .map(|sink| async move { (sink.name(), sink.send_flow_notification(notification).await) }),
        )
        .await;

        let mut delivered = 0;
        for (name, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "[Notification] {} failed for flow {} ({:?} -> {}): {:#}",
                        name,
                        notification.flow_id,
                        notification.status_from,
                        notification.status_to,
                        e
                    );
                    self.metrics
                        .notification_failures
                        .with_label_values(&[name])
                        .inc();
                }
            }
        }
        delivered
    }
}

async fn post_json_with_retry(
    client: &Client,
    url: &str,
    body: &serde_json::Value,
    label: &str,
    retry_delay: Duration,
) -> Result<()> {
    let mut last_error = anyhow!("no attempt made");
    for attempt in 0..MAX_RETRIES {
        match client.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                warn!(
                    "{} send attempt {}/{} failed: {}",
                    label,
                    attempt + 1,
                    MAX_RETRIES,
                    resp.status()
                );
                last_error = anyhow!("http status {}", resp.status());
            }
            Err(e) => {
                warn!(
                    "{} send attempt {}/{} failed: {:?}",
                    label,
                    attempt + 1,
                    MAX_RETRIES,
                    e
                );
                last_error = e.into();
            }
        }

        if attempt < MAX_RETRIES - 1 {
            tokio::time::sleep(retry_delay * (attempt + 1)).await;
        }
    }
    Err(last_error.context(format!("{} failed after {} attempts", label, MAX_RETRIES)))
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
    api_base: String,
    retry_delay: Duration,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("configured", &self.config.is_configured())
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build telegram http client")?;
        Ok(Self {
            config,
            client,
            api_base,
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    fn with_api_base(mut self, api_base: &str, retry_delay: Duration) -> Self {
        self.api_base = api_base.to_string();
        self.retry_delay = retry_delay;
        self
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        if !self.config.is_configured() {
            info!(
                "Telegram not configured, would send: {}",
                text.chars().take(200).collect::<String>()
            );
            return Ok(());
        }
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        post_json_with_retry(
            &self.client,
            &format!("{}/sendMessage", self.api_base),
            &body,
            "Telegram",
            self.retry_delay,
        )
        .await
    }

    fn format_message(n: &FlowNotification) -> String {
        let transition = match n.status_from {
            Some(from) => format!("{} → {}", from, n.status_to),
            None => format!("new → {}", n.status_to),
        };
        let mut message = format!(
            "<b>[Timelock]</b> {}\n\
            <b>Standard:</b> {}\n\
            <b>Chain:</b> {}\n\
            <b>Contract:</b> <code>{}</code>\n\
            <b>Flow:</b> <code>{}</code>",
            transition,
            n.standard,
            n.chain_id,
            Self::truncate_addr(&n.contract_address),
            Self::truncate_addr(&n.flow_id),
        );
        if let Some(signature) = &n.function_signature {
            message.push_str(&format!("\n<b>Function:</b> <code>{}</code>", signature));
        }
        if let Some(initiator) = &n.initiator_address {
            message.push_str(&format!(
                "\n<b>Initiator:</b> <code>{}</code>",
                Self::truncate_addr(initiator)
            ));
        }
        if let Some(tx_hash) = &n.tx_hash {
            message.push_str(&format!("\n\n<b>Tx:</b> <code>{}</code>", tx_hash));
        }
        message
    }

    fn truncate_addr(addr: &str) -> String {
        let chars: Vec<char> = addr.chars().collect();
        if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 8..].iter().collect();
            format!("{}...{}", head, tail)
        } else {
            addr.to_string()
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_flow_notification(&self, notification: &FlowNotification) -> Result<()> {
        self.send_message(&Self::format_message(notification)).await
    }
}

/// Posts each notification as JSON to a fixed URL. Email and chat bridges
/// run behind such endpoints.
pub struct WebhookNotifier {
    url: String,
    client: Client,
    retry_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("Invalid webhook url {}", url))?;
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build webhook http client")?;
        Ok(Self {
            url: url.to_string(),
            client,
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send_flow_notification(&self, notification: &FlowNotification) -> Result<()> {
        let body = serde_json::to_value(notification)?;
        debug!("[Notification] POST {} flow {}", self.url, notification.flow_id);
        post_json_with_retry(&self.client, &self.url, &body, "Webhook", self.retry_delay).await
    }
}
