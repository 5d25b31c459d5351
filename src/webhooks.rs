//! Outbound webhook delivery.
//!
//! Delivery is optimistic: once the request has been sent and a response came
//! back, the dispatch counts as delivered whatever the status code. Only a
//! transport failure is reported as an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::{ConsoleConfig, WEBHOOK_EVENTS};
use crate::error::{ConsoleError, ConsoleResult};
use crate::instances::InstanceEvent;
use crate::operator_log;

#[derive(Clone, Debug, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// No URL is configured for the event.
    Skipped,
    Delivered { url: String, status: u16 },
}

pub struct WebhookDispatcher {
    http: reqwest::Client,
    config: watch::Receiver<ConsoleConfig>,
}

impl WebhookDispatcher {
    pub fn new(config: watch::Receiver<ConsoleConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub async fn dispatch(&self, event: &str, data: Value) -> ConsoleResult<DispatchOutcome> {
        if !WEBHOOK_EVENTS.contains(&event) {
            operator_log::warn(
                module_path!(),
                format!("dispatching unregistered webhook event={event}"),
            );
        }
        let (url, timeout_ms) = {
            let config = self.config.borrow();
            (
                config.webhooks.url_for(event).map(str::to_string),
                config.webhooks.timeout_ms,
            )
        };
        let Some(url) = url else {
            operator_log::debug(module_path!(), format!("webhook skipped event={event}"));
            return Ok(DispatchOutcome::Skipped);
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConsoleError::validation(format!(
                "webhook url for {event} must start with http:// or https://"
            )));
        }
        let payload = WebhookPayload {
            event: event.to_string(),
            timestamp: Utc::now(),
            data,
        };
        let response = self
            .http
            .post(url.as_str())
            .json(&payload)
            .timeout(Duration::from_millis(timeout_ms.max(250)))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            operator_log::info(
                module_path!(),
                format!("webhook delivered event={event} status={status}"),
            );
        } else {
            operator_log::warn(
                module_path!(),
                format!("webhook receiver answered event={event} status={status}"),
            );
        }
        Ok(DispatchOutcome::Delivered {
            url,
            status: status.as_u16(),
        })
    }

    /// Fire-and-forget variant; failures are only logged.
    pub fn spawn_dispatch(self: &Arc<Self>, event: &'static str, data: Value) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher.dispatch(event, data).await {
                operator_log::warn(
                    module_path!(),
                    format!("webhook dispatch failed event={event} err={err}"),
                );
            }
        })
    }

    /// Forwards instance lifecycle events until the sender side goes away.
    pub fn forward_instance_events(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<InstanceEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some((name, data)) = webhook_for(&event) {
                            dispatcher.spawn_dispatch(name, data);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        operator_log::warn(
                            module_path!(),
                            format!("webhook forwarder lagged skipped={skipped}"),
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

pub fn webhook_for(event: &InstanceEvent) -> Option<(&'static str, Value)> {
    match event {
        InstanceEvent::Connected { instance } => Some((
            "instance.connected",
            json!({"id": instance.id, "name": instance.name, "phone": instance.phone}),
        )),
        InstanceEvent::Deleted { id, name } => Some((
            "instance.disconnected",
            json!({"id": id, "name": name, "reason": "deleted"}),
        )),
        InstanceEvent::Created { .. } | InstanceEvent::RefreshRequested => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(url: &str) -> WebhookDispatcher {
        let mut config = ConsoleConfig::default();
        config
            .webhooks
            .urls
            .insert("message.received".to_string(), url.to_string());
        let (_tx, rx) = watch::channel(config);
        WebhookDispatcher::new(rx)
    }

    #[tokio::test]
    async fn empty_url_is_skipped() -> anyhow::Result<()> {
        let outcome = dispatcher("  ").dispatch("message.received", json!({})).await?;
        assert_eq!(outcome, DispatchOutcome::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        let result = dispatcher("http://127.0.0.1:1/hook")
            .dispatch("message.received", json!({"id": "msg-1"}))
            .await;
        assert!(matches!(result, Err(ConsoleError::Transport(_))));
    }

    #[test]
    fn only_lifecycle_changes_emit_webhooks() {
        assert!(webhook_for(&InstanceEvent::RefreshRequested).is_none());
        let deleted = InstanceEvent::Deleted {
            id: "inst-1".to_string(),
            name: "vendas".to_string(),
        };
        assert_eq!(
            webhook_for(&deleted).map(|(name, _)| name),
            Some("instance.disconnected")
        );
    }
}
