use crate::config::NotifyConfig;
use crate::state::SourceId;
use crate::upstream::UpstreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// 一次成功切换，推送给下游辅助硬件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchEvent {
    pub source_id: SourceId,
    pub source_name: String,
    pub switched_at: DateTime<Utc>,
}

/// 下游通知通道，失败不影响调度
#[async_trait]
pub trait SwitchNotifier: Send + Sync {
    async fn notify(&self, event: &SwitchEvent) -> Result<(), UpstreamError>;
}

/// 以 JSON POST 推送到配置的 URL
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(cfg: &NotifyConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
        })
    }
}

#[async_trait]
impl SwitchNotifier for WebhookNotifier {
    async fn notify(&self, event: &SwitchEvent) -> Result<(), UpstreamError> {
        let resp = self.http.post(&self.url).json(event).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                operation: "notify",
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_payload_shape() {
        let event = SwitchEvent {
            source_id: 3,
            source_name: "Stage Left".to_string(),
            switched_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        };
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(body["sourceId"], 3);
        assert_eq!(body["sourceName"], "Stage Left");
        assert_eq!(body["switchedAt"], "2023-11-14T22:13:20Z");
    }
}
