use crate::config::UpstreamConfig;
use crate::state::SourceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 上游切换台上的一个信号源 (只读快照，每轮评估重新拉取)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub uri: String,
}

fn default_healthy() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream rejected {operation} with status {status}")]
    Status {
        operation: &'static str,
        status: reqwest::StatusCode,
    },
}

/// 列出可用信号源
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn list(&self) -> Result<Vec<Source>, UpstreamError>;
}

/// 执行实际的信号源切换
#[async_trait]
pub trait SourceSwitcher: Send + Sync {
    async fn switch(&self, source_id: SourceId) -> Result<(), UpstreamError>;
}

/// 基于 HTTP 的上游客户端，同时实现 SourceProvider 与 SourceSwitcher
///
/// - `GET {base_url}/sources` 返回信号源数组
/// - `POST {base_url}/switch` 携带 `{"sourceId": id}` 执行切换
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchRequest {
    source_id: SourceId,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl SourceProvider for UpstreamClient {
    async fn list(&self) -> Result<Vec<Source>, UpstreamError> {
        let resp = self.http.get(self.url("sources")).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                operation: "list",
                status,
            });
        }
        let sources: Vec<Source> = resp.json().await?;
        debug!("Upstream listed {} sources", sources.len());
        Ok(sources)
    }
}

#[async_trait]
impl SourceSwitcher for UpstreamClient {
    async fn switch(&self, source_id: SourceId) -> Result<(), UpstreamError> {
        let resp = self
            .http
            .post(self.url("switch"))
            .json(&SwitchRequest { source_id })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                operation: "switch",
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_decodes_upstream_payload() {
        let json = r#"[
            {"id": 1, "name": "Lobby", "type": "camera", "enabled": true, "healthy": true, "uri": "rtsp://lobby"},
            {"id": 2, "name": "Slides", "type": "screen", "enabled": true}
        ]"#;
        let sources: Vec<Source> = serde_json::from_str(json).unwrap();
        assert_eq!(sources[0].kind, "camera");
        assert_eq!(sources[0].uri, "rtsp://lobby");
        assert_eq!(sources[1].kind, "screen");
        assert!(sources[1].healthy);
        assert!(sources[1].uri.is_empty());
    }

    #[test]
    fn client_joins_paths_without_double_slash() {
        let client = UpstreamClient::new(&UpstreamConfig {
            base_url: "http://switcher.local:9000/".to_string(),
            timeout_ms: 1000,
            camera_type: "camera".to_string(),
        })
        .unwrap();
        assert_eq!(client.url("sources"), "http://switcher.local:9000/sources");
    }

    #[test]
    fn switch_request_uses_camel_case() {
        let body = serde_json::to_value(SwitchRequest { source_id: 5 }).unwrap();
        assert_eq!(body, serde_json::json!({"sourceId": 5}));
    }
}
