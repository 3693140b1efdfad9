use anyhow::bail;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// 切换器状态持久化文件
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// 上游切换台 API 地址
    pub base_url: String,
    /// 传输层超时 (毫秒)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 参与轮播的信号源类型
    #[serde(default = "default_camera_type")]
    pub camera_type: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RotationConfig {
    /// 摄像头不可用或切换失败后的重试间隔 (秒)
    pub retry_interval_sec: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            retry_interval_sec: 5,
        }
    }
}

/// 下游辅助硬件 (如 Tally 灯) 通知
#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    pub url: String,
}

fn default_state_file() -> String {
    "./switcher-state.json".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_camera_type() -> String {
    "camera".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 没有可用的上游地址时拒绝启动，不以降级模式运行
    pub fn validate(&self) -> anyhow::Result<()> {
        let base_url = self.upstream.base_url.trim();
        if base_url.is_empty() {
            bail!("upstream.base_url is not configured");
        }
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("upstream.base_url {:?} is invalid: {}", base_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("upstream.base_url must use http or https, got {}", url.scheme());
        }
        if self.upstream.timeout_ms == 0 {
            bail!("upstream.timeout_ms must be positive");
        }
        if self.rotation.retry_interval_sec == 0 {
            bail!("rotation.retry_interval_sec must be positive");
        }
        if let Some(notify) = &self.notify {
            reqwest::Url::parse(&notify.url)
                .map_err(|e| anyhow::anyhow!("notify.url {:?} is invalid: {}", notify.url, e))?;
        }
        Ok(())
    }
}
