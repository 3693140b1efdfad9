use crate::config::AppConfig;
use crate::notify::{SwitchEvent, SwitchNotifier};
use crate::state::{SourceId, StateStore, SwitcherState, MAX_DURATION_SECONDS};
use crate::upstream::{Source, SourceProvider, SourceSwitcher, UpstreamError};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 调度器所处的逻辑状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// 轮播关闭，持续显示固定信号源
    Fixed,
    /// 轮播关闭，没有可用的固定信号源
    Idle,
    /// 轮播开启但计划为空
    WaitingForSchedule,
    /// 按计划轮播
    Active,
}

/// 本轮未能显示目标摄像头的原因
#[derive(Debug, thiserror::Error)]
enum SkipReason {
    #[error("source list unavailable: {0}")]
    ListFailed(UpstreamError),
    #[error("source not found")]
    NotFound,
    #[error("source is disabled")]
    Disabled,
    #[error("source is unhealthy")]
    Unhealthy,
    #[error("source type {0:?} is not rotation-eligible")]
    NotCamera(String),
    #[error("camera is not in the selected set")]
    NotSelected,
    #[error("switch failed: {0}")]
    SwitchFailed(UpstreamError),
}

/// 对外发布的调度器状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub mode: Option<RotationMode>,
    pub next_wakeup: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 参与轮播的信号源类型
    pub camera_type: String,
    /// 摄像头不可用或切换失败后的重试间隔
    pub retry_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            camera_type: "camera".to_string(),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl From<&AppConfig> for SchedulerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            camera_type: cfg.upstream.camera_type.clone(),
            retry_interval: Duration::from_secs(cfg.rotation.retry_interval_sec),
        }
    }
}

/// 在本轮拉取的信号源快照中查找可轮播的摄像头
fn resolve_camera<'a>(
    sources: &'a [Source],
    camera_id: SourceId,
    camera_type: &str,
    selected: &BTreeSet<SourceId>,
) -> Result<&'a Source, SkipReason> {
    let source = sources
        .iter()
        .find(|s| s.id == camera_id)
        .ok_or(SkipReason::NotFound)?;
    if !source.enabled {
        return Err(SkipReason::Disabled);
    }
    if !source.healthy {
        return Err(SkipReason::Unhealthy);
    }
    if source.kind != camera_type {
        return Err(SkipReason::NotCamera(source.kind.clone()));
    }
    if !selected.is_empty() && !selected.contains(&camera_id) {
        return Err(SkipReason::NotSelected);
    }
    Ok(source)
}

enum Trigger {
    ConfigChanged,
    Timer,
    Shutdown,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 轮播调度器
///
/// 由两类事件驱动：配置变更通知与唯一的唤醒定时器。每次 `reevaluate()`
/// 开始时先丢弃旧的唤醒点，结束时至多设置一个新的，因此任意时刻最多只有一个待触发定时器。
/// 调度器只通过运行字段接口写回状态，不会触发新的配置通知。
pub struct RotationScheduler {
    store: Arc<StateStore>,
    provider: Arc<dyn SourceProvider>,
    switcher: Arc<dyn SourceSwitcher>,
    notifier: Option<Arc<dyn SwitchNotifier>>,
    settings: SchedulerSettings,
    config_rx: watch::Receiver<u64>,
    next_wakeup: Option<Instant>,
    mode: Option<RotationMode>,
    status_tx: watch::Sender<SchedulerStatus>,
}

impl RotationScheduler {
    pub fn new(
        store: Arc<StateStore>,
        provider: Arc<dyn SourceProvider>,
        switcher: Arc<dyn SourceSwitcher>,
        settings: SchedulerSettings,
    ) -> Self {
        let config_rx = store.subscribe();
        let (status_tx, _) = watch::channel(SchedulerStatus::default());
        Self {
            store,
            provider,
            switcher,
            notifier: None,
            settings,
            config_rx,
            next_wakeup: None,
            mode: None,
            status_tx,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SwitchNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 订阅调度器状态 (供控制面查询)
    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status_tx.subscribe()
    }

    /// 当前唯一的待触发唤醒点
    #[cfg(test)]
    fn pending_wakeup(&self) -> Option<Instant> {
        self.next_wakeup
    }

    #[cfg(test)]
    fn mode(&self) -> Option<RotationMode> {
        self.mode
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SchedulerStatus {
            mode: self.mode,
            next_wakeup: self.next_wakeup,
        });
    }

    /// 主循环：启动时立即评估一次，之后等待配置变更、定时器或退出信号
    ///
    /// 评估进行中到达的多次配置通知会被合并为一次后续评估。
    /// 退出时只取消定时器，保留最后切换到的信号源。
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Rotation scheduler started");
        self.config_rx.borrow_and_update();
        let mut trigger = Trigger::Timer;

        loop {
            match trigger {
                Trigger::Shutdown => break,
                Trigger::ConfigChanged => {
                    self.config_rx.borrow_and_update();
                    debug!("Configuration changed. Re-evaluating.");
                }
                Trigger::Timer => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.reevaluate() => {}
            }

            let wakeup = self.next_wakeup;
            trigger = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Trigger::Shutdown,
                changed = self.config_rx.changed() => match changed {
                    Ok(()) => Trigger::ConfigChanged,
                    Err(_) => Trigger::Shutdown,
                },
                _ = sleep_until_opt(wakeup) => Trigger::Timer,
            };
        }

        self.next_wakeup = None;
        self.publish_status();
        info!("Rotation scheduler stopped. Leaving current source active.");
    }

    /// 根据当前状态决定下一步动作与下一次唤醒
    ///
    /// 返回新设置的唤醒间隔；`None` 表示空闲，直到下一次配置变更。
    pub async fn reevaluate(&mut self) -> Option<Duration> {
        self.next_wakeup = None;
        let state = self.store.read();

        let (mode, delay) = if state.rotation_enabled {
            if state.rotation_schedule.is_empty() {
                (RotationMode::WaitingForSchedule, None)
            } else {
                (RotationMode::Active, Some(self.rotate(&state).await))
            }
        } else {
            if state.current_schedule_index.is_some() {
                self.store.set_schedule_index(None);
            }
            match state.fixed_source_id {
                Some(fixed_id) => self.show_fixed(&state, fixed_id).await,
                None => (RotationMode::Idle, None),
            }
        };

        self.enter(mode);
        self.next_wakeup = delay.map(|d| {
            let now = Instant::now();
            now.checked_add(d)
                .unwrap_or_else(|| now + Duration::from_secs(MAX_DURATION_SECONDS))
        });
        self.publish_status();
        delay
    }

    fn enter(&mut self, mode: RotationMode) {
        if self.mode == Some(mode) {
            return;
        }
        match mode {
            RotationMode::WaitingForSchedule => {
                warn!("Rotation enabled but schedule is empty. Waiting for schedule.")
            }
            RotationMode::Idle => info!("Rotation disabled and no usable fixed source. Idle."),
            RotationMode::Fixed => info!("Rotation disabled. Holding fixed source."),
            RotationMode::Active => info!("Rotation active."),
        }
        self.mode = Some(mode);
    }

    /// 显示计划中的当前项并前进索引，返回下一次唤醒间隔
    async fn rotate(&self, state: &SwitcherState) -> Duration {
        let len = state.rotation_schedule.len();
        let index = match state.current_schedule_index {
            Some(i) if i < len => i,
            _ => {
                self.store.set_schedule_index(Some(0));
                0
            }
        };
        let item = &state.rotation_schedule[index];

        let outcome = match self.provider.list().await {
            Ok(sources) => {
                match resolve_camera(
                    &sources,
                    item.camera_id,
                    &self.settings.camera_type,
                    &state.selected_camera_ids,
                ) {
                    Ok(source) => self.switch_to(source).await,
                    Err(reason) => Err(reason),
                }
            }
            Err(e) => Err(SkipReason::ListFailed(e)),
        };

        // 先前进索引再通知下游，退出信号打断通知时不会留下过期的索引
        let next = self.store.advance_schedule_index(index, len);

        match outcome {
            Ok(event) => {
                self.announce(&event).await;
                let hold =
                    Duration::from_secs(item.duration_seconds.clamp(1, MAX_DURATION_SECONDS));
                info!(
                    "Rotation [{}/{}]: showing camera {} for {}s. Next index: {:?}",
                    index + 1,
                    len,
                    item.camera_id,
                    hold.as_secs(),
                    next
                );
                hold
            }
            Err(reason) => {
                warn!(
                    "Rotation [{}/{}]: skipping camera {} ({}). Retrying in {}s.",
                    index + 1,
                    len,
                    item.camera_id,
                    reason,
                    self.settings.retry_interval.as_secs()
                );
                self.settings.retry_interval
            }
        }
    }

    /// 轮播关闭时切到固定信号源；已在显示则不重复切换
    ///
    /// 拉取列表或切换失败属于瞬时错误，按重试间隔再评估。
    async fn show_fixed(
        &self,
        state: &SwitcherState,
        fixed_id: SourceId,
    ) -> (RotationMode, Option<Duration>) {
        let sources = match self.provider.list().await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(
                    "Cannot resolve fixed source {}: {}. Retrying in {}s.",
                    fixed_id,
                    e,
                    self.settings.retry_interval.as_secs()
                );
                return (RotationMode::Fixed, Some(self.settings.retry_interval));
            }
        };

        let Some(source) = sources.iter().find(|s| s.id == fixed_id && s.enabled) else {
            warn!("Fixed source {} is missing or disabled.", fixed_id);
            return (RotationMode::Idle, None);
        };

        if state.current_source_id == Some(fixed_id) {
            return (RotationMode::Fixed, None);
        }

        match self.switch_to(source).await {
            Ok(event) => {
                info!("Switched to fixed source {} ({}).", fixed_id, source.name);
                self.announce(&event).await;
                (RotationMode::Fixed, None)
            }
            Err(reason) => {
                warn!(
                    "Fixed source {}: {}. Retrying in {}s.",
                    fixed_id,
                    reason,
                    self.settings.retry_interval.as_secs()
                );
                (RotationMode::Fixed, Some(self.settings.retry_interval))
            }
        }
    }

    /// 执行切换；成功后记录运行字段，返回待通知下游的事件
    async fn switch_to(&self, source: &Source) -> Result<SwitchEvent, SkipReason> {
        self.switcher
            .switch(source.id)
            .await
            .map_err(SkipReason::SwitchFailed)?;

        let switched_at = Utc::now();
        self.store.set_operational(source.id, switched_at);
        Ok(SwitchEvent {
            source_id: source.id,
            source_name: source.name.clone(),
            switched_at,
        })
    }

    async fn announce(&self, event: &SwitchEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.notify(event).await {
            warn!("Downstream notify failed for source {}: {}", event.source_id, e);
        }
    }
}
