use crate::scheduler::SchedulerStatus;
use crate::upstream::SourceProvider;
use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info};

/// 上游信号源 ID
pub type SourceId = i64;

/// 单个计划项的最长停留时间 (24 小时)
pub const MAX_DURATION_SECONDS: u64 = 24 * 60 * 60;

/// 轮播计划中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationScheduleItem {
    pub camera_id: SourceId,
    /// 停留时长 (秒)，必须为正数
    pub duration_seconds: u64,
}

/// 切换器状态 (进程内唯一，落盘为单个 JSON 对象)
///
/// 字段分为两类：
/// - 配置字段：只由控制 API 写入，变更后触发调度器重新评估
/// - 运行字段：只由调度器写入，变更后绝不触发重新评估
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SwitcherState {
    // --- 配置字段 ---
    pub rotation_enabled: bool,
    /// 仅在轮播关闭时生效
    pub fixed_source_id: Option<SourceId>,
    /// 空集合表示所有启用的摄像头都参与轮播
    pub selected_camera_ids: BTreeSet<SourceId>,
    pub rotation_schedule: Vec<RotationScheduleItem>,

    // --- 运行字段 ---
    /// 最近一次成功切换到的信号源
    pub current_source_id: Option<SourceId>,
    pub last_switch_time: Option<DateTime<Utc>>,
    /// 下一次要显示的计划项索引
    pub current_schedule_index: Option<usize>,
}

/// 配置字段的部分更新，未提供的字段保持不变
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigPatch {
    pub rotation_enabled: Option<bool>,
    /// `Some(None)` 表示清除固定信号源
    #[serde(default, deserialize_with = "present_or_null")]
    pub fixed_source_id: Option<Option<SourceId>>,
    pub selected_camera_ids: Option<BTreeSet<SourceId>>,
    pub rotation_schedule: Option<Vec<RotationScheduleItem>>,
}

/// 区分 "字段缺失" 与 "显式 null"
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("schedule item {index} (camera {camera_id}) must have a positive durationSeconds")]
    NonPositiveDuration { index: usize, camera_id: SourceId },
    #[error(
        "schedule item {index} (camera {camera_id}) durationSeconds {duration_seconds} exceeds {max}",
        max = MAX_DURATION_SECONDS
    )]
    DurationTooLong {
        index: usize,
        camera_id: SourceId,
        duration_seconds: u64,
    },
}

impl ConfigPatch {
    /// 在到达 StateStore 之前拒绝非法配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(schedule) = &self.rotation_schedule {
            for (index, item) in schedule.iter().enumerate() {
                if item.duration_seconds == 0 {
                    return Err(ConfigError::NonPositiveDuration {
                        index,
                        camera_id: item.camera_id,
                    });
                }
                if item.duration_seconds > MAX_DURATION_SECONDS {
                    return Err(ConfigError::DurationTooLong {
                        index,
                        camera_id: item.camera_id,
                        duration_seconds: item.duration_seconds,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self == &ConfigPatch::default()
    }
}

/// 维护计划索引的不变量：
/// - 轮播关闭或计划为空时为 None
/// - 否则落在 [0, len) 内；计划长度变化或旧索引越界时重置为 0
fn reconcile_schedule_index(state: &mut SwitcherState, previous_len: usize) {
    let len = state.rotation_schedule.len();
    if !state.rotation_enabled || len == 0 {
        state.current_schedule_index = None;
        return;
    }
    state.current_schedule_index = match state.current_schedule_index {
        Some(index) if len == previous_len && index < len => Some(index),
        _ => Some(0),
    };
}

/// 持有切换器状态，每次变更后同步落盘
///
/// 只有配置变更会递增 `config_tx` 中的修订号；接收端按 "状态已变化" 合并通知，
/// 不会排队计数。
pub struct StateStore {
    state: Mutex<SwitcherState>,
    path: Option<PathBuf>,
    config_tx: watch::Sender<u64>,
}

impl StateStore {
    fn with_state(state: SwitcherState, path: Option<PathBuf>) -> Self {
        let (config_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(state),
            path,
            config_tx,
        }
    }

    /// 仅驻留内存，不落盘
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::with_state(SwitcherState::default(), None)
    }

    /// 启动时加载持久化快照，文件不存在视为首次运行
    ///
    /// 快照中缺失的字段保持默认值，未知字段被忽略。
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<SwitcherState>(&content)
                .with_context(|| format!("Corrupt state file {:?}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?}, starting with defaults", path);
                SwitcherState::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file {:?}", path))
            }
        };

        let len = state.rotation_schedule.len();
        reconcile_schedule_index(&mut state, len);
        Ok(Self::with_state(state, Some(path)))
    }

    fn lock(&self) -> MutexGuard<'_, SwitcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 当前状态快照
    pub fn read(&self) -> SwitcherState {
        self.lock().clone()
    }

    /// 订阅配置变更通知
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.config_tx.subscribe()
    }

    /// 已发出的配置变更通知总数
    pub fn config_revision(&self) -> u64 {
        *self.config_tx.borrow()
    }

    /// 应用配置字段的部分更新，落盘，并且恰好发出一次变更通知
    pub fn set_config(&self, patch: ConfigPatch) -> SwitcherState {
        let snapshot = {
            let mut state = self.lock();
            let previous_len = state.rotation_schedule.len();

            if let Some(enabled) = patch.rotation_enabled {
                state.rotation_enabled = enabled;
            }
            if let Some(fixed) = patch.fixed_source_id {
                state.fixed_source_id = fixed;
            }
            if let Some(ids) = patch.selected_camera_ids {
                state.selected_camera_ids = ids;
            }
            if let Some(schedule) = patch.rotation_schedule {
                state.rotation_schedule = schedule;
            }
            reconcile_schedule_index(&mut state, previous_len);

            self.persist(&state);
            state.clone()
        };

        self.config_tx.send_modify(|revision| *revision += 1);
        snapshot
    }

    /// 记录一次成功切换，不发出通知
    pub fn set_operational(&self, source_id: SourceId, switched_at: DateTime<Utc>) {
        let mut state = self.lock();
        state.current_source_id = Some(source_id);
        state.last_switch_time = Some(switched_at.trunc_subsecs(3));
        self.persist(&state);
    }

    /// 设置计划索引 (运行字段)，不发出通知
    ///
    /// 与当前配置不一致的值会被纠正。
    pub fn set_schedule_index(&self, index: Option<usize>) {
        let mut state = self.lock();
        let len = state.rotation_schedule.len();
        state.current_schedule_index = index;
        reconcile_schedule_index(&mut state, len);
        self.persist(&state);
    }

    /// 将计划索引从 `from` 前进一位 (回绕)，不发出通知
    ///
    /// 若调度器评估期间计划已被改动 (长度或索引不再匹配)，保持配置变更后的索引不动。
    pub fn advance_schedule_index(&self, from: usize, schedule_len: usize) -> Option<usize> {
        let mut state = self.lock();
        if state.rotation_schedule.len() == schedule_len
            && state.current_schedule_index == Some(from)
        {
            state.current_schedule_index = Some((from + 1) % schedule_len);
            self.persist(&state);
        }
        state.current_schedule_index
    }

    /// 整文件覆盖写入；失败只记录日志，内存状态仍然有效
    fn persist(&self, state: &SwitcherState) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomically(path, state) {
            error!("Failed to persist state to {:?}: {:#}", path, e);
        }
    }
}

/// 先写临时文件并刷盘，再原子替换，崩溃时不会留下截断的状态文件
fn write_atomically(path: &Path, state: &SwitcherState) -> anyhow::Result<()> {
    let content = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// 控制面共享的应用上下文
pub struct AppState {
    pub store: Arc<StateStore>,
    pub provider: Arc<dyn SourceProvider>,
    /// 调度器发布的状态
    pub scheduler: watch::Receiver<SchedulerStatus>,
    /// 进程启动时间 (用于计算运行时长)
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;
