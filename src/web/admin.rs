use crate::state::{SharedState, SwitcherState};
use crate::upstream::Source;
use crate::web::control::ControlError;
use axum::{extract::State, Json};
use tokio::time::Instant;

/// 提供内嵌的管理后台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 返回主机的内存和负载信息以及进程运行时长
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// 获取切换器状态快照 (只读)
pub async fn get_state(State(state): State<SharedState>) -> Json<SwitcherState> {
    Json(state.store.read())
}

/// 从上游拉取当前信号源列表，供页面选择摄像头
pub async fn list_sources(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Source>>, ControlError> {
    let sources = state.provider.list().await?;
    Ok(Json(sources))
}

/// 调度器当前模式、距离下次唤醒的秒数以及已发出的配置通知数
pub async fn scheduler_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let status = state.scheduler.borrow().clone();
    let next_wakeup_in = status
        .next_wakeup
        .map(|at| at.saturating_duration_since(Instant::now()).as_secs());

    Json(serde_json::json!({
        "mode": status.mode,
        "next_wakeup_in_seconds": next_wakeup_in,
        "config_revision": state.store.config_revision(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::state::{ConfigPatch, RotationScheduleItem};
    use crate::upstream::Source;
    use crate::web::router;
    use crate::web::test_support::{app_state, send};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn state_endpoint_returns_persisted_field_names() {
        let state = app_state(Some(vec![]));
        state.store.set_config(ConfigPatch {
            rotation_enabled: Some(true),
            rotation_schedule: Some(vec![RotationScheduleItem {
                camera_id: 1,
                duration_seconds: 60,
            }]),
            ..Default::default()
        });

        let (status, body) = send(router(state), "GET", "/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rotationEnabled"], true);
        assert_eq!(body["rotationSchedule"][0]["durationSeconds"], 60);
        assert_eq!(body["currentScheduleIndex"], 0);
        assert!(body["currentSourceId"].is_null());
    }

    #[tokio::test]
    async fn sources_endpoint_proxies_provider() {
        let cam = Source {
            id: 7,
            name: "Gate".to_string(),
            kind: "camera".to_string(),
            enabled: true,
            healthy: true,
            uri: String::new(),
        };
        let app = router(app_state(Some(vec![cam])));
        let (status, body) = send(app, "GET", "/sources", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], 7);
        assert_eq!(body[0]["type"], "camera");

        let (status, body) = send(router(app_state(None)), "GET", "/sources", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn scheduler_endpoint_reports_unknown_mode_before_first_run() {
        let (status, body) = send(router(app_state(None)), "GET", "/scheduler", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["mode"].is_null());
        assert!(body["next_wakeup_in_seconds"].is_null());
        assert_eq!(body["config_revision"], 0);
    }
}
