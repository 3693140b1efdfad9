use crate::state::{
    ConfigError, ConfigPatch, RotationScheduleItem, SharedState, SourceId, SwitcherState,
};
use crate::upstream::UpstreamError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// 控制面错误，映射为 HTTP 状态码
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("no configuration fields provided")]
    EmptyPatch,

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::Invalid(_) | ControlError::EmptyPatch => StatusCode::BAD_REQUEST,
            ControlError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedSourceBody {
    pub source_id: Option<SourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CamerasBody {
    pub camera_ids: BTreeSet<SourceId>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    pub schedule: Vec<RotationScheduleItem>,
}

/// 校验后写入配置；被拒绝的请求不改变状态，也不触发通知
fn apply(state: &SharedState, patch: ConfigPatch) -> Result<Json<SwitcherState>, ControlError> {
    if patch.is_empty() {
        return Err(ControlError::EmptyPatch);
    }
    if let Err(e) = patch.validate() {
        warn!("Rejected configuration change: {}", e);
        return Err(e.into());
    }
    info!("Applying configuration change: {:?}", patch);
    Ok(Json(state.store.set_config(patch)))
}

/// 开启或关闭轮播
pub async fn set_rotation_enabled(
    State(state): State<SharedState>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<SwitcherState>, ControlError> {
    apply(
        &state,
        ConfigPatch {
            rotation_enabled: Some(body.enabled),
            ..Default::default()
        },
    )
}

/// 设置或清除固定信号源
pub async fn set_fixed_source(
    State(state): State<SharedState>,
    Json(body): Json<FixedSourceBody>,
) -> Result<Json<SwitcherState>, ControlError> {
    apply(
        &state,
        ConfigPatch {
            fixed_source_id: Some(body.source_id),
            ..Default::default()
        },
    )
}

/// 设置参与轮播的摄像头集合 (空集合表示全部)
pub async fn set_selected_cameras(
    State(state): State<SharedState>,
    Json(body): Json<CamerasBody>,
) -> Result<Json<SwitcherState>, ControlError> {
    apply(
        &state,
        ConfigPatch {
            selected_camera_ids: Some(body.camera_ids),
            ..Default::default()
        },
    )
}

/// 替换轮播计划
pub async fn set_rotation_schedule(
    State(state): State<SharedState>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<SwitcherState>, ControlError> {
    apply(
        &state,
        ConfigPatch {
            rotation_schedule: Some(body.schedule),
            ..Default::default()
        },
    )
}

/// 一次修改多个配置字段
pub async fn patch_config(
    State(state): State<SharedState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<SwitcherState>, ControlError> {
    apply(&state, patch)
}

#[cfg(test)]
mod tests {
    use crate::web::router;
    use crate::web::test_support::{app_state, send};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn each_setter_notifies_once() {
        let state = app_state(Some(vec![]));
        let app = router(state.clone());

        let calls = [
            ("/rotation/enabled", r#"{"enabled": true}"#),
            ("/rotation/fixed", r#"{"sourceId": 5}"#),
            ("/rotation/cameras", r#"{"cameraIds": [3, 1, 3]}"#),
            (
                "/rotation/schedule",
                r#"{"schedule": [{"cameraId": 1, "durationSeconds": 60}, {"cameraId": 3, "durationSeconds": 120}]}"#,
            ),
        ];
        for (i, (uri, body)) in calls.into_iter().enumerate() {
            let (status, _) = send(app.clone(), "PUT", uri, Some(body)).await;
            assert_eq!(status, StatusCode::OK, "{}", uri);
            assert_eq!(state.store.config_revision(), i as u64 + 1);
        }

        let snapshot = state.store.read();
        assert!(snapshot.rotation_enabled);
        assert_eq!(snapshot.fixed_source_id, Some(5));
        assert_eq!(snapshot.selected_camera_ids, [1, 3].into());
        assert_eq!(snapshot.rotation_schedule.len(), 2);
        assert_eq!(snapshot.current_schedule_index, Some(0));
    }

    #[tokio::test]
    async fn batched_patch_notifies_once() {
        let state = app_state(Some(vec![]));
        let (status, body) = send(
            router(state.clone()),
            "PATCH",
            "/config",
            Some(
                r#"{"rotationEnabled": false, "fixedSourceId": 2, "selectedCameraIds": [], "rotationSchedule": []}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fixedSourceId"], 2);
        assert_eq!(state.store.config_revision(), 1);
    }

    #[tokio::test]
    async fn clearing_fixed_source_with_null() {
        let state = app_state(Some(vec![]));
        let app = router(state.clone());
        send(app.clone(), "PUT", "/rotation/fixed", Some(r#"{"sourceId": 5}"#)).await;
        let (status, body) =
            send(app, "PUT", "/rotation/fixed", Some(r#"{"sourceId": null}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["fixedSourceId"].is_null());
        assert_eq!(state.store.read().fixed_source_id, None);
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected_without_notification() {
        let state = app_state(Some(vec![]));
        let app = router(state.clone());
        send(
            app.clone(),
            "PUT",
            "/rotation/schedule",
            Some(r#"{"schedule": [{"cameraId": 1, "durationSeconds": 10}]}"#),
        )
        .await;
        let before = state.store.read();

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/rotation/schedule",
            Some(r#"{"schedule": [{"cameraId": 1, "durationSeconds": 10}, {"cameraId": 2, "durationSeconds": 0}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("camera 2"));

        // 负数无法解析为时长，由 JSON 提取器拒绝
        let (status, _) = send(
            app,
            "PUT",
            "/rotation/schedule",
            Some(r#"{"schedule": [{"cameraId": 1, "durationSeconds": -5}]}"#),
        )
        .await;
        assert!(status.is_client_error());

        assert_eq!(state.store.read(), before);
        assert_eq!(state.store.config_revision(), 1);
    }

    #[tokio::test]
    async fn overlong_duration_is_rejected() {
        let state = app_state(Some(vec![]));
        let (status, body) = send(
            router(state.clone()),
            "PATCH",
            "/config",
            Some(
                r#"{"rotationEnabled": true, "rotationSchedule": [{"cameraId": 1, "durationSeconds": 18446744073709551615}]}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("exceeds"));
        assert!(!state.store.read().rotation_enabled);
        assert_eq!(state.store.config_revision(), 0);
    }

    #[tokio::test]
    async fn empty_or_operational_patch_is_rejected() {
        let state = app_state(Some(vec![]));
        let app = router(state.clone());

        let (status, _) = send(app.clone(), "PATCH", "/config", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app, "PATCH", "/config", Some(r#"{"currentSourceId": 4}"#)).await;
        assert!(status.is_client_error());

        assert_eq!(state.store.config_revision(), 0);
    }
}
