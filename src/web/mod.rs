pub mod admin;
pub mod control;

use crate::state::SharedState;
use axum::{
    routing::{get, patch, put},
    Router,
};

/// 注册控制面路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(admin::index_handler)) // 首页
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/state", get(admin::get_state)) // 切换器状态快照
        .route("/sources", get(admin::list_sources)) // 上游信号源列表
        .route("/scheduler", get(admin::scheduler_status)) // 调度器状态
        .route("/rotation/enabled", put(control::set_rotation_enabled))
        .route("/rotation/fixed", put(control::set_fixed_source))
        .route("/rotation/cameras", put(control::set_selected_cameras))
        .route("/rotation/schedule", put(control::set_rotation_schedule))
        .route("/config", patch(control::patch_config)) // 批量修改，只触发一次通知
        .with_state(state)
}
