//! 核心层：错误分类与恢复策略、编排入口、服务装配

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;

pub use builder::Services;
pub use error::{sanitize_error, OrchestratorError};
pub use orchestrator::{Coordinator, UserRequest, USER_MESSAGE};
pub use recovery::{RecoveryAction, RecoveryEngine};
