// 分子层共享类型：会话阶段，通过 watch 通道对外发布

use serde::Serialize;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Configuring,
    InterfaceActive,
    ForwardingRunning,
    TornDown,
    Error,
}

impl SessionPhase {
    // 会话结束（正常或异常）
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::TornDown | SessionPhase::Error)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionPhase::Configuring
                | SessionPhase::InterfaceActive
                | SessionPhase::ForwardingRunning
        )
    }
}
