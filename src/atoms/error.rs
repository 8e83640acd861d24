// 控制面错误类型
// 协议层面的"保护失败"不属于错误，见 protect_listener::ProtectOutcome

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("路由策略无效：{0}")]
    InvalidPolicy(String),

    // 唯一允许直接提示用户的创建失败：系统拒绝建立虚拟网卡
    #[error("无法建立虚拟网卡，请重启设备或应用：{0}")]
    InterfaceUnavailable(String),

    #[error("传递 TUN 描述符失败（已尝试 {tries} 次）：{source}")]
    HandoffFailed {
        tries: u32,
        #[source]
        source: io::Error,
    },

    #[error("会话已停止，放弃后续操作")]
    Cancelled,

    #[error("保护监听器绑定失败：{path}：{source}")]
    ListenerBind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("启动转发进程失败：{0}")]
    ProcessSpawn(#[source] io::Error),

    #[error("转发进程异常退出过快：{0}")]
    ProcessCrashed(String),

    #[error("会话已在运行")]
    AlreadyRunning,

    #[error("IO 错误：{0}")]
    Io(#[from] io::Error),
}

impl VpnError {
    // 需要终止会话并提示用户的错误
    pub fn is_user_fatal(&self) -> bool {
        matches!(
            self,
            VpnError::InterfaceUnavailable(_) | VpnError::HandoffFailed { .. }
        )
    }
}

pub type VpnResult<T> = std::result::Result<T, VpnError>;
