// 系统网络能力抽象：建立虚拟网卡、追踪默认网络、保护 socket
//
// 控制面只依赖此 trait；Android 等宿主可通过 JNI 自行实现，
// Linux 桌面/服务器使用 LinuxPlatform。

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

use async_trait::async_trait;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

use super::shared_types::{InterfaceConfig, Network};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxPlatform;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(Network),
    CapabilitiesChanged(Network),
    Lost(Network),
}

// 回调可能来自任意线程
pub type NetworkCallback = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkRequestId(pub u64);

#[async_trait]
pub trait NetworkPlatform: Send + Sync {
    // 返回 None 表示系统拒绝建立（权限被撤销、策略禁止等）
    async fn establish(&self, config: &InterfaceConfig) -> io::Result<Option<OwnedFd>>;

    // 虚拟网卡描述符已关闭，清理建立时附带的系统状态
    async fn release(&self) {}

    fn supports_default_network(&self) -> bool;

    // 请求（而非监听）系统当前默认网络，避免把隧道自身报告为默认网络
    async fn request_default_network(&self, callback: NetworkCallback)
    -> io::Result<NetworkRequestId>;

    fn unregister_network_request(&self, id: NetworkRequestId);

    fn supports_socket_binding(&self) -> bool;

    fn bind_socket(&self, fd: BorrowedFd<'_>, network: &Network) -> io::Result<()>;

    // 通用保护：使 socket 流量不经过虚拟网卡
    fn protect(&self, fd: BorrowedFd<'_>) -> io::Result<()>;

    fn set_underlying_network(&self, _network: Option<&Network>) {}

    // 虚拟网卡被系统从外部撤销时返回；无法检测的平台永不返回
    async fn wait_revoked(&self) {
        std::future::pending::<()>().await
    }

    fn is_benign_bind_error(&self, error: &io::Error) -> bool {
        is_benign_bind_error(error)
    }
}

// 绑定失败白名单：ENONET（机器不在该网络）、ENODEV（网卡已消失）
#[cfg(any(target_os = "linux", target_os = "android"))]
const BENIGN_BIND_ERRNOS: &[i32] = &[libc::ENONET, libc::ENODEV];
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const BENIGN_BIND_ERRNOS: &[i32] = &[libc::ENODEV];

pub fn is_benign_bind_error(error: &io::Error) -> bool {
    error
        .raw_os_error()
        .is_some_and(|code| BENIGN_BIND_ERRNOS.contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_on_network_is_benign() {
        assert!(is_benign_bind_error(&io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_benign_bind_error(&io::Error::from_raw_os_error(libc::EPERM)));
        assert!(!is_benign_bind_error(&io::Error::other("custom")));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn enonet_is_benign_on_linux() {
        assert_eq!(libc::ENONET, 64);
        assert!(is_benign_bind_error(&io::Error::from_raw_os_error(64)));
    }
}
