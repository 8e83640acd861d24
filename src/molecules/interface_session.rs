// 虚拟网卡会话：Inactive → Active → Closed
//
// 描述符交给转发进程后仍由本会话持有，关闭权只在协调器手中。

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::atoms::{InterfaceConfig, NetworkPlatform, VpnError, VpnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Inactive,
    Active,
    Closed,
}

struct Inner {
    state: InterfaceState,
    descriptor: Option<OwnedFd>,
}

pub struct InterfaceSession {
    config: Arc<InterfaceConfig>,
    platform: Arc<dyn NetworkPlatform>,
    inner: Mutex<Inner>,
}

impl InterfaceSession {
    pub fn new(config: Arc<InterfaceConfig>, platform: Arc<dyn NetworkPlatform>) -> Self {
        Self {
            config,
            platform,
            inner: Mutex::new(Inner {
                state: InterfaceState::Inactive,
                descriptor: None,
            }),
        }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn state(&self) -> InterfaceState {
        self.lock().state
    }

    // 仅在 Active 状态下返回描述符
    pub fn raw_fd(&self) -> Option<RawFd> {
        let inner = self.lock();
        match inner.state {
            InterfaceState::Active => inner.descriptor.as_ref().map(AsRawFd::as_raw_fd),
            _ => None,
        }
    }

    pub async fn create(&self) -> VpnResult<RawFd> {
        if self.state() != InterfaceState::Inactive {
            return Err(VpnError::InterfaceUnavailable(format!(
                "网卡会话状态为 {:?}，无法重复建立",
                self.state()
            )));
        }

        let descriptor = match self.platform.establish(&self.config).await {
            Ok(Some(fd)) => fd,
            Ok(None) => {
                return Err(VpnError::InterfaceUnavailable(
                    "系统未返回网卡描述符".into(),
                ));
            }
            Err(e) => return Err(VpnError::InterfaceUnavailable(e.to_string())),
        };

        let fd = descriptor.as_raw_fd();
        let mut inner = self.lock();
        inner.descriptor = Some(descriptor);
        inner.state = InterfaceState::Active;
        log::info!("虚拟网卡已建立（fd {}）", fd);
        Ok(fd)
    }

    // 只有第一次调用会真正释放描述符，返回值表示本次是否执行了关闭
    pub async fn close(&self) -> bool {
        let descriptor = {
            let mut inner = self.lock();
            if inner.state == InterfaceState::Closed {
                return false;
            }
            inner.state = InterfaceState::Closed;
            inner.descriptor.take()
        };

        let Some(descriptor) = descriptor else {
            return true;
        };
        drop(descriptor);
        self.platform.release().await;
        log::info!("虚拟网卡已关闭");
        true
    }

    // 系统撤销网卡，等同于本地关闭
    pub async fn revoke(&self) -> bool {
        log::warn!("虚拟网卡被系统撤销");
        self.close().await
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, test_config};

    #[tokio::test]
    async fn create_then_close_once() {
        let platform = Arc::new(FakePlatform::default());
        let session = InterfaceSession::new(test_config(), platform.clone());
        assert_eq!(session.state(), InterfaceState::Inactive);
        assert!(session.raw_fd().is_none());

        let fd = session.create().await.unwrap();
        assert_eq!(session.state(), InterfaceState::Active);
        assert_eq!(session.raw_fd(), Some(fd));

        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(session.state(), InterfaceState::Closed);
        assert!(session.raw_fd().is_none());
        assert_eq!(FakePlatform::count(&platform.released), 1);
    }

    #[tokio::test]
    async fn refused_interface_is_unavailable() {
        let platform = Arc::new(FakePlatform {
            refuse: true,
            ..Default::default()
        });
        let session = InterfaceSession::new(test_config(), platform);
        let result = session.create().await;
        assert!(matches!(result, Err(VpnError::InterfaceUnavailable(_))));
        assert_eq!(session.state(), InterfaceState::Inactive);
    }

    #[tokio::test]
    async fn revoke_behaves_like_close() {
        let platform = Arc::new(FakePlatform::default());
        let session = InterfaceSession::new(test_config(), platform.clone());
        session.create().await.unwrap();

        assert!(session.revoke().await);
        assert!(!session.close().await);
        assert_eq!(FakePlatform::count(&platform.released), 1);
    }

    #[tokio::test]
    async fn closed_session_cannot_be_recreated() {
        let platform = Arc::new(FakePlatform::default());
        let session = InterfaceSession::new(test_config(), platform.clone());
        session.close().await;
        assert!(session.create().await.is_err());
        assert_eq!(FakePlatform::count(&platform.established), 0);
    }
}
