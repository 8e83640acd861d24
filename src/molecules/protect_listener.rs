// Socket 保护监听器
//
// 转发进程每建立一个出站 socket，就连接一次本监听器并附带该 socket 的描述符。
// 监听器将其绑定到当前默认网络（或打上通用保护），回复 1 字节：0 成功，1 失败。
// 单个请求内的任何错误都不会向外传播。

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use super::network_tracker::DefaultNetworkState;
use crate::atoms::shutdown::{self, ShutdownReceiver, ShutdownSender};
use crate::atoms::{DescriptorChannel, Network, NetworkPlatform, VpnError, VpnResult};

pub const PROTECT_PATH: &str = "protect_path";

const SOCKET_MODE: u32 = 0o600;
const ACCEPT_BACKOFF_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectOutcome {
    BoundToNetwork,
    ProtectedFromInterface,
    Failed,
}

impl ProtectOutcome {
    pub fn reply_byte(self) -> u8 {
        match self {
            ProtectOutcome::BoundToNetwork | ProtectOutcome::ProtectedFromInterface => 0,
            ProtectOutcome::Failed => 1,
        }
    }
}

pub fn decide(
    platform: &dyn NetworkPlatform,
    network: Option<&Network>,
    fd: BorrowedFd<'_>,
) -> ProtectOutcome {
    if let Some(network) = network.filter(|_| platform.supports_socket_binding()) {
        match platform.bind_socket(fd, network) {
            Ok(()) => return ProtectOutcome::BoundToNetwork,
            Err(e) if platform.is_benign_bind_error(&e) => {
                log::debug!("绑定到 {} 失败（{}），改用通用保护", network.interface, e);
            }
            Err(e) => {
                log::warn!("绑定 socket 到 {} 失败：{}", network.interface, e);
                return ProtectOutcome::Failed;
            }
        }
    }

    match platform.protect(fd) {
        Ok(()) => ProtectOutcome::ProtectedFromInterface,
        Err(e) => {
            log::warn!("保护 socket 失败：{}", e);
            ProtectOutcome::Failed
        }
    }
}

pub struct ProtectListener {
    path: PathBuf,
    shutdown_tx: ShutdownSender,
    task: Option<JoinHandle<()>>,
}

impl ProtectListener {
    pub fn bind(
        path: impl Into<PathBuf>,
        platform: Arc<dyn NetworkPlatform>,
        state: Arc<DefaultNetworkState>,
    ) -> VpnResult<Self> {
        let path = path.into();
        let bind_error = |source| VpnError::ListenerBind {
            path: path.display().to_string(),
            source,
        };

        // 上次异常退出可能残留 socket 文件；仍有进程在监听时不抢占
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                log::error!("保护 socket 已被其他实例占用：{}", path.display());
                return Err(bind_error(io::Error::from(io::ErrorKind::AddrInUse)));
            }
            std::fs::remove_file(&path).map_err(bind_error)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
                .map_err(bind_error)?;
        }
        log::info!("保护监听器已启动：{}", path.display());

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let task = tokio::spawn(accept_loop(listener, platform, state, shutdown_rx));

        Ok(Self {
            path,
            shutdown_tx,
            task: Some(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // 关闭监听句柄；已接受的请求在各自任务中完成
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.shutdown_tx.send_replace(true);
        if let Err(e) = task.await {
            log::warn!("保护监听器任务异常结束：{}", e);
        }
        self.remove_socket_file();
        log::info!("保护监听器已停止");
    }

    fn remove_socket_file(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ProtectListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown_tx.send_replace(true);
            task.abort();
            self.remove_socket_file();
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    platform: Arc<dyn NetworkPlatform>,
    state: Arc<DefaultNetworkState>,
    mut shutdown_rx: ShutdownReceiver,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _addr)) => {
                    tokio::spawn(handle_connection(stream, platform.clone(), state.clone()));
                }
                Err(e) => {
                    log::error!("保护监听器 accept 失败：{}", e);
                    sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                }
            },
            _ = shutdown::wait_shutdown(&mut shutdown_rx) => break,
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    platform: Arc<dyn NetworkPlatform>,
    state: Arc<DefaultNetworkState>,
) {
    // 帧字节与描述符在同一次 recvmsg 中读取
    let fd = match stream.receive().await {
        Ok(Some(fd)) => fd,
        Ok(None) => {
            log::debug!("保护请求未附带描述符，关闭连接");
            return;
        }
        Err(e) => {
            log::debug!("读取保护请求失败：{}", e);
            return;
        }
    };

    let outcome = decide(platform.as_ref(), state.current().as_ref(), fd.as_fd());
    // 本地副本在此关闭，不影响对端进程中的描述符
    drop(fd);

    if let Err(e) = stream.write_all(&[outcome.reply_byte()]).await {
        log::debug!("回复保护结果失败：{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::fd_channel::send_fd;
    use crate::testing::{FakePlatform, wlan};
    use std::os::fd::AsRawFd;
    use tokio::io::AsyncReadExt;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NOT_ON_NETWORK: i32 = libc::ENONET;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NOT_ON_NETWORK: i32 = libc::ENODEV;

    fn binding_platform(bind_errno: Option<i32>, protect_fails: bool) -> FakePlatform {
        FakePlatform {
            socket_binding: true,
            bind_errno,
            protect_fails,
            ..Default::default()
        }
    }

    fn outcome_for(platform: &FakePlatform, network: Option<Network>) -> ProtectOutcome {
        let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        decide(platform, network.as_ref(), socket.as_fd())
    }

    #[test]
    fn bound_network_replies_zero() {
        let platform = binding_platform(None, false);
        let outcome = outcome_for(&platform, Some(wlan()));
        assert_eq!(outcome, ProtectOutcome::BoundToNetwork);
        assert_eq!(outcome.reply_byte(), 0);
        assert_eq!(FakePlatform::count(&platform.protected), 0);
    }

    #[test]
    fn not_on_network_falls_back_to_protect() {
        let platform = binding_platform(Some(NOT_ON_NETWORK), false);
        assert_eq!(outcome_for(&platform, Some(wlan())).reply_byte(), 0);
        assert_eq!(FakePlatform::count(&platform.protected), 1);

        let platform = binding_platform(Some(NOT_ON_NETWORK), true);
        assert_eq!(outcome_for(&platform, Some(wlan())).reply_byte(), 1);
    }

    #[test]
    fn other_bind_errors_report_failure() {
        let platform = binding_platform(Some(libc::EPERM), false);
        assert_eq!(outcome_for(&platform, Some(wlan())), ProtectOutcome::Failed);
        assert_eq!(FakePlatform::count(&platform.protected), 0);
    }

    #[test]
    fn no_network_or_no_binding_uses_protect() {
        let platform = binding_platform(None, false);
        assert_eq!(
            outcome_for(&platform, None),
            ProtectOutcome::ProtectedFromInterface
        );

        let platform = FakePlatform::default();
        assert_eq!(
            outcome_for(&platform, Some(wlan())),
            ProtectOutcome::ProtectedFromInterface
        );
        assert_eq!(FakePlatform::count(&platform.bound), 0);
    }

    async fn request(path: &Path, with_fd: bool) -> Vec<u8> {
        let mut client = UnixStream::connect(path).await.unwrap();
        if with_fd {
            let (socket, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
            send_fd(&client, socket.as_raw_fd(), 1).await.unwrap();
        } else {
            client.write_all(&[1]).await.unwrap();
        }
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn serves_requests_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROTECT_PATH);
        let platform = Arc::new(binding_platform(None, false));
        let state = DefaultNetworkState::new();
        super::super::network_tracker::apply(
            platform.as_ref(),
            &state,
            crate::atoms::NetworkEvent::Available(wlan()),
        );

        let mut listener = ProtectListener::bind(&path, platform.clone(), state).unwrap();
        assert_eq!(request(&path, true).await, vec![0]);
        assert_eq!(request(&path, true).await, vec![0]);
        assert_eq!(FakePlatform::count(&platform.bound), 2);

        // 未附带描述符：直接关闭，无回复
        assert!(request(&path, false).await.is_empty());

        listener.stop().await;
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).await.is_err());
        listener.stop().await;
    }

    #[tokio::test]
    async fn concurrent_requests_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROTECT_PATH);
        let platform = Arc::new(binding_platform(None, true));
        let mut listener =
            ProtectListener::bind(&path, platform.clone(), DefaultNetworkState::new()).unwrap();

        let replies = futures_util::future::join_all((0..8).map(|_| request(&path, true))).await;
        assert!(replies.iter().all(|r| r == &vec![1]));
        assert_eq!(FakePlatform::count(&platform.protected), 8);
        listener.stop().await;
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROTECT_PATH);
        std::fs::write(&path, b"stale").unwrap();

        let platform = Arc::new(FakePlatform::default());
        let mut listener =
            ProtectListener::bind(&path, platform, DefaultNetworkState::new()).unwrap();
        assert_eq!(request(&path, true).await, vec![0]);
        listener.stop().await;

        // 无人监听的 socket 文件同样视为残留
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let mut listener = ProtectListener::bind(
            &path,
            Arc::new(FakePlatform::default()),
            DefaultNetworkState::new(),
        )
        .unwrap();
        assert_eq!(request(&path, true).await, vec![0]);
        listener.stop().await;
    }

    #[tokio::test]
    async fn live_listener_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROTECT_PATH);
        let platform = Arc::new(FakePlatform::default());
        let mut first =
            ProtectListener::bind(&path, platform.clone(), DefaultNetworkState::new()).unwrap();

        let second = ProtectListener::bind(&path, platform.clone(), DefaultNetworkState::new());
        match second {
            Err(VpnError::ListenerBind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            _ => panic!("第二个实例不应绑定成功"),
        }

        assert_eq!(request(&path, true).await, vec![0]);
        assert_eq!(FakePlatform::count(&platform.protected), 1);
        first.stop().await;
    }
}
