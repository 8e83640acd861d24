// 测试替身：可配置行为的平台与进程守护实现

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::atoms::{
    InterfaceConfig, Network, NetworkCallback, NetworkEvent, NetworkPlatform, NetworkRequestId,
    ProcessSupervisor, RestartCallback, RouteMode, RoutingPolicy,
};
use crate::molecules::route_config;
use crate::vpn::profile::Profile;

pub const SELF_ID: &str = "io.github.tunnel_hub";

pub fn test_policy(mode: RouteMode) -> RoutingPolicy {
    RoutingPolicy {
        mode,
        ipv6: false,
        dns_servers: vec!["1.1.1.1".into()],
        per_app_list: Vec::new(),
        per_app_is_allowlist: false,
    }
}

pub fn test_config() -> Arc<InterfaceConfig> {
    Arc::new(route_config::build(&test_policy(RouteMode::FullTunnel), SELF_ID).unwrap())
}

pub fn test_profile(runtime_dir: &Path) -> Profile {
    Profile {
        name: "test".into(),
        policy: test_policy(RouteMode::FullTunnel),
        socks_host: "127.0.0.1".into(),
        socks_port: 1080,
        local_dns_port: 5450,
        udp_dns: false,
        forwarding_binary: "/opt/tun2socks".into(),
        runtime_dir: runtime_dir.to_path_buf(),
        log_level: 3,
        app_id: SELF_ID.into(),
    }
}

pub fn wlan() -> Network {
    Network {
        id: 3,
        interface: "wlan0".into(),
    }
}

// 以 socketpair 代替 TUN 描述符
#[derive(Default)]
pub struct FakePlatform {
    pub refuse: bool,
    pub default_network: bool,
    pub socket_binding: bool,
    pub bind_errno: Option<i32>,
    pub protect_fails: bool,
    pub established: AtomicUsize,
    pub released: AtomicUsize,
    pub bound: AtomicUsize,
    pub protected: AtomicUsize,
    pub unregistered: AtomicUsize,
    pub callback: Mutex<Option<NetworkCallback>>,
    pub underlying: Mutex<Vec<Option<Network>>>,
    pub peers: Mutex<Vec<StdUnixStream>>,
    // notify_one 模拟系统撤销网卡
    pub revoked: Notify,
}

impl FakePlatform {
    pub fn emit(&self, event: NetworkEvent) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkPlatform for FakePlatform {
    async fn establish(&self, _config: &InterfaceConfig) -> io::Result<Option<OwnedFd>> {
        if self.refuse {
            return Ok(None);
        }
        self.established.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = StdUnixStream::pair()?;
        self.peers.lock().unwrap().push(theirs);
        Ok(Some(OwnedFd::from(ours)))
    }

    async fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_default_network(&self) -> bool {
        self.default_network
    }

    async fn request_default_network(
        &self,
        callback: NetworkCallback,
    ) -> io::Result<NetworkRequestId> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(NetworkRequestId(1))
    }

    fn unregister_network_request(&self, _id: NetworkRequestId) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = None;
    }

    fn supports_socket_binding(&self) -> bool {
        self.socket_binding
    }

    fn bind_socket(&self, _fd: BorrowedFd<'_>, _network: &Network) -> io::Result<()> {
        self.bound.fetch_add(1, Ordering::SeqCst);
        match self.bind_errno {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn protect(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
        self.protected.fetch_add(1, Ordering::SeqCst);
        if self.protect_fails {
            Err(io::Error::from_raw_os_error(libc::EPERM))
        } else {
            Ok(())
        }
    }

    fn set_underlying_network(&self, network: Option<&Network>) {
        self.underlying.lock().unwrap().push(network.cloned());
    }

    async fn wait_revoked(&self) {
        self.revoked.notified().await;
    }
}

// 记录启动参数，可手动触发"进程重启"
#[derive(Default)]
pub struct FakeSupervisor {
    pub fail_start: bool,
    pub command_lines: Mutex<Vec<Vec<String>>>,
    pub on_restart: Mutex<Option<RestartCallback>>,
    pub stopped: AtomicUsize,
}

impl FakeSupervisor {
    pub fn restart(&self) -> Option<BoxFuture<'static, ()>> {
        self.on_restart.lock().unwrap().as_ref().map(|callback| callback())
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start(&self, command_line: Vec<String>, on_restart: RestartCallback) -> io::Result<()> {
        if self.fail_start {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.command_lines.lock().unwrap().push(command_line);
        *self.on_restart.lock().unwrap() = Some(on_restart);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        *self.on_restart.lock().unwrap() = None;
    }
}

// 同一 socket 的不同描述符共享 inode
pub fn inode_of(fd: &OwnedFd) -> u64 {
    let file = std::fs::File::from(fd.try_clone().unwrap());
    std::os::unix::fs::MetadataExt::ino(&file.metadata().unwrap())
}
