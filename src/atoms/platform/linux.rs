// Linux 平台实现：/dev/net/tun + ip 命令 + 策略路由
//
// 隧道路由写入独立路由表，并以 `not fwmark` 规则引流；
// 被保护的 socket 打上 fwmark 后走主路由表。

use super::{NetworkCallback, NetworkEvent, NetworkPlatform, NetworkRequestId};
use crate::atoms::shared_types::{InterfaceConfig, Network};
use async_trait::async_trait;
use ipnet::IpNet;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use nix::sys::socket::{setsockopt, sockopt};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const DEFAULT_FWMARK: u32 = 0x1c9;
const DEFAULT_ROUTE_TABLE: u32 = 0x1c9;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const PROC_NET_ROUTE: &str = "/proc/net/route";

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

pub struct LinuxPlatform {
    tun_name: String,
    fwmark: u32,
    route_table: u32,
    poll_interval: Duration,
    state: Arc<Mutex<LinuxState>>,
}

#[derive(Default)]
struct LinuxState {
    device: Option<String>,
    ipv6: bool,
    next_request: u64,
    requests: HashMap<u64, JoinHandle<()>>,
}

impl LinuxPlatform {
    pub fn new(tun_name: impl Into<String>) -> Self {
        Self {
            tun_name: tun_name.into(),
            fwmark: DEFAULT_FWMARK,
            route_table: DEFAULT_ROUTE_TABLE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            state: Arc::new(Mutex::new(LinuxState::default())),
        }
    }

    pub fn with_fwmark(mut self, fwmark: u32) -> Self {
        self.fwmark = fwmark;
        self
    }

    pub fn with_route_table(mut self, route_table: u32) -> Self {
        self.route_table = route_table;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LinuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_device(&self) -> Option<String> {
        self.lock_state().device.clone()
    }
}

#[async_trait]
impl NetworkPlatform for LinuxPlatform {
    async fn establish(&self, config: &InterfaceConfig) -> io::Result<Option<OwnedFd>> {
        if !nix::unistd::Uid::effective().is_root() {
            log::warn!("当前非 root 用户，建立 TUN 需要 CAP_NET_ADMIN");
        }
        if !config.allowed_apps.is_empty() || !config.disallowed_apps.is_empty() {
            log::warn!("Linux 平台不支持分应用代理，忽略应用列表");
        }

        let setup = RouteSetup {
            tun_name: self.tun_name.clone(),
            fwmark: self.fwmark,
            route_table: self.route_table,
            config: config.clone(),
        };
        let (device, fd) = tokio::task::spawn_blocking(move || setup.apply())
            .await
            .map_err(io::Error::other)??;

        let mut state = self.lock_state();
        state.device = Some(device);
        state.ipv6 = config.address_v6.is_some();
        Ok(Some(fd))
    }

    async fn release(&self) {
        let (device, ipv6) = {
            let mut state = self.lock_state();
            (state.device.take(), state.ipv6)
        };
        let Some(device) = device else {
            return;
        };

        let rule_args = rule_args(self.fwmark, self.route_table);
        let result = tokio::task::spawn_blocking(move || {
            remove_rules(&rule_args, ipv6);
        })
        .await;
        if let Err(e) = result {
            log::warn!("清理 {} 的策略路由失败：{}", device, e);
        } else {
            log::info!("已清理 {} 的策略路由", device);
        }
    }

    fn supports_default_network(&self) -> bool {
        true
    }

    async fn request_default_network(
        &self,
        callback: NetworkCallback,
    ) -> io::Result<NetworkRequestId> {
        let poll_interval = self.poll_interval;
        let state = self.state.clone();
        let tun_name = self.tun_name.clone();

        let task = tokio::spawn(async move {
            let mut current: Option<Network> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let skip = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .device
                    .clone()
                    .unwrap_or_else(|| tun_name.clone());

                let next = match tokio::fs::read_to_string(PROC_NET_ROUTE).await {
                    Ok(contents) => {
                        parse_default_route(&contents, &skip).and_then(|name| resolve_network(&name))
                    }
                    Err(e) => {
                        log::debug!("读取 {} 失败：{}", PROC_NET_ROUTE, e);
                        continue;
                    }
                };

                if next == current {
                    continue;
                }
                match (&current, &next) {
                    (Some(lost), None) => callback(NetworkEvent::Lost(lost.clone())),
                    (Some(old), Some(new)) if old.interface == new.interface => {
                        callback(NetworkEvent::CapabilitiesChanged(new.clone()))
                    }
                    (_, Some(new)) => callback(NetworkEvent::Available(new.clone())),
                    (None, None) => {}
                }
                current = next;
            }
        });

        let mut state = self.lock_state();
        let id = state.next_request;
        state.next_request += 1;
        state.requests.insert(id, task);
        Ok(NetworkRequestId(id))
    }

    fn unregister_network_request(&self, id: NetworkRequestId) {
        if let Some(task) = self.lock_state().requests.remove(&id.0) {
            task.abort();
        }
    }

    fn supports_socket_binding(&self) -> bool {
        true
    }

    fn bind_socket(&self, fd: BorrowedFd<'_>, network: &Network) -> io::Result<()> {
        setsockopt(
            &fd,
            sockopt::BindToDevice,
            &OsString::from(network.interface.as_str()),
        )
        .map_err(io::Error::from)
    }

    fn protect(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        setsockopt(&fd, sockopt::Mark, &self.fwmark).map_err(io::Error::from)
    }

    // 轮询网卡列表，已建立的 TUN 设备消失即视为撤销（如被 `ip link del` 删除）
    async fn wait_revoked(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let Some(device) = self.current_device() else {
                continue;
            };
            let interfaces = match NetworkInterface::show() {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    log::debug!("枚举网卡失败：{}", e);
                    continue;
                }
            };
            if !device_present(interfaces.iter().map(|iface| iface.name.as_str()), &device) {
                log::warn!("TUN 设备 {} 已不存在", device);
                return;
            }
        }
    }
}

fn device_present<'a>(mut names: impl Iterator<Item = &'a str>, device: &str) -> bool {
    names.any(|name| name == device)
}

struct RouteSetup {
    tun_name: String,
    fwmark: u32,
    route_table: u32,
    config: InterfaceConfig,
}

impl RouteSetup {
    fn apply(self) -> io::Result<(String, OwnedFd)> {
        let (device, fd) = open_tun(&self.tun_name)?;
        log::info!("已创建 TUN 设备：{}", device);

        let config = &self.config;
        let table = self.route_table.to_string();
        let mtu = config.mtu.to_string();

        run_ip(&["addr", "add", &config.address_v4.to_string(), "dev", &device])?;
        if let Some(v6) = config.address_v6 {
            run_ip(&["-6", "addr", "add", &v6.to_string(), "dev", &device])?;
        }
        run_ip(&["link", "set", "dev", &device, "mtu", &mtu, "up"])?;

        for route in &config.routes {
            let family = match route {
                IpNet::V4(_) => "-4",
                IpNet::V6(_) => "-6",
            };
            run_ip(&[
                family,
                "route",
                "replace",
                &route.to_string(),
                "dev",
                &device,
                "table",
                &table,
            ])?;
        }

        let rules = rule_args(self.fwmark, self.route_table);
        let ipv6 = config.address_v6.is_some();
        remove_rules(&rules, ipv6);
        add_rules(&rules, ipv6, run_rule)?;

        if let Err(e) = apply_dns(&device, &config.dns_servers) {
            log::warn!("设置 {} 的 DNS 失败：{}", device, e);
        }

        Ok((device, fd))
    }
}

fn open_tun(name: &str) -> io::Result<(String, OwnedFd)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/net/tun")?;

    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _padding: [0; 22],
    };
    for (slot, byte) in ifr
        .ifr_name
        .iter_mut()
        .zip(name.as_bytes().iter().take(libc::IFNAMSIZ - 1))
    {
        *slot = *byte as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut IfReq) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let device = ifr
        .ifr_name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect::<String>();
    Ok((device, OwnedFd::from(file)))
}

fn rule_args(fwmark: u32, route_table: u32) -> Vec<Vec<String>> {
    vec![
        vec![
            "not".into(),
            "fwmark".into(),
            fwmark.to_string(),
            "table".into(),
            route_table.to_string(),
        ],
        // 主表中的精确路由（如局域网）优先于隧道默认路由
        vec![
            "table".into(),
            "main".into(),
            "suppress_prefixlength".into(),
            "0".into(),
        ],
    ]
}

fn remove_rules(rules: &[Vec<String>], ipv6: bool) {
    remove_rules_with(rules, ipv6, &mut run_rule);
}

fn remove_rules_with<F>(rules: &[Vec<String>], ipv6: bool, run: &mut F)
where
    F: FnMut(&str, &str, &[String]) -> io::Result<()>,
{
    for args in rules {
        let _ = run("-4", "del", args);
        if ipv6 {
            let _ = run("-6", "del", args);
        }
    }
}

// 任一规则添加失败时撤回全部规则，不留下半套策略路由
fn add_rules<F>(rules: &[Vec<String>], ipv6: bool, mut run: F) -> io::Result<()>
where
    F: FnMut(&str, &str, &[String]) -> io::Result<()>,
{
    let mut added = || -> io::Result<()> {
        for args in rules {
            run("-4", "add", args)?;
            if ipv6 {
                run("-6", "add", args)?;
            }
        }
        Ok(())
    };
    let result = added();
    if let Err(e) = &result {
        log::warn!("添加策略路由失败，撤回已添加的规则：{}", e);
        remove_rules_with(rules, ipv6, &mut run);
    }
    result
}

fn run_rule(family: &str, verb: &str, args: &[String]) -> io::Result<()> {
    let mut full = vec![family, "rule", verb];
    full.extend(args.iter().map(String::as_str));
    run_ip(&full)
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    log::debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!(
            "ip {} 执行失败：{}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

fn apply_dns(device: &str, servers: &[String]) -> io::Result<()> {
    let mut args = vec!["dns", device];
    args.extend(servers.iter().map(String::as_str));
    let output = Command::new("resolvectl").args(&args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

// 解析 /proc/net/route，返回度量值最小的默认路由网卡
fn parse_default_route(contents: &str, skip: &str) -> Option<String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (iface, destination, metric, mask) =
                (fields.first()?, fields.get(1)?, fields.get(6)?, fields.get(7)?);
            if *destination != "00000000" || *mask != "00000000" || *iface == skip {
                return None;
            }
            Some((metric.parse::<u32>().unwrap_or(u32::MAX), iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

fn resolve_network(name: &str) -> Option<Network> {
    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::debug!("枚举网卡失败：{}", e);
            return None;
        }
    };
    interfaces
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| Network {
            id: u64::from(iface.index),
            interface: iface.name,
        })
}
