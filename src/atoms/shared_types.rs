// 原子层共享类型定义
// 用于存放跨层共享的基础类型

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

// 路由模式
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    #[default]
    FullTunnel,
    BypassList,
    SplitBySubnetExclude,
}

impl RouteMode {
    // 是否需要剔除私有网段
    pub fn excludes_private(self) -> bool {
        !matches!(self, RouteMode::FullTunnel)
    }
}

// 路由策略
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub mode: RouteMode,
    #[serde(default)]
    pub ipv6: bool,
    pub dns_servers: Vec<String>,
    // 为空表示不启用分应用代理
    #[serde(default)]
    pub per_app_list: Vec<String>,
    #[serde(default)]
    pub per_app_is_allowlist: bool,
}

impl RoutingPolicy {
    pub fn per_app_requested(&self) -> bool {
        !self.per_app_list.is_empty()
    }
}

// 虚拟网卡配置，每次会话启动时构建一次，之后不再修改
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub session_name: String,
    pub mtu: u32,
    pub address_v4: Ipv4Net,
    pub peer_v4: Ipv4Addr,
    pub address_v6: Option<Ipv6Net>,
    pub peer_v6: Option<Ipv6Addr>,
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<String>,
    pub allowed_apps: Vec<String>,
    pub disallowed_apps: Vec<String>,
}

impl InterfaceConfig {
    pub fn default_route_count(&self) -> (usize, usize) {
        let v4 = self
            .routes
            .iter()
            .filter(|r| matches!(r, IpNet::V4(n) if n.prefix_len() == 0))
            .count();
        let v6 = self
            .routes
            .iter()
            .filter(|r| matches!(r, IpNet::V6(n) if n.prefix_len() == 0))
            .count();
        (v4, v6)
    }
}

// 系统默认网络。id 在 Linux 上为网卡索引
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub id: u64,
    pub interface: String,
}
