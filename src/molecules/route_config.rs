// 虚拟网卡配置构建：路由策略 → 地址、路由、DNS、分应用列表
//
// 纯函数，不触碰系统状态。

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::atoms::private_ranges;
use crate::atoms::{InterfaceConfig, RoutingPolicy, VpnError, VpnResult};

pub const VPN_MTU: u32 = 1500;
pub const DEFAULT_SESSION_NAME: &str = "tunnel_hub";

// 172.19.0.0/24：.1 为本机，.2 为转发进程
const PRIVATE_VLAN4: [u8; 3] = [172, 19, 0];
const PRIVATE_VLAN4_PREFIX: u8 = 24;
// fdfe:dcba:9876::/126
const PRIVATE_VLAN6: [u16; 3] = [0xfdfe, 0xdcba, 0x9876];
const PRIVATE_VLAN6_PREFIX: u8 = 126;

static APP_ID_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)*$").ok());

pub fn vlan4(host: u8) -> Ipv4Addr {
    Ipv4Addr::new(PRIVATE_VLAN4[0], PRIVATE_VLAN4[1], PRIVATE_VLAN4[2], host)
}

pub fn vlan6(host: u16) -> Ipv6Addr {
    Ipv6Addr::new(
        PRIVATE_VLAN6[0],
        PRIVATE_VLAN6[1],
        PRIVATE_VLAN6[2],
        0,
        0,
        0,
        0,
        host,
    )
}

pub fn is_valid_app_id(id: &str) -> bool {
    APP_ID_PATTERN.as_ref().is_some_and(|re| re.is_match(id))
}

// 使用默认会话名与 MTU 构建
pub fn build(policy: &RoutingPolicy, app_self_id: &str) -> VpnResult<InterfaceConfig> {
    RouteConfigBuilder::new(app_self_id).build(policy)
}

pub struct RouteConfigBuilder<'a> {
    app_self_id: &'a str,
    session_name: String,
    mtu: u32,
}

impl<'a> RouteConfigBuilder<'a> {
    pub fn new(app_self_id: &'a str) -> Self {
        Self {
            app_self_id,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            mtu: VPN_MTU,
        }
    }

    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn build(&self, policy: &RoutingPolicy) -> VpnResult<InterfaceConfig> {
        let address_v4 = Ipv4Net::new(vlan4(1), PRIVATE_VLAN4_PREFIX)
            .map_err(|e| VpnError::InvalidPolicy(e.to_string()))?;

        let dns_servers: Vec<String> = policy
            .dns_servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if dns_servers.is_empty() {
            return Err(VpnError::InvalidPolicy("至少需要一个 DNS 服务器".into()));
        }

        let mut routes = Vec::new();

        let (address_v6, peer_v6) = if policy.ipv6 {
            let net = Ipv6Net::new(vlan6(1), PRIVATE_VLAN6_PREFIX)
                .map_err(|e| VpnError::InvalidPolicy(e.to_string()))?;
            (Some(net), Some(vlan6(2)))
        } else {
            (None, None)
        };

        let (allowed_apps, disallowed_apps) = self.per_app_lists(policy)?;

        if policy.mode.excludes_private() {
            let numeric_dns = dns_servers
                .iter()
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| {
                        VpnError::InvalidPolicy(format!("绕过模式要求 DNS 为数字地址：{}", s))
                    })
                })
                .collect::<VpnResult<Vec<IpAddr>>>()?;

            routes.extend(private_ranges::public_v4_routes());
            // DNS 始终经过隧道
            routes.extend(numeric_dns.into_iter().map(IpNet::from));
        } else {
            routes.push(IpNet::V4(Ipv4Net::default()));
        }

        if policy.ipv6 {
            routes.push(IpNet::V6(Ipv6Net::default()));
        }

        let mut seen = std::collections::HashSet::new();
        routes.retain(|route| seen.insert(*route));

        log::debug!(
            "已生成网卡配置：模式 {:?}，{} 条路由，{} 个 DNS",
            policy.mode,
            routes.len(),
            dns_servers.len()
        );

        Ok(InterfaceConfig {
            session_name: self.session_name.clone(),
            mtu: self.mtu,
            address_v4,
            peer_v4: vlan4(2),
            address_v6,
            peer_v6,
            routes,
            dns_servers,
            allowed_apps,
            disallowed_apps,
        })
    }

    fn per_app_lists(&self, policy: &RoutingPolicy) -> VpnResult<(Vec<String>, Vec<String>)> {
        if !policy.per_app_requested() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut apps: Vec<String> = Vec::new();
        for id in policy.per_app_list.iter().map(|s| s.trim()) {
            if id.is_empty() {
                continue;
            }
            if id == self.app_self_id {
                if !policy.per_app_is_allowlist {
                    return Err(VpnError::InvalidPolicy(format!(
                        "不能将本应用 {} 排除在隧道之外",
                        id
                    )));
                }
                continue;
            }
            if !is_valid_app_id(id) {
                log::warn!("忽略无效的应用标识：{}", id);
                continue;
            }
            if !apps.iter().any(|a| a == id) {
                apps.push(id.to_string());
            }
        }

        if policy.per_app_is_allowlist {
            apps.push(self.app_self_id.to_string());
            Ok((apps, Vec::new()))
        } else {
            Ok((Vec::new(), apps))
        }
    }
}
