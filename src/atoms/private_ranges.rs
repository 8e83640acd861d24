// 私有网段表：绕过模式下这些网段不进入隧道
//
// 路由表由 0.0.0.0/0 减去私有网段得到，结果为最少数量的 CIDR。

use ipnet::{IpNet, Ipv4Net};
use once_cell::sync::Lazy;
use std::net::Ipv4Addr;

static PRIVATE_V4: Lazy<Vec<Ipv4Net>> = Lazy::new(|| {
    [
        (Ipv4Addr::new(0, 0, 0, 0), 8),
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(100, 64, 0, 0), 10),
        (Ipv4Addr::new(127, 0, 0, 0), 8),
        (Ipv4Addr::new(169, 254, 0, 0), 16),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 0, 0, 0), 24),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
        (Ipv4Addr::new(198, 18, 0, 0), 15),
        (Ipv4Addr::new(224, 0, 0, 0), 3),
    ]
    .into_iter()
    .filter_map(|(addr, prefix)| Ipv4Net::new(addr, prefix).ok())
    .collect()
});

static PUBLIC_V4: Lazy<Vec<Ipv4Net>> = Lazy::new(|| carve(&PRIVATE_V4));

pub fn private_v4() -> &'static [Ipv4Net] {
    &PRIVATE_V4
}

// 需要经过隧道的公网路由
pub fn public_v4_routes() -> impl Iterator<Item = IpNet> {
    PUBLIC_V4.iter().copied().map(IpNet::V4)
}

// 两个 CIDR 相交当且仅当其中一个包含另一个
pub fn overlaps_private(net: &IpNet) -> bool {
    match net {
        IpNet::V4(net) => PRIVATE_V4
            .iter()
            .any(|p| p.contains(net) || net.contains(p)),
        IpNet::V6(_) => false,
    }
}

fn carve(excluded: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    let root = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0);
    if let Ok(root) = root {
        carve_into(root, excluded, &mut out);
    }
    out
}

fn carve_into(net: Ipv4Net, excluded: &[Ipv4Net], out: &mut Vec<Ipv4Net>) {
    if excluded.iter().any(|e| e.contains(&net)) {
        return;
    }
    if !excluded.iter().any(|e| net.contains(e)) {
        out.push(net);
        return;
    }
    // 与排除网段部分重叠，继续二分
    match net.subnets(net.prefix_len() + 1) {
        Ok(halves) => {
            for half in halves {
                carve_into(half, excluded, out);
            }
        }
        Err(e) => log::warn!("网段拆分失败：{} - {}", net, e),
    }
}
