// 用户态 VPN 控制面：虚拟网卡、socket 保护、默认网络追踪与转发进程守护
//
// 分层：atoms（平台与基础设施）→ molecules（控制面组件）→ vpn（会话协调）

pub mod atoms;
pub mod molecules;
pub mod vpn;

#[cfg(test)]
mod testing;

pub use atoms::{VpnError, VpnResult};
pub use molecules::SessionPhase;
pub use vpn::{Profile, VpnSession, load_profile};
