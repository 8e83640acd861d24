// L3 分子层模块入口：由原子组合而成的 VPN 控制面组件

pub mod fd_handoff;
pub mod interface_session;
pub mod network_tracker;
pub mod protect_listener;
pub mod route_config;
pub mod shared_types;

pub use fd_handoff::{HandoffPolicy, SOCK_PATH, send_descriptor};
pub use interface_session::{InterfaceSession, InterfaceState};
pub use network_tracker::{DefaultNetworkState, NetworkTracker};
pub use protect_listener::{PROTECT_PATH, ProtectListener, ProtectOutcome};
pub use route_config::RouteConfigBuilder;
pub use shared_types::SessionPhase;
