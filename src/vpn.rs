// L2 会话层模块入口：配置档、转发进程命令行与会话协调器

pub mod command;
pub mod profile;
pub mod session;

pub use command::forwarding_command;
pub use profile::{Profile, load_profile};
pub use session::VpnSession;
