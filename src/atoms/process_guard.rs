// 进程守护原子模块：启动转发进程，意外退出后自动拉起。
// 每次拉起后调用 on_restart，由调用方重新交接描述符。

mod guarded;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::io;
use std::sync::Arc;

pub use guarded::GuardedProcessPool;

pub type RestartCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type FatalCallback = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, command_line: Vec<String>, on_restart: RestartCallback)
    -> io::Result<()>;

    // 终止所有受守护的进程，重复调用无副作用
    async fn stop(&self);
}
