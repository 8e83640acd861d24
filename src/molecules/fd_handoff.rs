// TUN 描述符交接：连接转发进程的本地 socket，把接口描述符发过去
//
// 转发进程刚启动时 socket 可能尚未就绪，因此按指数退避重试。
// 每次尝试前先等待 base << tries，累计失败超过 max_tries 次后放弃。

use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use tokio::net::UnixStream;
use tokio::time::{Duration, sleep};

use crate::atoms::shutdown::{self, ShutdownReceiver};
use crate::atoms::{DescriptorChannel, VpnError, VpnResult};

pub const SOCK_PATH: &str = "sock_path";

// 位移上限，防止异常配置下溢出
const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy)]
pub struct HandoffPolicy {
    pub max_tries: u32,
    pub base_delay: Duration,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self {
            max_tries: 6,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl HandoffPolicy {
    pub fn delay_for(&self, tries: u32) -> Duration {
        self.base_delay * (1u32 << tries.min(MAX_BACKOFF_SHIFT))
    }
}

pub async fn send_descriptor(
    path: &Path,
    fd: RawFd,
    policy: HandoffPolicy,
    shutdown_rx: ShutdownReceiver,
) -> VpnResult<()> {
    with_retries(policy, shutdown_rx, || async move {
        let stream = UnixStream::connect(path).await?;
        stream.send(fd).await
        // stream 在此关闭，本地描述符仍由接口会话持有
    })
    .await?;
    log::info!("TUN 描述符已交给转发进程：{}", path.display());
    Ok(())
}

pub async fn with_retries<F, Fut>(
    policy: HandoffPolicy,
    mut shutdown_rx: ShutdownReceiver,
    mut attempt: F,
) -> VpnResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut tries = 0;
    loop {
        if shutdown::is_shutdown(&shutdown_rx) {
            return Err(VpnError::Cancelled);
        }

        tokio::select! {
            _ = sleep(policy.delay_for(tries)) => {}
            _ = shutdown::wait_shutdown(&mut shutdown_rx) => return Err(VpnError::Cancelled),
        }

        match attempt().await {
            Ok(()) => return Ok(()),
            Err(source) => {
                tries += 1;
                if tries > policy.max_tries {
                    log::error!("描述符交接失败，已尝试 {} 次：{}", tries, source);
                    return Err(VpnError::HandoffFailed { tries, source });
                }
                log::debug!("描述符交接第 {} 次失败：{}，稍后重试", tries, source);
            }
        }
    }
}
