// 描述符通道原子模块：通过本地 Unix Socket 传递文件描述符。
// 每条消息恰好携带一个描述符与一个字节的帧数据。

mod scm_rights;

use async_trait::async_trait;
use std::io;
use std::os::fd::{OwnedFd, RawFd};

pub use scm_rights::{recv_fd, send_fd};

// 描述符交接时写入的帧字节，接收方只关心随附的描述符
pub const HANDOFF_FRAMING_BYTE: u8 = 42;

#[async_trait]
pub trait DescriptorChannel: Send + Sync {
    async fn send(&self, fd: RawFd) -> io::Result<()>;

    // 对端未附带描述符（或已关闭）时返回 None
    async fn receive(&self) -> io::Result<Option<OwnedFd>>;
}

#[async_trait]
impl DescriptorChannel for tokio::net::UnixStream {
    async fn send(&self, fd: RawFd) -> io::Result<()> {
        send_fd(self, fd, HANDOFF_FRAMING_BYTE).await
    }

    async fn receive(&self) -> io::Result<Option<OwnedFd>> {
        recv_fd(self).await.map(|(_, fd)| fd)
    }
}
