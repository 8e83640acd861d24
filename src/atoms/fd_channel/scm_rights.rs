// SCM_RIGHTS 收发实现

use nix::cmsg_space;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

pub async fn send_fd(stream: &UnixStream, fd: RawFd, framing: u8) -> io::Result<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            send_fd_raw(stream.as_raw_fd(), fd, framing)
        }) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

// 返回帧字节与随附的描述符；对端关闭时返回 (None, None)
pub async fn recv_fd(stream: &UnixStream) -> io::Result<(Option<u8>, Option<OwnedFd>)> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || recv_fd_raw(stream.as_raw_fd())) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

fn send_fd_raw(socket: RawFd, fd: RawFd, framing: u8) -> io::Result<()> {
    let payload = [framing];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(socket, &iov, &cmsgs, SEND_FLAGS, None).map_err(io::Error::from)?;
    if sent == 0 {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }
    Ok(())
}

fn recv_fd_raw(socket: RawFd) -> io::Result<(Option<u8>, Option<OwnedFd>)> {
    let mut payload = [0u8; 1];
    // 预留多个描述符的空间，避免对端多发时被截断
    let mut cmsg_buffer = cmsg_space!([RawFd; 4]);
    let mut fds = Vec::new();

    let received = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_buffer), RECV_FLAGS)
            .map_err(io::Error::from)?;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                // 内核刚为本进程安装的描述符，在此接管所有权
                fds.extend(raw_fds.into_iter().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
        msg.bytes
    };

    // 多余的描述符随 drop 关闭
    if fds.len() > 1 {
        log::warn!("收到 {} 个描述符，仅保留第一个", fds.len());
    }
    let fd = fds.into_iter().next();
    let framing = (received > 0).then_some(payload[0]);
    Ok((framing, fd))
}
