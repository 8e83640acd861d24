// 会话停止信号：watch<bool>，true 表示停止

use tokio::sync::watch;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

// 发送端被丢弃同样视为停止
pub async fn wait_shutdown(rx: &mut ShutdownReceiver) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

pub fn is_shutdown(rx: &ShutdownReceiver) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}
