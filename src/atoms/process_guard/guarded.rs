// 基于 command-group 的进程守护：子进程独占进程组，停止时整组终止

use super::{FatalCallback, ProcessSupervisor, RestartCallback};
use crate::atoms::shutdown::{self, ShutdownReceiver, ShutdownSender};
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

// 启动后在此时间内退出视为崩溃循环，不再重启
const CRASH_WINDOW_MS: u64 = 1000;
const TERMINATE_GRACE_MS: u64 = 1000;

pub struct GuardedProcessPool {
    working_dir: PathBuf,
    on_fatal: Mutex<FatalCallback>,
    crash_window: Duration,
    shutdown_tx: ShutdownSender,
    guards: Mutex<Vec<JoinHandle<()>>>,
}

impl GuardedProcessPool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let (shutdown_tx, _) = shutdown::channel();
        let on_fatal: FatalCallback =
            Arc::new(|message: String| log::error!("进程守护终止：{}", message));
        Self {
            working_dir: working_dir.into(),
            on_fatal: Mutex::new(on_fatal),
            crash_window: Duration::from_millis(CRASH_WINDOW_MS),
            shutdown_tx,
            guards: Mutex::new(Vec::new()),
        }
    }

    pub fn with_crash_window(mut self, crash_window: Duration) -> Self {
        self.crash_window = crash_window;
        self
    }

    // 崩溃循环或重启失败时的通知，只影响之后启动的进程
    pub fn set_on_fatal(&self, on_fatal: FatalCallback) {
        *self.on_fatal.lock().unwrap_or_else(PoisonError::into_inner) = on_fatal;
    }
}

#[async_trait]
impl ProcessSupervisor for GuardedProcessPool {
    async fn start(
        &self,
        command_line: Vec<String>,
        on_restart: RestartCallback,
    ) -> io::Result<()> {
        self.shutdown_tx.send_replace(false);

        // 首次启动同步进行，启动失败直接返回给调用方
        let child = spawn_group(&command_line, &self.working_dir)?;
        log::info!(
            "转发进程已启动：{}（pid {:?}）",
            program_name(&command_line),
            child.id()
        );

        let guard = Guard {
            command_line,
            working_dir: self.working_dir.clone(),
            on_restart,
            on_fatal: self
                .on_fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            crash_window: self.crash_window,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let handle = tokio::spawn(guard.run(child));

        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let guards = std::mem::take(
            &mut *self.guards.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for guard in guards {
            if let Err(e) = guard.await {
                log::warn!("进程守护任务异常结束：{}", e);
            }
        }
    }
}

struct Guard {
    command_line: Vec<String>,
    working_dir: PathBuf,
    on_restart: RestartCallback,
    on_fatal: FatalCallback,
    crash_window: Duration,
    shutdown_rx: ShutdownReceiver,
}

impl Guard {
    async fn run(mut self, mut child: AsyncGroupChild) {
        let name = program_name(&self.command_line).to_string();
        let mut started_at = Instant::now();

        loop {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = shutdown::wait_shutdown(&mut self.shutdown_rx) => None,
            };
            let Some(status) = exit else {
                terminate(&name, &mut child).await;
                return;
            };
            if *self.shutdown_rx.borrow() {
                return;
            }

            let uptime = started_at.elapsed();
            match status {
                Ok(status) => log::warn!(
                    "{} 意外退出（{}），运行 {}ms",
                    name,
                    status,
                    uptime.as_millis()
                ),
                Err(e) => log::error!("等待 {} 退出失败：{}", name, e),
            }

            if uptime < self.crash_window {
                let message = format!("{} 启动后 {}ms 即退出", name, uptime.as_millis());
                log::error!("{}，停止守护", message);
                (self.on_fatal)(message);
                return;
            }

            child = match spawn_group(&self.command_line, &self.working_dir) {
                Ok(child) => child,
                Err(e) => {
                    let message = format!("重启 {} 失败：{}", name, e);
                    log::error!("{}", message);
                    (self.on_fatal)(message);
                    return;
                }
            };
            started_at = Instant::now();
            log::info!("{} 已重启（pid {:?}）", name, child.id());

            let on_restart = (self.on_restart)();
            let interrupted = tokio::select! {
                _ = on_restart => false,
                _ = shutdown::wait_shutdown(&mut self.shutdown_rx) => true,
            };
            if interrupted {
                terminate(&name, &mut child).await;
                return;
            }
        }
    }
}

fn spawn_group(command_line: &[String], working_dir: &Path) -> io::Result<AsyncGroupChild> {
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "命令行为空"))?;

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null());
    command.group_spawn()
}

// 先 SIGTERM 整个进程组，超时后强制结束
async fn terminate(name: &str, child: &mut AsyncGroupChild) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            log::debug!("向 {} 发送 SIGTERM 失败：{}", name, e);
        }
    }

    match timeout(Duration::from_millis(TERMINATE_GRACE_MS), child.wait()).await {
        Ok(_) => log::info!("{} 已停止", name),
        Err(_) => {
            log::warn!("{} 未响应 SIGTERM，强制结束", name);
            if let Err(e) = child.start_kill() {
                log::warn!("强制结束 {} 失败：{}", name, e);
                return;
            }
            let _ = child.wait().await;
        }
    }
}

fn program_name(command_line: &[String]) -> &str {
    command_line
        .first()
        .map(|p| {
            Path::new(p)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(p.as_str())
        })
        .unwrap_or("<empty>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn counting_restart(counter: Arc<AtomicUsize>) -> RestartCallback {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        })
    }

    #[tokio::test]
    async fn restarts_after_unexpected_exit() {
        let dir = tempfile::tempdir().unwrap();
        let fatal = Arc::new(AtomicUsize::new(0));
        let fatal_hook = fatal.clone();
        let pool = GuardedProcessPool::new(dir.path()).with_crash_window(Duration::from_millis(20));
        pool.set_on_fatal(Arc::new(move |_: String| {
            fatal_hook.fetch_add(1, Ordering::SeqCst);
        }));

        let restarts = Arc::new(AtomicUsize::new(0));
        pool.start(sh("sleep 0.1"), counting_restart(restarts.clone()))
            .await
            .unwrap();

        let waited = timeout(Duration::from_secs(10), async {
            while restarts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(waited.is_ok());

        pool.stop().await;
        assert_eq!(fatal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crash_loop_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = GuardedProcessPool::new(dir.path());
        pool.set_on_fatal(Arc::new(move |message: String| {
            let _ = tx.send(message);
        }));

        let restarts = Arc::new(AtomicUsize::new(0));
        pool.start(sh("exit 3"), counting_restart(restarts.clone()))
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(message.unwrap().contains("sh"));
        pool.stop().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_terminates_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let pool = GuardedProcessPool::new(dir.path());
        pool.start(sh("sleep 30"), counting_restart(Arc::default()))
            .await
            .unwrap();

        assert!(timeout(Duration::from_secs(5), pool.stop()).await.is_ok());
        // 重复停止无副作用
        pool.stop().await;
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let pool = GuardedProcessPool::new(dir.path());
        let result = pool
            .start(
                vec!["/nonexistent/tun2socks".into()],
                counting_restart(Arc::default()),
            )
            .await;
        assert!(result.is_err());
    }
}
