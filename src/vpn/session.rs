// VPN 会话协调器：按顺序拉起各组件，失败或停止时逆序拆除
//
// 启动顺序：构建网卡配置 → 建立网卡 → 保护监听器 → 默认网络追踪 → 转发进程 → 交接描述符。
// 停止顺序：停止信号 → 网络追踪 → 保护监听器 → 转发进程 → 关闭网卡。

use futures_util::FutureExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, watch};

use super::command::forwarding_command;
use super::profile::Profile;
use crate::atoms::shutdown::{self, ShutdownReceiver, ShutdownSender};
use crate::atoms::{
    FatalCallback, NetworkPlatform, ProcessSupervisor, RestartCallback, VpnError, VpnResult,
};
use crate::molecules::{
    DefaultNetworkState, HandoffPolicy, InterfaceSession, NetworkTracker, ProtectListener,
    RouteConfigBuilder, SessionPhase, send_descriptor,
};

#[derive(Clone)]
pub struct VpnSession {
    inner: Arc<Inner>,
}

struct Inner {
    platform: Arc<dyn NetworkPlatform>,
    supervisor: Arc<dyn ProcessSupervisor>,
    handoff: HandoffPolicy,
    phase_tx: watch::Sender<SessionPhase>,
    last_error: Mutex<Option<String>>,
    // 启动期间由回调上报的致命错误，start 返回它而不是 Cancelled
    pending_failure: Mutex<Option<VpnError>>,
    // 独立于 running 锁，stop 可以打断仍在进行中的 start
    shutdown_tx: Mutex<Option<ShutdownSender>>,
    running: AsyncMutex<Option<Running>>,
}

// 已启动的组件，拆除时逆序处理
struct Running {
    interface: Arc<InterfaceSession>,
    listener: Option<ProtectListener>,
    tracker: Option<NetworkTracker>,
    supervisor_started: bool,
}

enum StopReason {
    Requested,
    Revoked,
    Failed,
}

impl VpnSession {
    pub fn new(platform: Arc<dyn NetworkPlatform>, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self::with_handoff_policy(platform, supervisor, HandoffPolicy::default())
    }

    pub fn with_handoff_policy(
        platform: Arc<dyn NetworkPlatform>,
        supervisor: Arc<dyn ProcessSupervisor>,
        handoff: HandoffPolicy,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                platform,
                supervisor,
                handoff,
                phase_tx,
                last_error: Mutex::new(None),
                pending_failure: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
                running: AsyncMutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // 交给进程守护的致命错误回调，需在 tokio 运行时内调用
    pub fn fatal_hook(&self) -> FatalCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |message: String| {
            if let Some(inner) = weak.upgrade() {
                VpnSession { inner }.fail(VpnError::ProcessCrashed(message));
            }
        })
    }

    pub async fn start(&self, profile: &Profile) -> VpnResult<()> {
        let mut slot = self.inner.running.lock().await;
        if slot.is_some() {
            return Err(VpnError::AlreadyRunning);
        }

        self.set_last_error(None);
        self.take_pending_failure();
        self.set_phase(SessionPhase::Configuring);
        log::info!("正在启动 VPN 会话：{}", profile.name);

        let config = RouteConfigBuilder::new(&profile.app_id)
            .session_name(profile.name.clone())
            .build(&profile.policy);
        let config = match config {
            Ok(config) => Arc::new(config),
            Err(e) => return Err(self.start_failed(e)),
        };

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        *self
            .inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        let mut running = Running {
            interface: Arc::new(InterfaceSession::new(config, self.inner.platform.clone())),
            listener: None,
            tracker: None,
            supervisor_started: false,
        };

        match self.bring_up(&mut running, profile, shutdown_rx).await {
            Ok(()) => {
                *slot = Some(running);
                self.set_phase(SessionPhase::ForwardingRunning);
                log::info!("VPN 会话已启动：{}", profile.name);
                Ok(())
            }
            Err(e) => {
                self.signal_shutdown();
                running.teardown(self.inner.supervisor.as_ref()).await;
                Err(self.start_failed(e))
            }
        }
    }

    async fn bring_up(
        &self,
        running: &mut Running,
        profile: &Profile,
        shutdown_rx: ShutdownReceiver,
    ) -> VpnResult<()> {
        let platform = &self.inner.platform;

        let fd = running.interface.create().await?;
        self.set_phase(SessionPhase::InterfaceActive);
        self.watch_revocation(shutdown_rx.clone());

        let state = DefaultNetworkState::new();
        running.listener = Some(ProtectListener::bind(
            profile.protect_path(),
            platform.clone(),
            state.clone(),
        )?);
        running.tracker = NetworkTracker::start(platform.clone(), state).await?;

        let command = forwarding_command(profile, running.interface.config(), fd);
        let on_restart = self.restart_callback(
            running.interface.clone(),
            profile.sock_path(),
            shutdown_rx.clone(),
        );
        self.inner
            .supervisor
            .start(command, on_restart)
            .await
            .map_err(VpnError::ProcessSpawn)?;
        running.supervisor_started = true;

        send_descriptor(&profile.sock_path(), fd, self.inner.handoff, shutdown_rx).await
    }

    // 网卡被系统撤销时走撤销流程；会话停止后监视任务随之退出
    fn watch_revocation(&self, mut shutdown_rx: ShutdownReceiver) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let platform = self.inner.platform.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = platform.wait_revoked() => {}
                _ = shutdown::wait_shutdown(&mut shutdown_rx) => return,
            }
            if let Some(inner) = weak.upgrade() {
                log::warn!("虚拟网卡已被系统撤销，正在停止会话");
                VpnSession { inner }.revoke().await;
            }
        });
    }

    // 转发进程每次重启后重新交接同一个描述符
    fn restart_callback(
        &self,
        interface: Arc<InterfaceSession>,
        sock_path: PathBuf,
        shutdown_rx: ShutdownReceiver,
    ) -> RestartCallback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let policy = self.inner.handoff;
        Arc::new(move || {
            let weak = weak.clone();
            let interface = interface.clone();
            let sock_path = sock_path.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                let Some(fd) = interface.raw_fd() else {
                    log::debug!("网卡已关闭，跳过描述符交接");
                    return;
                };
                match send_descriptor(&sock_path, fd, policy, shutdown_rx).await {
                    Ok(()) | Err(VpnError::Cancelled) => {}
                    Err(e) => {
                        if let Some(inner) = weak.upgrade() {
                            VpnSession { inner }.fail(e);
                        }
                    }
                }
            }
            .boxed()
        })
    }

    pub async fn stop(&self) {
        self.shut_down(StopReason::Requested).await;
    }

    // 系统撤销网卡：先关闭网卡，再完整拆除
    pub async fn revoke(&self) {
        self.shut_down(StopReason::Revoked).await;
    }

    // 回调中发生的致命错误：记录后在独立任务中停止，避免在回调内等待自身
    fn fail(&self, error: VpnError) {
        if !self.phase().is_running() {
            log::debug!("会话未运行，忽略错误：{}", error);
            return;
        }
        if error.is_user_fatal() {
            log::error!("VPN 会话需要用户处理：{}", error);
        } else {
            log::error!("VPN 会话发生致命错误：{}", error);
        }
        self.set_last_error(Some(error.to_string()));
        *self
            .inner
            .pending_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);

        let session = self.clone();
        tokio::spawn(async move { session.shut_down(StopReason::Failed).await });
    }

    async fn shut_down(&self, reason: StopReason) {
        self.signal_shutdown();

        let mut slot = self.inner.running.lock().await;
        let Some(running) = slot.take() else {
            return;
        };

        if matches!(reason, StopReason::Revoked) {
            running.interface.revoke().await;
        }
        running.teardown(self.inner.supervisor.as_ref()).await;

        match reason {
            StopReason::Failed => self.set_phase(SessionPhase::Error),
            StopReason::Requested | StopReason::Revoked => {
                self.set_phase(SessionPhase::TornDown);
                log::info!("VPN 会话已停止");
            }
        }
    }

    fn start_failed(&self, error: VpnError) -> VpnError {
        // 启动被打断：若期间回调上报了致命错误则返回该错误，否则视为正常停止
        let error = match error {
            VpnError::Cancelled => match self.take_pending_failure() {
                Some(fatal) => fatal,
                None => {
                    log::info!("VPN 会话启动被取消");
                    self.set_phase(SessionPhase::TornDown);
                    return VpnError::Cancelled;
                }
            },
            error => error,
        };
        log::error!("VPN 会话启动失败：{}", error);
        if self.last_error().is_none() {
            self.set_last_error(Some(error.to_string()));
        }
        self.set_phase(SessionPhase::Error);
        error
    }

    fn take_pending_failure(&self) -> Option<VpnError> {
        self.inner
            .pending_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn signal_shutdown(&self) {
        let sender = self
            .inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            sender.send_replace(true);
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.inner.phase_tx.send_replace(phase);
        if previous != phase {
            log::debug!("会话阶段：{:?} → {:?}", previous, phase);
        }
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}

impl Running {
    async fn teardown(mut self, supervisor: &dyn ProcessSupervisor) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.stop();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop().await;
        }
        if self.supervisor_started {
            supervisor.stop().await;
        }
        self.interface.close().await;
    }
}
