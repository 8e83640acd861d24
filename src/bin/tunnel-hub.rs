// tunnel-hub 命令行：按配置档启动 VPN 会话，或打印推导出的网卡配置

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tunnel_hub::atoms;
use tunnel_hub::molecules::RouteConfigBuilder;
use tunnel_hub::vpn::load_profile;

/// 用户态 VPN 控制面
#[derive(Parser)]
#[command(name = "tunnel-hub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 建立虚拟网卡并运行转发进程，直到收到退出信号
    Up {
        /// 配置档路径（YAML 或 JSON）
        #[arg(short, long)]
        profile: PathBuf,

        /// 虚拟网卡名称
        #[arg(long, default_value = "tun-hub0")]
        tun_name: String,
    },

    /// 以 JSON 打印由配置档推导出的网卡配置
    Routes {
        #[arg(short, long)]
        profile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    atoms::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Up { profile, tun_name } => up(profile, tun_name).await,
        Commands::Routes { profile } => routes(profile),
    }
}

fn routes(path: PathBuf) -> Result<()> {
    let profile = load_profile(&path)?;
    let config = RouteConfigBuilder::new(&profile.app_id)
        .session_name(profile.name.clone())
        .build(&profile.policy)
        .context("推导网卡配置失败")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn up(path: PathBuf, tun_name: String) -> Result<()> {
    use std::sync::Arc;
    use tunnel_hub::atoms::platform::LinuxPlatform;
    use tunnel_hub::atoms::GuardedProcessPool;
    use tunnel_hub::{SessionPhase, VpnSession};

    let profile = load_profile(&path)?;
    let supervisor = Arc::new(GuardedProcessPool::new(&profile.runtime_dir));
    let session = VpnSession::new(Arc::new(LinuxPlatform::new(tun_name)), supervisor.clone());
    supervisor.set_on_fatal(session.fatal_hook());

    session
        .start(&profile)
        .await
        .with_context(|| format!("启动会话失败：{}", profile.name))?;

    let mut phases = session.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("收到退出信号，正在停止会话");
            session.stop().await;
        }
        _ = phases.wait_for(|phase| phase.is_terminal()) => {}
    }

    match session.phase() {
        SessionPhase::Error => {
            let message = session.last_error().unwrap_or_else(|| "未知错误".into());
            anyhow::bail!("会话异常结束：{}", message)
        }
        _ => Ok(()),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn up(_path: PathBuf, _tun_name: String) -> Result<()> {
    anyhow::bail!("当前平台没有可用的虚拟网卡实现")
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::warn!("无法监听 SIGTERM：{}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
