// 会话配置档：从 YAML 或 JSON 文件加载，按扩展名选择解析器

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atoms::RoutingPolicy;
use crate::molecules::route_config::{self, DEFAULT_SESSION_NAME};
use crate::molecules::{PROTECT_PATH, SOCK_PATH};

pub const DEFAULT_SOCKS_PORT: u16 = 1080;
pub const DEFAULT_LOCAL_DNS_PORT: u16 = 5450;
pub const DEFAULT_LOG_LEVEL: u8 = 3;
pub const DEFAULT_APP_ID: &str = "io.github.tunnel_hub";

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default = "default_name")]
    pub name: String,
    pub policy: RoutingPolicy,
    #[serde(default = "default_socks_host")]
    pub socks_host: String,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_local_dns_port")]
    pub local_dns_port: u16,
    // 为 true 时 DNS 走 UDP 转发，不再指定本地 DNS 网关
    #[serde(default)]
    pub udp_dns: bool,
    pub forwarding_binary: PathBuf,
    pub runtime_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default = "default_app_id")]
    pub app_id: String,
}

fn default_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_local_dns_port() -> u16 {
    DEFAULT_LOCAL_DNS_PORT
}

fn default_log_level() -> u8 {
    DEFAULT_LOG_LEVEL
}

fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}

impl Profile {
    pub fn protect_path(&self) -> PathBuf {
        self.runtime_dir.join(PROTECT_PATH)
    }

    pub fn sock_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCK_PATH)
    }

    pub fn socks_server_addr(&self) -> String {
        // IPv6 字面量需要方括号
        if self.socks_host.contains(':') && !self.socks_host.starts_with('[') {
            format!("[{}]:{}", self.socks_host, self.socks_port)
        } else {
            format!("{}:{}", self.socks_host, self.socks_port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("配置名称不能为空");
        }
        if self.socks_host.trim().is_empty() {
            bail!("SOCKS 服务器地址不能为空");
        }
        if self.socks_port == 0 {
            bail!("SOCKS 端口无效：0");
        }
        if !self.udp_dns && self.local_dns_port == 0 {
            bail!("本地 DNS 端口无效：0");
        }
        if self.forwarding_binary.as_os_str().is_empty() {
            bail!("未指定转发程序路径");
        }
        if self.runtime_dir.as_os_str().is_empty() {
            bail!("未指定运行目录");
        }
        if !route_config::is_valid_app_id(&self.app_id) {
            bail!("应用标识格式无效：{}", self.app_id);
        }
        // 路由策略的完整校验在构建网卡配置时进行，这里只拦截明显错误
        if self.policy.dns_servers.iter().all(|s| s.trim().is_empty()) {
            bail!("至少需要一个 DNS 服务器");
        }
        Ok(())
    }
}

pub fn load_profile(path: impl AsRef<Path>) -> Result<Profile> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败：{}", path.display()))?;

    let profile = parse_profile(&content, path)?;
    profile
        .validate()
        .with_context(|| format!("配置文件校验失败：{}", path.display()))?;

    std::fs::create_dir_all(&profile.runtime_dir)
        .with_context(|| format!("创建运行目录失败：{}", profile.runtime_dir.display()))?;

    log::info!("已加载配置：{}（{}）", profile.name, path.display());
    Ok(profile)
}

fn parse_profile(content: &str, path: &Path) -> Result<Profile> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(content)
            .with_context(|| format!("解析 JSON 配置失败：{}", path.display()))
    } else {
        serde_yaml_ng::from_str(content)
            .with_context(|| format!("解析 YAML 配置失败：{}", path.display()))
    }
}
