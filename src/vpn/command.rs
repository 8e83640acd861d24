// 转发进程命令行。参数名与顺序是与转发程序之间的固定约定

use std::os::fd::RawFd;

use super::profile::Profile;
use crate::atoms::InterfaceConfig;
use crate::molecules::SOCK_PATH;

pub fn forwarding_command(
    profile: &Profile,
    config: &InterfaceConfig,
    tun_fd: RawFd,
) -> Vec<String> {
    let netmask = config.address_v4.netmask();

    let mut command = vec![
        profile.forwarding_binary.to_string_lossy().into_owned(),
        "--netif-ipaddr".into(),
        config.peer_v4.to_string(),
        "--netif-netmask".into(),
        netmask.to_string(),
        "--socks-server-addr".into(),
        profile.socks_server_addr(),
        "--tunfd".into(),
        tun_fd.to_string(),
        "--tunmtu".into(),
        config.mtu.to_string(),
        // 相对路径，进程工作目录即运行目录
        "--sock-path".into(),
        SOCK_PATH.into(),
        "--loglevel".into(),
        profile.log_level.to_string(),
    ];

    if let Some(peer_v6) = config.peer_v6 {
        command.push("--netif-ip6addr".into());
        command.push(peer_v6.to_string());
    }

    command.push("--enable-udprelay".into());

    if !profile.udp_dns {
        command.push("--dnsgw".into());
        command.push(format!("127.0.0.1:{}", profile.local_dns_port));
    }

    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecules::route_config;
    use crate::testing::{SELF_ID, test_profile};
    use std::path::Path;

    fn profile(ipv6: bool, udp_dns: bool) -> Profile {
        let mut profile = test_profile(Path::new("/run/tunnel_hub"));
        profile.policy.ipv6 = ipv6;
        profile.udp_dns = udp_dns;
        profile
    }

    fn command_for(profile: &Profile) -> Vec<String> {
        let config = route_config::build(&profile.policy, SELF_ID).unwrap();
        forwarding_command(profile, &config, 9)
    }

    #[test]
    fn ipv4_command_with_dns_gateway() {
        let command = command_for(&profile(false, false)).join(" ");
        assert_eq!(
            command,
            "/opt/tun2socks --netif-ipaddr 172.19.0.2 --netif-netmask 255.255.255.0 \
             --socks-server-addr 127.0.0.1:1080 --tunfd 9 --tunmtu 1500 \
             --sock-path sock_path --loglevel 3 --enable-udprelay --dnsgw 127.0.0.1:5450"
        );
    }

    #[test]
    fn ipv6_peer_and_udp_dns() {
        let command = command_for(&profile(true, true));
        let ip6 = command.iter().position(|a| a == "--netif-ip6addr").unwrap();
        assert_eq!(command[ip6 + 1], "fdfe:dcba:9876::2");
        assert_eq!(command.last().map(String::as_str), Some("--enable-udprelay"));
        assert!(!command.iter().any(|a| a == "--dnsgw"));
    }
}
