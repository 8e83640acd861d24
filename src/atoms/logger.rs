// 日志初始化：桌面端使用 env_logger，Android 端输出到 logcat

use std::sync::Once;

static INIT: Once = Once::new();

#[cfg(not(target_os = "android"))]
pub fn init() {
    INIT.call_once(|| {
        use std::io::Write;

        let result = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

        if let Err(e) = result {
            eprintln!("日志初始化失败：{}", e);
        }
    });
}

#[cfg(target_os = "android")]
pub fn init() {
    INIT.call_once(|| {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Info)
                .with_tag("tunnel_hub"),
        );
    });
}
