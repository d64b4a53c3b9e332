use env_logger::Env;
use std::io::Write;

pub const DEFAULT_LOG_FILTER: &str = "info,replog=info,replog::raft=info";

/// Installs the process-wide logger. `filter` uses env_logger syntax and
/// overrides `RUST_LOG`. Only the first call takes effect.
pub fn init_logging(filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.format(|buf, record| {
        let ts = buf.timestamp_millis();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    let _ = builder.try_init();
}

/// Test logger; output is captured by the harness.
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}
