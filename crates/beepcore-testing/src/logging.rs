use std::sync::Once;

use tracing::level_filters::LevelFilter;

/// Route `tracing` output of the crate under test through the libtest
/// capture. `BEEPCORE_TEST_LOG=debug` raises the level from `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let level = match std::env::var("BEEPCORE_TEST_LOG").as_deref() {
            Ok("trace") => LevelFilter::TRACE,
            Ok("debug") => LevelFilter::DEBUG,
            Ok("info") => LevelFilter::INFO,
            _ => LevelFilter::WARN,
        };
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(level)
            .with_target(false)
            .try_init();
    });
}
