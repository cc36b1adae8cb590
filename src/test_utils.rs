//! Helpers shared by the integration tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the logger once per test binary. Controlled by `RUST_LOG` as
/// usual.
pub fn init_log() {
    INIT.call_once(|| {
        use std::io::Write;

        let mut builder = env_logger::Builder::from_default_env();
        builder
            .is_test(true)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}
