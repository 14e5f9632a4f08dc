//! Logging setup for the offload compiler
//!
//! Built on the `log` facade with `env_logger` as the backend. `tracing`
//! events (dual-path transitions) are forwarded through its `log` feature,
//! so one logger covers both.
//!
//! ```rust,ignore
//! use compiler::logging;
//!
//! logging::init();                               // Warn
//! logging::init_from_env();                      // RUST_LOG, default warn
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `error!` - lowering failures that abort compilation
//! - `warn!` - parallel-safety and fallback warnings
//! - `info!` - offload outcome per function, kernel IR dumps
//! - `debug!` - outlining and launch generation progress
//! - `trace!` - stub dumps, race rewrites, individual launch ops
//!
//! Filter by module through `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=compiler::offload=debug offload --dims 4
//! RUST_LOG=compiler::codegen::interpreter=trace offload
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize at `Warn`. Later calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize at `level`. Later calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.module_path().unwrap_or("offload"),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize from `RUST_LOG`, defaulting to `warn`. Later calls are no-ops.
pub fn init_from_env() {
    INIT.call_once(|| {
        Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize for tests: captured output, `RUST_LOG` honored.
///
/// ```rust,ignore
/// #[test]
/// fn test_offload() {
///     compiler::logging::init_test();
/// }
/// ```
pub fn init_test() {
    // try_init tolerates an earlier init from another test
    let _ = Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Whether one of the `init*` entry points (other than `init_test`) ran.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::warn!("offload logging ready");
        log::trace!("not shown unless RUST_LOG=trace");
    }
}
