//! Logging & Diagnostics (§4.14): a single `env_logger` initialization point
//! backing every `log::{debug,info,warn,error}!` call site in this crate.

use std::io::Write;

use crate::config::{LogFormat, SupervisorConfig};

/// Initializes the process-wide logger from `config`. Must be called exactly
/// once, before any other subsystem logs. Callers that construct log
/// messages from values that might carry secrets (subprocess argv, the
/// bridge's session secret, `LaunchConfiguration`) are expected to run them
/// through [`crate::redact`] before formatting; this initializer does not
/// scan message text itself, since by then the secret value is out of scope.
pub fn init(config: &SupervisorConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level.into());

    match config.log_format {
        LogFormat::Text => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {} {}] {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
        LogFormat::Json => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":{}}}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.target(),
                    serde_json::to_string(&record.args().to_string())
                        .unwrap_or_else(|_| "\"<unprintable>\"".into())
                )
            });
        }
    }

    let _ = builder.try_init();
}
