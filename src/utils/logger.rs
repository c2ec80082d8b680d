use std::io::Write;

use chrono::Utc;
use log::info;

/// Process-wide logger setup shared by the binaries.
pub struct SyncLogger;

impl SyncLogger {
    /// Initializes env_logger with the project line format.
    ///
    /// `RUST_LOG` wins when set; otherwise `level` (usually `LOG_LEVEL`) is
    /// used as the default filter.
    pub fn init(level: &str) -> Result<(), log::SetLoggerError> {
        let env = env_logger::Env::default().default_filter_or(level);
        env_logger::Builder::from_env(env)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{}] [{}] [{}:{}] {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC"),
                    record.level(),
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .try_init()?;

        info!("Booking chat logger initialized");
        Ok(())
    }
}
