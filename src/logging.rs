use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the tracing subscriber for the probe.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("meshprobe=debug,libp2p=info")
        } else {
            EnvFilter::new("meshprobe=info,libp2p=warn")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("meshprobe logging initialized");
    Ok(())
}

/// Initialize logging with fallback behavior if setup fails
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "Warning: failed to set up logging: {}. Continuing without tracing output.",
            e
        );
    }
}
