use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// `directives` is a level (`"debug"`) or a full filter such as
/// `"relayq=debug,sled=warn"`. `RUST_LOG`, when set, wins over it; anything
/// unparsable falls back to `info`.
pub fn init(directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init so tests and embedding applications can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

