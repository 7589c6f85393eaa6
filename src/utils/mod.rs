//! The `utils` module holds definitions shared across `relayq`: the error
//! type and logging setup.

pub mod error;
pub mod logging;

pub use error::{QueueError, Result};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }

    #[test]
    fn logging_init_accepts_per_target_directives() {
        logging::init("relayq=debug,sled=warn");
        logging::init("relayq[bad");
    }
}
