// Init-failure error class (§7 class 1): the set of conditions that
// abort the process before or during boot rather than surface as a
// `StopReason` from the running CPU.
//
// Grounded on proj_config.rs's `ConfigError` enum shape (an enum of
// named failure variants with a `Display` impl each), ported onto
// `thiserror`'s derive instead of a hand-rolled `std::error::Error`.

use crate::memory::mmu::MmuError;

#[derive(Debug, thiserror::Error)]
pub enum Z80CoreError {
    #[error("drive A image is required but was not found at {0}")]
    MissingDriveA(std::path::PathBuf),

    #[error("MMU misconfigured: {0}")]
    MmuMisconfigured(#[from] MmuError),

    #[error("snapshot file {0} is truncated or malformed")]
    BadSnapshot(std::path::PathBuf),

    #[error("failed to bind listener socket {index} on port {port}: {source}")]
    SocketBindFailure {
        index: u8,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open disk image {path}: {source}")]
    DiskOpenFailure {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error during startup: {0}")]
    Io(#[from] std::io::Error),
}
