//! Library-level error type for the engine (spec §7: fatal conditions
//! terminate the process; everything else is recovered locally and never
//! surfaces here).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind listening socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
