use clap::Parser;

use dswarm_core::units::parse_byte_rate;

#[derive(Debug, Clone, Parser)]
#[command(name = "dswarm-manager", version, about = "Coordinator for a distributed worker pool")]
pub struct Cli {
    /// Fixed listening port. If unset, binds the first free port in
    /// `--low-port..=--high-port` (spec §6).
    #[arg(long, env = "DS_PORT")]
    pub port: Option<u16>,

    /// Low end of the port range tried when `--port` is unset.
    #[arg(long = "low-port", env = "DS_LOW_PORT", default_value_t = 9000)]
    pub low_port: u16,

    /// High end of the port range tried when `--port` is unset.
    #[arg(long = "high-port", env = "DS_HIGH_PORT", default_value_t = 9999)]
    pub high_port: u16,

    /// Aggregate outbound bandwidth budget, e.g. `10MB`. Clamped to >= 0 by
    /// the parser (only unsigned integers parse).
    #[arg(long, env = "DS_BANDWIDTH", default_value = "0", value_parser = parse_byte_rate)]
    pub bandwidth: u64,

    /// Project name reported in catalog updates and status responses.
    #[arg(long, env = "DS_NAME")]
    pub name: Option<String>,

    /// Catalog server hostname to POST periodic self-description updates to.
    #[arg(long = "catalog-host", env = "CATALOG_HOST")]
    pub catalog_host: Option<String>,

    /// Catalog server port (spec §6).
    #[arg(long = "catalog-port", env = "CATALOG_PORT", default_value_t = 9097)]
    pub catalog_port: u16,

    /// Minimum number of connected workers before a ready task is dispatched.
    #[arg(long = "wait-for-workers", env = "DS_WAIT_FOR_WORKERS", default_value_t = 0)]
    pub wait_for_workers: u32,
}
