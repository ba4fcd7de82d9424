//! Host services the engine needs from the embedding platform.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait PlatformSupport: Send + Sync + 'static {
    /// Write one formatted log line to the platform's log sink
    fn log(&self, message: &str);

    /// Name of the interface holding the default route, used to keep
    /// outbound sockets off the TUN device.
    fn default_interface_name(&self) -> Result<String>;
}

const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Linux hosts: stderr logging and `/proc/net/route` lookups.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    route_table: PathBuf,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::with_route_table(PROC_NET_ROUTE)
    }

    pub fn with_route_table<P: AsRef<Path>>(path: P) -> Self {
        Self {
            route_table: path.as_ref().to_path_buf(),
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformSupport for LinuxPlatform {
    fn log(&self, message: &str) {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(out, "{}", message);
    }

    fn default_interface_name(&self) -> Result<String> {
        let table = std::fs::read_to_string(&self.route_table).map_err(|e| {
            Error::network_with_source(
                format!("Failed to read {}", self.route_table.display()),
                e,
            )
        })?;
        parse_default_interface(&table)
            .ok_or_else(|| Error::network("No default route in the routing table"))
    }
}

/// Pick the interface of the `0.0.0.0/0` entry with the lowest metric.
fn parse_default_interface(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let (iface, destination, metric, mask) = (fields[0], fields[1], fields[6], fields[7]);
            if destination != "00000000" || mask != "00000000" {
                return None;
            }
            let metric = metric.parse::<u32>().unwrap_or(u32::MAX);
            Some((metric, iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}
