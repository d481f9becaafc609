//! Host-supplied environment options.
//!
//! The embedding process configures the core through environment variables;
//! everything has a default suitable for a single-node development setup
//! except `CLUSTER_HOST`, which must be set to a peer-reachable address
//! before the node can join a cluster.

use crate::error::{CoreError, CoreResult};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const CLUSTER_HOST: &str = "CLUSTER_HOST";
const PACKET_BUFFER_BYTES: &str = "PACKET_BUFFER_BYTES";
const GOSSIP_INTERVAL_MS: &str = "GOSSIP_INTERVAL_MS";
const STAGE: &str = "STAGE";
const INVENTORY_HOME: &str = "INVENTORY_HOME";

const DEFAULT_PACKET_BUFFER_BYTES: usize = 4096;
const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(200);

/// Options read from the host environment.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Address the gossip substrate binds to and advertises.
    pub cluster_host: String,
    /// UDP buffer size handed to the gossip substrate.
    pub packet_buffer_bytes: usize,
    /// Gossip fan-out interval.
    pub gossip_interval: Duration,
    /// Deployment stage; `"debug"` enables verbose substrate logging.
    pub stage: String,
    /// Root directory for node-local state; the oplog lives under
    /// `${INVENTORY_HOME}/oplog/`.
    pub inventory_home: PathBuf,
}

impl HostOptions {
    /// Read options from the process environment.
    pub fn from_env() -> CoreResult<Self> {
        let cluster_host = env::var(CLUSTER_HOST).unwrap_or_else(|_| "127.0.0.1".to_string());

        let packet_buffer_bytes = match env::var(PACKET_BUFFER_BYTES) {
            Ok(v) => v.parse::<usize>().map_err(|e| CoreError::InvalidOption {
                name: PACKET_BUFFER_BYTES,
                cause: e.to_string(),
            })?,
            Err(_) => DEFAULT_PACKET_BUFFER_BYTES,
        };

        let gossip_interval = match env::var(GOSSIP_INTERVAL_MS) {
            Ok(v) => {
                let ms = v.parse::<u64>().map_err(|e| CoreError::InvalidOption {
                    name: GOSSIP_INTERVAL_MS,
                    cause: e.to_string(),
                })?;
                if ms == 0 {
                    return Err(CoreError::InvalidOption {
                        name: GOSSIP_INTERVAL_MS,
                        cause: "must be greater than 0".to_string(),
                    });
                }
                Duration::from_millis(ms)
            }
            Err(_) => DEFAULT_GOSSIP_INTERVAL,
        };

        let stage = env::var(STAGE).unwrap_or_else(|_| "prod".to_string());

        let inventory_home = env::var(INVENTORY_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./gantry-data"));

        let options = Self {
            cluster_host,
            packet_buffer_bytes,
            gossip_interval,
            stage,
            inventory_home,
        };
        tracing::debug!(?options, "host options loaded");
        Ok(options)
    }

    /// Whether the host runs in the debug stage.
    pub fn is_debug_stage(&self) -> bool {
        self.stage == "debug"
    }

    /// Directory holding the operation log.
    pub fn oplog_dir(&self) -> PathBuf {
        self.inventory_home.join("oplog")
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            cluster_host: "127.0.0.1".to_string(),
            packet_buffer_bytes: DEFAULT_PACKET_BUFFER_BYTES,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            stage: "prod".to_string(),
            inventory_home: PathBuf::from("./gantry-data"),
        }
    }
}
