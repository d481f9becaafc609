//! Cluster configuration.

use crate::error::{ClusterError, ClusterResult};
use gantry_core::Mode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one gateway cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Replication group this node belongs to.
    pub group: String,

    /// Writer or reader within the group.
    pub member_mode: Mode,

    /// Cluster-unique node name.
    pub member_name: String,

    /// Addresses of known members to join through.
    pub peers: Vec<String>,

    /// Upper bound on how far behind a single pull is allowed to chase.
    pub oplog_max_seq_gap_to_pull: u16,

    /// Maximum operations requested in one pull.
    pub oplog_pull_max_count_once: u16,

    /// Sleep between reader pulls.
    pub oplog_pull_interval: Duration,

    /// Deadline for one pull round-trip; at least ten seconds.
    pub oplog_pull_timeout: Duration,

    /// Deadline for intra-group queries and operation relays.
    pub request_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            member_mode: Mode::Write,
            member_name: String::new(),
            peers: Vec::new(),
            oplog_max_seq_gap_to_pull: 16,
            oplog_pull_max_count_once: 8,
            oplog_pull_interval: Duration::from_secs(10),
            oplog_pull_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClusterConfig {
    /// Create a configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Validate the configuration, naming the first offending field.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.group.is_empty() {
            return Err(ClusterError::Config("empty group".to_string()));
        }
        if self.member_mode == Mode::Nil {
            return Err(ClusterError::Config(
                "member_mode must be Write or Read".to_string(),
            ));
        }
        if self.member_name.is_empty() {
            return Err(ClusterError::Config("empty member_name".to_string()));
        }
        if self.oplog_max_seq_gap_to_pull == 0 {
            return Err(ClusterError::Config(
                "oplog_max_seq_gap_to_pull must be greater than 0".to_string(),
            ));
        }
        if self.oplog_pull_max_count_once == 0 {
            return Err(ClusterError::Config(
                "oplog_pull_max_count_once must be greater than 0".to_string(),
            ));
        }
        if self.oplog_pull_interval.is_zero() {
            return Err(ClusterError::Config(
                "oplog_pull_interval must be greater than 0".to_string(),
            ));
        }
        if self.oplog_pull_timeout < Duration::from_secs(10) {
            return Err(ClusterError::Config(
                "oplog_pull_timeout must be greater than or equal to 10s".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ClusterError::Config(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the replication group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the member mode.
    pub fn member_mode(mut self, mode: Mode) -> Self {
        self.config.member_mode = mode;
        self
    }

    /// Set the node name.
    pub fn member_name(mut self, name: impl Into<String>) -> Self {
        self.config.member_name = name.into();
        self
    }

    /// Set the join peers.
    pub fn peers(mut self, peers: impl IntoIterator<Item = String>) -> Self {
        self.config.peers = peers.into_iter().collect();
        self
    }

    /// Set the max sequence gap chased per pull.
    pub fn oplog_max_seq_gap_to_pull(mut self, gap: u16) -> Self {
        self.config.oplog_max_seq_gap_to_pull = gap;
        self
    }

    /// Set the per-pull operation cap.
    pub fn oplog_pull_max_count_once(mut self, count: u16) -> Self {
        self.config.oplog_pull_max_count_once = count;
        self
    }

    /// Set the pull interval.
    pub fn oplog_pull_interval(mut self, interval: Duration) -> Self {
        self.config.oplog_pull_interval = interval;
        self
    }

    /// Set the pull timeout.
    pub fn oplog_pull_timeout(mut self, timeout: Duration) -> Self {
        self.config.oplog_pull_timeout = timeout;
        self
    }

    /// Set the intra-group request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> ClusterResult<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClusterConfigBuilder {
        ClusterConfig::builder()
            .group("g1")
            .member_mode(Mode::Read)
            .member_name("reader-001")
    }

    #[test]
    fn builder_accepts_valid_config() {
        let conf = valid().build().unwrap();
        assert_eq!(conf.group, "g1");
        assert_eq!(conf.member_mode, Mode::Read);
    }

    #[test]
    fn rejects_empty_group() {
        let err = valid().group("").build().unwrap_err();
        assert!(err.to_string().contains("empty group"));
    }

    #[test]
    fn rejects_nil_mode() {
        let err = valid().member_mode(Mode::Nil).build().unwrap_err();
        assert!(err.to_string().contains("member_mode"));
    }

    #[test]
    fn rejects_zero_pull_knobs() {
        assert!(valid().oplog_max_seq_gap_to_pull(0).build().is_err());
        assert!(valid().oplog_pull_max_count_once(0).build().is_err());
        assert!(valid().oplog_pull_interval(Duration::ZERO).build().is_err());
    }

    #[test]
    fn rejects_short_pull_timeout() {
        let err = valid()
            .oplog_pull_timeout(Duration::from_secs(9))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("10s"));
    }
}
