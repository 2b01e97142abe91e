pub mod hdfs;
pub mod spark;

pub use hdfs::HdfsService;
pub use spark::SparkService;

use crate::cluster::{Cluster, Node, ServiceDescriptor};
use crate::error::{FlintrockError, Result};
use crate::ssh::SshSession;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Ephemeral block devices smaller than this are ignored. Filters out the
/// stub EBS device some instance families expose alongside real instance
/// storage.
pub const MIN_EPHEMERAL_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Cluster-wide parameters every per-node task reads. Built once by the
/// orchestrator before any task starts; immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct ClusterParams {
    pub cluster_name: String,
    /// Authoritative address written into every rendered config.
    pub master_private: String,
    pub master_public: Option<String>,
    /// Slave private addresses in allocation order.
    pub slave_privates: Vec<String>,
    /// Ephemeral mount points keyed by instance id.
    pub ephemeral_mounts: HashMap<String, Vec<String>>,
    pub ssh_user: String,
}

impl ClusterParams {
    pub fn mounts_for(&self, node: &Node) -> &[String] {
        self.ephemeral_mounts
            .get(&node.instance_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    NotReady,
    Failed,
}

/// The capability set every installable service implements. Services are
/// values: a cluster's installed services are an ordered list, HDFS before
/// Spark.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &str;

    /// TCP ports that must be open between cluster members and from the
    /// client to the master.
    fn required_ports(&self) -> Vec<u16>;

    /// Download and unpack the service on one node. Idempotent; retried
    /// downloads are internal, a corrupt archive is fatal.
    async fn install(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()>;

    /// Push artifacts built on the master out to the slaves. Runs on the
    /// master's session after the install barrier; only meaningful for
    /// services whose install is master-local (git builds).
    async fn distribute(
        &self,
        master: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        let _ = (master, session, params);
        Ok(())
    }

    /// Render and write config files with the cluster-wide parameters.
    async fn configure(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()>;

    async fn start_master(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()>;

    async fn start_slave(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()>;

    async fn stop(&self, node: &Node, session: &mut dyn SshSession) -> Result<()>;

    /// Single cheap probe against the master. The orchestrator retries it
    /// within [`Service::health_check_timeout`].
    async fn health_check(&self, cluster: &Cluster, http: &reqwest::Client)
        -> Result<HealthStatus>;

    /// Retry budget for the health check.
    fn health_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(90)
    }
}

/// Descriptor list for tagging, preserving service order.
pub fn descriptors(services: &[Arc<dyn Service>]) -> Vec<ServiceDescriptor> {
    services
        .iter()
        .map(|s| ServiceDescriptor::new(s.name(), s.version()))
        .collect()
}

/// Rebuild service values from provider tags, in the fixed HDFS-before-Spark
/// order. Used by every operation that reconstructs a cluster.
pub fn from_descriptors(descriptors: &[ServiceDescriptor]) -> Result<Vec<Arc<dyn Service>>> {
    let mut hdfs: Option<Arc<dyn Service>> = None;
    let mut spark: Option<Arc<dyn Service>> = None;
    for d in descriptors {
        match d.name.as_str() {
            "hdfs" => hdfs = Some(Arc::new(HdfsService::new(hdfs::HdfsOptions {
                version: d.version.clone(),
                ..Default::default()
            }))),
            "spark" => spark = Some(Arc::new(SparkService::new(spark::SparkOptions {
                version: Some(d.version.clone()),
                ..Default::default()
            }))),
            other => {
                return Err(FlintrockError::InconsistentCluster(format!(
                    "unknown service {} in cluster tags",
                    other
                )))
            }
        }
    }
    Ok(hdfs.into_iter().chain(spark).collect())
}

/// Run a remote command and fail with `remote-command-error` on non-zero
/// exit. The helper every service uses for its install/configure/start
/// steps.
pub(crate) async fn run_checked(
    session: &mut dyn SshSession,
    label: &str,
    command: &str,
) -> Result<String> {
    let output = session.run(command, &[]).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(FlintrockError::RemoteCommand {
            host: session.host().to_string(),
            command: label.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// Pick ephemeral devices from `device size-in-bytes` lines, dropping
/// anything below [`MIN_EPHEMERAL_BYTES`].
pub fn select_ephemeral_devices(listing: &str) -> Vec<String> {
    let mut devices: Vec<String> = listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let size: u64 = parts.next()?.parse().ok()?;
            (size >= MIN_EPHEMERAL_BYTES).then(|| device.to_string())
        })
        .collect();
    devices.sort();
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_ephemeral_devices_filters_stubs() {
        // The 4 GiB device is the stub some instance families expose.
        let listing = "\
/dev/nvme1n1 300000000000
/dev/nvme2n1 4294967296
/dev/nvme3n1 8589934592
";
        assert_eq!(
            select_ephemeral_devices(listing),
            vec!["/dev/nvme1n1", "/dev/nvme3n1"]
        );
    }

    #[test]
    fn test_select_ephemeral_devices_ignores_garbage() {
        let listing = "not-a-device\n/dev/xvdb notanumber\n\n/dev/xvdc 9000000000\n";
        assert_eq!(select_ephemeral_devices(listing), vec!["/dev/xvdc"]);
    }

    #[test]
    fn test_from_descriptors_orders_hdfs_first() {
        let descriptors = vec![
            ServiceDescriptor::new("spark", "3.2.1"),
            ServiceDescriptor::new("hdfs", "3.3.6"),
        ];
        let services = from_descriptors(&descriptors).unwrap();
        let names: Vec<&str> = services.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["hdfs", "spark"]);
    }

    #[test]
    fn test_from_descriptors_rejects_unknown() {
        let descriptors = vec![ServiceDescriptor::new("kafka", "1.0")];
        let err = from_descriptors(&descriptors).unwrap_err();
        assert!(err.to_string().starts_with("inconsistent-cluster:"));
    }
}
