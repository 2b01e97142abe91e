pub mod ec2;

pub use ec2::Ec2Provider;

use crate::cluster::{Cluster, Node, NodeRole};
use crate::error::{FlintrockError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Shape of the instances to allocate. One spec covers the whole batch;
/// clusters are homogeneous by construction.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub instance_type: String,
    pub ami: String,
    pub key_name: Option<String>,
    pub zone: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    /// Maximum hourly bid. When set, allocation goes through the spot market.
    pub spot_price: Option<f64>,
    /// Spot fulfillment budget.
    pub spot_timeout: Duration,
    pub ebs_root_gb: Option<i32>,
    pub instance_profile: Option<String>,
    pub user_data: Option<Vec<u8>>,
    /// User-supplied groups, attached as-is and never modified.
    pub extra_security_groups: Vec<String>,
    /// User-supplied tags, applied in addition to the flintrock ones.
    pub tags: Vec<(String, String)>,
    /// Value for the `flintrock-services` tag.
    pub services_tag: String,
    /// Service UI ports opened from the caller's public IP in the shared
    /// flintrock group (SSH is always opened).
    pub client_ports: Vec<u16>,
}

/// Provider-agnostic contract the orchestrator drives. EC2 is the reference
/// implementation; the test suite substitutes an in-memory one.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate `count` instances in one batched request, tag them with the
    /// cluster name and services, and wait until the provider reports them
    /// running. Fail-fast: when the batch cannot be filled the error names
    /// how many instances were actually created so the caller can release
    /// them.
    async fn allocate(&self, cluster_name: &str, count: u32, spec: &NodeSpec)
        -> Result<Vec<Node>>;

    /// Apply the role tag to one instance.
    async fn tag_role(&self, instance_id: &str, role: NodeRole) -> Result<()>;

    /// Rebuild the cluster model from provider metadata. `None` when no
    /// non-terminated instance carries the cluster name tag.
    async fn describe(&self, cluster_name: &str) -> Result<Option<Cluster>>;

    /// All flintrock clusters visible in this region.
    async fn describe_all(&self) -> Result<Vec<Cluster>>;

    /// Poll TCP connect against every node until all accept or the timeout
    /// elapses. Providers with real addresses can use the default probe.
    async fn wait_reachable(&self, nodes: &[Node], port: u16, timeout: Duration) -> Result<()> {
        wait_port_open(nodes, port, timeout).await
    }

    /// Start all cluster instances (from stopped).
    async fn start_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Stop all cluster instances. Disks and security groups are retained.
    async fn stop_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Terminate every instance tagged with the cluster name, wait until the
    /// provider reports them gone, then destroy cluster-owned security
    /// groups. Returns the number of instances terminated (0 when nothing
    /// matched). Safe to call on a half-launched cluster.
    async fn terminate_cluster(&self, cluster_name: &str) -> Result<usize>;

    /// Allocate `count` additional slaves shaped like the existing members
    /// (same image, type, key, placement, groups), tagged into the cluster
    /// with role `slave`.
    async fn add(&self, cluster: &Cluster, count: u32) -> Result<Vec<Node>>;

    /// Terminate the given cluster members. The caller picks the victims.
    async fn remove(&self, cluster: &Cluster, victims: &[Node]) -> Result<()>;
}

/// Shared TCP reachability probe. Connects to every node's SSH address on
/// `port`, retrying on an interval until all succeed or `timeout` elapses.
pub async fn wait_port_open(nodes: &[Node], port: u16, timeout: Duration) -> Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_secs(5);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut pending: Vec<&Node> = nodes.iter().collect();

    while !pending.is_empty() {
        let mut still_pending = Vec::new();
        for node in pending {
            let addr = format!("{}:{}", node.ssh_address(), port);
            let reachable = matches!(
                tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await,
                Ok(Ok(_))
            );
            if reachable {
                debug!("provider: node reachable, instance={}, addr={}", node.instance_id, addr);
            } else {
                still_pending.push(node);
            }
        }
        pending = still_pending;

        if pending.is_empty() {
            break;
        }
        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            let unreachable: Vec<&str> =
                pending.iter().map(|n| n.instance_id.as_str()).collect();
            return Err(FlintrockError::Network(format!(
                "timed out after {} waiting for port {} on instances: {}",
                humantime::format_duration(timeout),
                port,
                unreachable.join(", ")
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    info!(
        "provider: all {} nodes reachable on port {}",
        nodes.len(),
        port
    );
    Ok(())
}
