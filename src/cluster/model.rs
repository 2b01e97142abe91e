use crate::error::{FlintrockError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

/// Tag key carrying the cluster name on every cluster-owned instance.
pub const CLUSTER_NAME_TAG: &str = "flintrock-cluster-name";
/// Tag key carrying the node role (`master` or `slave`).
pub const ROLE_TAG: &str = "flintrock-role";
/// Tag key carrying the installed services as `name:version` pairs,
/// comma-joined. This is what lets `describe` rebuild the service set
/// without any local state.
pub const SERVICES_TAG: &str = "flintrock-services";
/// Prefix of every security group the orchestrator creates and owns.
pub const GROUP_PREFIX: &str = "flintrock-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }

    pub fn parse(s: &str) -> Option<NodeRole> {
        match s {
            "master" => Some(NodeRole::Master),
            "slave" => Some(NodeRole::Slave),
            _ => None,
        }
    }
}

/// One provider instance belonging to a cluster.
///
/// Public addresses are optional: a stopped instance has none, and a spot
/// instance in a private subnet may never get one. The private address is
/// the one every rendered service config refers to.
#[derive(Debug, Clone)]
pub struct Node {
    pub instance_id: String,
    pub role: NodeRole,
    pub public_address: Option<String>,
    pub private_address: String,
    pub instance_type: String,
    pub launched_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Address used for SSH from the operator's machine. Falls back to the
    /// private address when no public one exists (VPN / peered VPC setups).
    pub fn ssh_address(&self) -> &str {
        self.public_address
            .as_deref()
            .unwrap_or(&self.private_address)
    }
}

/// Installed service as recorded in provider tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Encode a service list into the `flintrock-services` tag value.
    pub fn encode_tag(services: &[ServiceDescriptor]) -> String {
        services
            .iter()
            .map(|s| format!("{}:{}", s.name, s.version))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decode the `flintrock-services` tag value. Unparseable entries are
    /// dropped rather than failing the whole describe.
    pub fn decode_tag(value: &str) -> Vec<ServiceDescriptor> {
        value
            .split(',')
            .filter_map(|entry| {
                let (name, version) = entry.split_once(':')?;
                if name.is_empty() {
                    return None;
                }
                Some(ServiceDescriptor::new(name, version))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Starting,
    Terminating,
    Terminated,
    Inconsistent,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Pending => "pending",
            ClusterState::Running => "running",
            ClusterState::Stopping => "stopping",
            ClusterState::Stopped => "stopped",
            ClusterState::Starting => "starting",
            ClusterState::Terminating => "terminating",
            ClusterState::Terminated => "terminated",
            ClusterState::Inconsistent => "inconsistent",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operations gated by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Stop,
    Start,
    Destroy,
    AddSlaves,
    RemoveSlaves,
    RunCommand,
    CopyFile,
    Login,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Stop => "stop",
            Operation::Start => "start",
            Operation::Destroy => "destroy",
            Operation::AddSlaves => "add-slaves",
            Operation::RemoveSlaves => "remove-slaves",
            Operation::RunCommand => "run-command",
            Operation::CopyFile => "copy-file",
            Operation::Login => "login",
        }
    }
}

/// In-memory representation of a cluster, rebuilt from provider metadata on
/// every invocation. Holds nodes by value; nodes carry no back-reference.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub provider: String,
    pub region: String,
    pub state: ClusterState,
    pub master: Option<Node>,
    pub slaves: Vec<Node>,
    pub services: Vec<ServiceDescriptor>,
    /// Ids of security groups created on this cluster's behalf.
    pub security_groups: Vec<String>,
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,
}

impl Cluster {
    pub fn node_count(&self) -> usize {
        self.slaves.len() + usize::from(self.master.is_some())
    }

    /// All nodes, master first.
    pub fn nodes(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = Vec::with_capacity(self.node_count());
        if let Some(ref m) = self.master {
            out.push(m);
        }
        out.extend(self.slaves.iter());
        out
    }

    pub fn master(&self) -> Result<&Node> {
        self.master.as_ref().ok_or_else(|| {
            FlintrockError::InconsistentCluster(format!("cluster {} has no master", self.name))
        })
    }

    /// Check that `op` is legal in the current state. Never mutates.
    pub fn check_operation(&self, op: Operation) -> Result<()> {
        let allowed = match op {
            Operation::Stop => self.state == ClusterState::Running,
            Operation::Start => self.state == ClusterState::Stopped,
            Operation::Destroy => matches!(
                self.state,
                ClusterState::Pending
                    | ClusterState::Running
                    | ClusterState::Stopped
                    | ClusterState::Inconsistent
            ),
            Operation::AddSlaves | Operation::RemoveSlaves => {
                self.state == ClusterState::Running
            }
            Operation::RunCommand | Operation::CopyFile | Operation::Login => {
                self.state == ClusterState::Running
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(FlintrockError::WrongState(format!(
                "cannot {} cluster {} in state {}",
                op.as_str(),
                self.name,
                self.state
            )))
        }
    }

    /// Slaves selected for removal: the `n` slaves with the lowest instance
    /// ids, in ascending order. Provider ids share a fixed prefix, so the
    /// lexicographic sort is also the numeric one.
    pub fn removal_candidates(&self, n: usize) -> Result<Vec<Node>> {
        if n > self.slaves.len() {
            return Err(FlintrockError::Config(format!(
                "cannot remove {} slaves from cluster {} with {} slaves",
                n,
                self.name,
                self.slaves.len()
            )));
        }
        let mut sorted = self.slaves.clone();
        sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        sorted.truncate(n);
        Ok(sorted)
    }

    /// Derive the aggregate cluster state from per-instance provider states.
    /// `instance_states` holds provider state names ("running", "stopped", ...)
    /// for every non-terminated instance tagged with this cluster's name.
    pub fn aggregate_state(instance_states: &[&str]) -> ClusterState {
        if instance_states.is_empty() {
            return ClusterState::Terminated;
        }
        let all = |wanted: &str| instance_states.iter().all(|s| *s == wanted);
        let any = |wanted: &str| instance_states.iter().any(|s| *s == wanted);
        if all("running") {
            ClusterState::Running
        } else if all("stopped") {
            ClusterState::Stopped
        } else if any("shutting-down") || any("terminated") {
            ClusterState::Terminating
        } else if any("stopping") {
            ClusterState::Stopping
        } else if any("pending") && !any("stopped") {
            ClusterState::Pending
        } else if any("pending") {
            // Some stopped, some coming up: a start is in flight.
            ClusterState::Starting
        } else {
            ClusterState::Inconsistent
        }
    }
}
