//! In-memory doubles for the provider and SSH seams. The provider keeps a
//! map of fake instances and security groups; the SSH connector records
//! every command and copied file.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flintrock::cluster::{Cluster, Node, NodeRole, ServiceDescriptor};
use flintrock::error::{FlintrockError, Result};
use flintrock::orchestrator::ServiceFactory;
use flintrock::provider::{CloudProvider, NodeSpec};
use flintrock::services::{ClusterParams, HealthStatus, Service};
use flintrock::ssh::{CommandOutput, SshConnector, SshSession};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CALLER_IP: &str = "203.0.113.7";

// ---------------------------------------------------------------------------
// Provider stub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StubInstance {
    pub id: String,
    pub cluster: String,
    pub role: Option<NodeRole>,
    pub state: String,
    pub private: String,
    pub public: Option<String>,
    pub instance_type: String,
    pub services_tag: String,
    /// Allocation order across the whole provider.
    pub seq: u32,
}

#[derive(Debug, Clone)]
pub struct StubGroup {
    pub name: String,
    /// (port, cidr) ingress rules; port 0 stands for "all traffic".
    pub rules: Vec<(u16, String)>,
}

#[derive(Default)]
struct StubState {
    /// Counts down so instances allocated later get lower ids, mirroring the
    /// fact that real provider ids carry no allocation order.
    next_id: u32,
    next_seq: u32,
    restart_generation: u32,
    instances: HashMap<String, StubInstance>,
    groups: HashMap<String, StubGroup>,
    terminated: Vec<String>,
    fail_allocate: bool,
}

pub struct StubProvider {
    state: Mutex<StubState>,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StubState {
                next_id: 9000,
                ..Default::default()
            }),
        })
    }

    pub fn fail_next_allocate(&self) {
        self.state.lock().unwrap().fail_allocate = true;
    }

    pub fn instance_ids(&self, cluster: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.cluster == cluster)
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .groups
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn group_rules(&self, name: &str) -> Option<Vec<(u16, String)>> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(name)
            .map(|g| g.rules.clone())
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().unwrap().terminated.clone()
    }

    /// Insert a running cluster with explicit instance ids, bypassing
    /// allocation. The first slave id is the first-allocated slave.
    pub fn seed_cluster(&self, name: &str, master_id: &str, slave_ids: &[&str], services: &str) {
        let mut state = self.state.lock().unwrap();
        state.groups.insert(
            format!("flintrock-{}", name),
            StubGroup {
                name: format!("flintrock-{}", name),
                rules: vec![(0, "self".to_string())],
            },
        );
        let mut insert = |id: &str, role: NodeRole, seq: u32| {
            state.instances.insert(
                id.to_string(),
                StubInstance {
                    id: id.to_string(),
                    cluster: name.to_string(),
                    role: Some(role),
                    state: "running".to_string(),
                    private: format!("10.0.1.{}", seq + 1),
                    public: Some(format!("ec2-{}.example.com", id)),
                    instance_type: "m5.large".to_string(),
                    services_tag: services.to_string(),
                    seq,
                },
            );
        };
        insert(master_id, NodeRole::Master, 0);
        for (i, id) in slave_ids.iter().enumerate() {
            insert(id, NodeRole::Slave, (i + 1) as u32);
        }
        state.next_seq = (slave_ids.len() + 1) as u32;
    }

    fn allocate_instances(
        state: &mut StubState,
        cluster: &str,
        count: u32,
        instance_type: &str,
        services_tag: &str,
        role: Option<NodeRole>,
    ) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            state.next_id -= 1;
            state.next_seq += 1;
            let id = format!("i-{:04}", state.next_id);
            let seq = state.next_seq;
            let instance = StubInstance {
                id: id.clone(),
                cluster: cluster.to_string(),
                role,
                state: "running".to_string(),
                private: format!("10.0.0.{}", seq),
                public: Some(format!("ec2-{}.example.com", id)),
                instance_type: instance_type.to_string(),
                services_tag: services_tag.to_string(),
                seq,
            };
            nodes.push(node_of(&instance));
            state.instances.insert(id, instance);
        }
        nodes
    }
}

fn node_of(instance: &StubInstance) -> Node {
    Node {
        instance_id: instance.id.clone(),
        role: instance.role.unwrap_or(NodeRole::Slave),
        public_address: instance.public.clone(),
        private_address: instance.private.clone(),
        instance_type: instance.instance_type.clone(),
        launched_at: Utc.timestamp_opt(1_700_000_000 + i64::from(instance.seq), 0).single(),
    }
}

#[async_trait]
impl CloudProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn allocate(&self, cluster_name: &str, count: u32, spec: &NodeSpec) -> Result<Vec<Node>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_allocate {
            state.fail_allocate = false;
            return Err(FlintrockError::Provider(
                "requested instances, provider created 0".to_string(),
            ));
        }

        // Shared group with client rules, then the per-cluster group.
        let shared = state
            .groups
            .entry("flintrock".to_string())
            .or_insert_with(|| StubGroup {
                name: "flintrock".to_string(),
                rules: Vec::new(),
            });
        let mut ports = vec![22u16];
        ports.extend(&spec.client_ports);
        for port in ports {
            let rule = (port, format!("{}/32", CALLER_IP));
            if !shared.rules.contains(&rule) {
                shared.rules.push(rule);
            }
        }
        let cluster_group = format!("flintrock-{}", cluster_name);
        state
            .groups
            .entry(cluster_group.clone())
            .or_insert_with(|| StubGroup {
                name: cluster_group,
                rules: vec![(0, "self".to_string())],
            });

        Ok(Self::allocate_instances(
            &mut state,
            cluster_name,
            count,
            &spec.instance_type,
            &spec.services_tag,
            None,
        ))
    }

    async fn tag_role(&self, instance_id: &str, role: NodeRole) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(instance_id).ok_or_else(|| {
            FlintrockError::Provider(format!("no such instance {}", instance_id))
        })?;
        instance.role = Some(role);
        Ok(())
    }

    async fn describe(&self, cluster_name: &str) -> Result<Option<Cluster>> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<&StubInstance> = state
            .instances
            .values()
            .filter(|i| i.cluster == cluster_name)
            .collect();
        if members.is_empty() {
            return Ok(None);
        }
        members.sort_by_key(|i| i.seq);

        let states: Vec<&str> = members.iter().map(|i| i.state.as_str()).collect();
        let cluster_state = Cluster::aggregate_state(&states);

        let master = members
            .iter()
            .find(|i| i.role == Some(NodeRole::Master))
            .map(|i| node_of(i));
        let slaves: Vec<Node> = members
            .iter()
            .filter(|i| i.role == Some(NodeRole::Slave))
            .map(|i| node_of(i))
            .collect();
        let services = members
            .first()
            .map(|i| ServiceDescriptor::decode_tag(&i.services_tag))
            .unwrap_or_default();

        Ok(Some(Cluster {
            name: cluster_name.to_string(),
            provider: "stub".to_string(),
            region: "us-east-1".to_string(),
            state: cluster_state,
            master,
            slaves,
            services,
            security_groups: vec![format!("flintrock-{}", cluster_name)],
            ssh_user: "ec2-user".to_string(),
            identity_file: None,
        }))
    }

    async fn describe_all(&self) -> Result<Vec<Cluster>> {
        let names: Vec<String> = {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state
                .instances
                .values()
                .map(|i| i.cluster.clone())
                .collect();
            names.sort();
            names.dedup();
            names
        };
        let mut clusters = Vec::new();
        for name in names {
            if let Some(cluster) = self.describe(&name).await? {
                clusters.push(cluster);
            }
        }
        Ok(clusters)
    }

    async fn wait_reachable(&self, _nodes: &[Node], _port: u16, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn start_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.restart_generation += 1;
        let generation = state.restart_generation;
        for instance in state.instances.values_mut() {
            if instance.cluster == cluster.name {
                instance.state = "running".to_string();
                // Public addresses are reassigned on every start.
                instance.public = Some(format!("ec2-{}-r{}.example.com", instance.id, generation));
            }
        }
        Ok(())
    }

    async fn stop_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for instance in state.instances.values_mut() {
            if instance.cluster == cluster.name {
                instance.state = "stopped".to_string();
                instance.public = None;
            }
        }
        Ok(())
    }

    async fn terminate_cluster(&self, cluster_name: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = state
            .instances
            .values()
            .filter(|i| i.cluster == cluster_name)
            .map(|i| i.id.clone())
            .collect();
        for id in &ids {
            state.instances.remove(id);
            state.terminated.push(id.clone());
        }
        state.groups.remove(&format!("flintrock-{}", cluster_name));
        Ok(ids.len())
    }

    async fn add(&self, cluster: &Cluster, count: u32) -> Result<Vec<Node>> {
        let mut state = self.state.lock().unwrap();
        let instance_type = cluster
            .master
            .as_ref()
            .map(|m| m.instance_type.clone())
            .unwrap_or_else(|| "m5.large".to_string());
        let services_tag = ServiceDescriptor::encode_tag(&cluster.services);
        Ok(Self::allocate_instances(
            &mut state,
            &cluster.name,
            count,
            &instance_type,
            &services_tag,
            Some(NodeRole::Slave),
        ))
    }

    async fn remove(&self, _cluster: &Cluster, victims: &[Node]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for victim in victims {
            state.instances.remove(&victim.instance_id);
            state.terminated.push(victim.instance_id.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSH stub
// ---------------------------------------------------------------------------

pub struct StubSsh {
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
    pub files: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    pub per_command_delay: Duration,
}

impl StubSsh {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(per_command_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            files: Arc::new(Mutex::new(HashMap::new())),
            per_command_delay,
        })
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(host.to_string(), path.to_string()))
            .map(|data| String::from_utf8_lossy(data).to_string())
    }
}

#[async_trait]
impl SshConnector for StubSsh {
    async fn connect(
        &self,
        host: &str,
        _user: &str,
        _identity: Option<&Path>,
        _retries: u32,
        _retry_delay: Duration,
    ) -> Result<Box<dyn SshSession>> {
        Ok(Box::new(StubSession {
            host: host.to_string(),
            commands: self.commands.clone(),
            files: self.files.clone(),
            delay: self.per_command_delay,
        }))
    }
}

struct StubSession {
    host: String,
    commands: Arc<Mutex<Vec<(String, String)>>>,
    files: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    delay: Duration,
}

#[async_trait]
impl SshSession for StubSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&mut self, command: &str, _env: &[(String, String)]) -> Result<CommandOutput> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        // Canned responses for the orchestrator's bootstrap commands. The
        // 4 GiB device exercises the small-device filter.
        let stdout = if command.contains("ssh-keygen") {
            "ssh-rsa AAAAB3NzaStubKey flintrock\n".to_string()
        } else if command.contains("blockdev") {
            "/dev/nvme1n1 100000000000\n/dev/nvme2n1 4294967296\n".to_string()
        } else if command.contains("nproc") {
            "4\n".to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn copy(&mut self, data: &[u8], remote_path: &str, _mode: u32) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert((self.host.clone(), remote_path.to_string()), data.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service stub
// ---------------------------------------------------------------------------

pub struct StubService {
    pub service_name: &'static str,
    pub service_version: String,
    /// (service, phase, instance id), in call order across all stubs that
    /// share the log.
    pub events: Arc<Mutex<Vec<(String, String, String)>>>,
    pub configured_params: Arc<Mutex<Vec<ClusterParams>>>,
    pub fail_install_on: Mutex<Option<String>>,
    pub health: Mutex<HealthStatus>,
}

impl StubService {
    pub fn new(name: &'static str, version: &str) -> Arc<Self> {
        Self::with_events(name, version, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_events(
        name: &'static str,
        version: &str,
        events: Arc<Mutex<Vec<(String, String, String)>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_name: name,
            service_version: version.to_string(),
            events,
            configured_params: Arc::new(Mutex::new(Vec::new())),
            fail_install_on: Mutex::new(None),
            health: Mutex::new(HealthStatus::Ok),
        })
    }

    pub fn inject_install_failure(&self, instance_id: &str) {
        *self.fail_install_on.lock().unwrap() = Some(instance_id.to_string());
    }

    pub fn set_health(&self, health: HealthStatus) {
        *self.health.lock().unwrap() = health;
    }

    fn record(&self, phase: &str, node: &Node) {
        self.events.lock().unwrap().push((
            self.service_name.to_string(),
            phase.to_string(),
            node.instance_id.clone(),
        ));
    }

    pub fn phases_for(&self, instance_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, i)| s == self.service_name && i == instance_id)
            .map(|(_, p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Service for StubService {
    fn name(&self) -> &'static str {
        self.service_name
    }

    fn version(&self) -> &str {
        &self.service_version
    }

    fn required_ports(&self) -> Vec<u16> {
        vec![8080]
    }

    async fn install(
        &self,
        node: &Node,
        _session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        self.record("install", node);
        let fail = self.fail_install_on.lock().unwrap().clone();
        if let Some(target) = fail {
            if target == "any" || target == node.instance_id {
                return Err(FlintrockError::RemoteCommand {
                    host: node.private_address.clone(),
                    command: "install".to_string(),
                    exit_code: 1,
                    stderr: "injected install failure".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn configure(
        &self,
        node: &Node,
        _session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        self.record("configure", node);
        self.configured_params.lock().unwrap().push(params.clone());
        Ok(())
    }

    async fn start_master(
        &self,
        node: &Node,
        _session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        self.record("start_master", node);
        Ok(())
    }

    async fn start_slave(
        &self,
        node: &Node,
        _session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        self.record("start_slave", node);
        Ok(())
    }

    async fn stop(&self, node: &Node, _session: &mut dyn SshSession) -> Result<()> {
        self.record("stop", node);
        Ok(())
    }

    async fn health_check(
        &self,
        _cluster: &Cluster,
        _http: &reqwest::Client,
    ) -> Result<HealthStatus> {
        Ok(*self.health.lock().unwrap())
    }

    fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(200)
    }
}

/// Service factory routing descriptors back to the given stubs by name.
pub fn stub_factory(services: Vec<Arc<StubService>>) -> ServiceFactory {
    Arc::new(move |descriptors: &[ServiceDescriptor]| {
        descriptors
            .iter()
            .map(|d| {
                services
                    .iter()
                    .find(|s| s.service_name == d.name)
                    .cloned()
                    .map(|s| s as Arc<dyn Service>)
                    .ok_or_else(|| {
                        FlintrockError::InconsistentCluster(format!(
                            "no stub service for {}",
                            d.name
                        ))
                    })
            })
            .collect()
    })
}
