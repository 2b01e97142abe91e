use crate::cluster::{Cluster, Node, NodeRole, Operation, ServiceDescriptor};
use crate::error::{FlintrockError, Result};
use crate::provider::{CloudProvider, NodeSpec};
use crate::services::{self, select_ephemeral_devices, ClusterParams, HealthStatus, Service};
use crate::ssh::{shell_quote, CommandOutput, SshConnector, SshSession};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const SSH_CONNECT_RETRIES: u32 = 12;
const SSH_RETRY_DELAY: Duration = Duration::from_secs(5);
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(600);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Lists candidate instance-store devices with their sizes. nvme0 is always
/// the root device; xvda/sda likewise.
const LIST_DEVICES: &str = r#"for d in /dev/xvd[b-z] /dev/sd[b-z] /dev/nvme[1-9]n1; do
    [ -b "$d" ] || continue
    printf '%s %s\n' "$d" "$(sudo blockdev --getsize64 "$d")"
done
true"#;

/// What `launch` was asked to build.
pub struct LaunchRequest {
    pub cluster_name: String,
    pub num_slaves: u32,
    pub services: Vec<Arc<dyn Service>>,
    pub spec: NodeSpec,
}

/// Result of `add-slaves`: at-least-once semantics, so both lists can be
/// non-empty at the same time.
pub struct AddSlavesOutcome {
    pub added: Vec<Node>,
    pub failed: Vec<(String, String)>,
}

/// Rebuilds service values from the descriptors recorded in provider tags.
/// Swappable so the test suite can reconstruct its own service doubles.
pub type ServiceFactory =
    Arc<dyn Fn(&[ServiceDescriptor]) -> Result<Vec<Arc<dyn Service>>> + Send + Sync>;

/// The work one per-node task performs after its session is established.
/// An enum rather than a closure so the fan-out stays one concrete future.
enum NodeJob<'a> {
    /// Authorize the cluster key, mount ephemeral devices, record mounts.
    Bootstrap {
        pubkey: &'a str,
        mounts: &'a Mutex<HashMap<String, Vec<String>>>,
    },
    Install {
        services: &'a [Arc<dyn Service>],
        params: &'a Arc<ClusterParams>,
    },
    Configure {
        services: &'a [Arc<dyn Service>],
        params: &'a Arc<ClusterParams>,
    },
    StartSlave {
        service: &'a Arc<dyn Service>,
        params: &'a Arc<ClusterParams>,
    },
    /// Install, configure and start a freshly added slave in one session.
    ProvisionSlave {
        services: &'a [Arc<dyn Service>],
        params: &'a Arc<ClusterParams>,
    },
    /// Stop every service, reverse install order, never skipping one.
    StopServices {
        services: &'a [Arc<dyn Service>],
    },
    Run {
        command: &'a str,
        outputs: &'a Mutex<Vec<(Node, CommandOutput)>>,
    },
    Copy {
        data: &'a [u8],
        remote_path: &'a str,
    },
}

impl NodeJob<'_> {
    async fn run(&self, node: &Node, session: &mut dyn SshSession) -> Result<()> {
        match self {
            NodeJob::Bootstrap { pubkey, mounts } => {
                let authorize = format!(
                    "mkdir -p \"$HOME/.ssh\" && chmod 700 \"$HOME/.ssh\" && \
                     {{ grep -qF {key} \"$HOME/.ssh/authorized_keys\" 2>/dev/null || \
                     echo {key} >> \"$HOME/.ssh/authorized_keys\"; }}",
                    key = shell_quote(pubkey),
                );
                services::run_checked(session, "authorize cluster key", &authorize).await?;

                let listing =
                    services::run_checked(session, "list block devices", LIST_DEVICES).await?;
                let devices = select_ephemeral_devices(&listing);
                let node_mounts = mount_ephemeral_devices(session, &devices).await?;
                mounts
                    .lock()
                    .expect("mount map lock")
                    .insert(node.instance_id.clone(), node_mounts);
                Ok(())
            }
            NodeJob::Install { services, params } => {
                for service in services.iter() {
                    service.install(node, session, params).await?;
                }
                Ok(())
            }
            NodeJob::Configure { services, params } => {
                for service in services.iter() {
                    service.configure(node, session, params).await?;
                }
                Ok(())
            }
            NodeJob::StartSlave { service, params } => {
                service.start_slave(node, session, params).await
            }
            NodeJob::ProvisionSlave { services, params } => {
                for service in services.iter() {
                    service.install(node, session, params).await?;
                    service.configure(node, session, params).await?;
                    service.start_slave(node, session, params).await?;
                }
                Ok(())
            }
            NodeJob::StopServices { services } => {
                let mut first_err = None;
                for service in services.iter().rev() {
                    if let Err(e) = service.stop(node, session).await {
                        warn!(
                            "orchestrator: stopping {} on {} failed: {}",
                            service.name(),
                            node.instance_id,
                            e
                        );
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            NodeJob::Run { command, outputs } => {
                let output = session.run(command, &[]).await?;
                outputs
                    .lock()
                    .expect("output lock")
                    .push((node.clone(), output));
                Ok(())
            }
            NodeJob::Copy { data, remote_path } => session.copy(data, remote_path, 0o644).await,
        }
    }
}

/// Drives every lifecycle operation against the provider and SSH seams.
pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    connector: Arc<dyn SshConnector>,
    http: reqwest::Client,
    ssh_user: String,
    identity_file: Option<PathBuf>,
    assume_yes: bool,
    service_factory: ServiceFactory,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        connector: Arc<dyn SshConnector>,
        ssh_user: String,
        identity_file: Option<PathBuf>,
        assume_yes: bool,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        Self {
            provider,
            connector,
            http,
            ssh_user,
            identity_file,
            assume_yes,
            service_factory: Arc::new(|descriptors| services::from_descriptors(descriptors)),
        }
    }

    pub fn with_service_factory(mut self, factory: ServiceFactory) -> Self {
        self.service_factory = factory;
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    // ---- Launch ----

    pub async fn launch(&self, mut request: LaunchRequest) -> Result<Cluster> {
        if request.num_slaves == 0 {
            return Err(FlintrockError::Config(
                "a cluster needs at least one slave".to_string(),
            ));
        }
        if request.services.is_empty() {
            return Err(FlintrockError::Config(
                "no services selected for installation".to_string(),
            ));
        }
        if self.provider.describe(&request.cluster_name).await?.is_some() {
            return Err(FlintrockError::WrongState(format!(
                "cluster {} already exists",
                request.cluster_name
            )));
        }

        request.spec.services_tag =
            ServiceDescriptor::encode_tag(&services::descriptors(&request.services));
        request.spec.client_ports = request
            .services
            .iter()
            .flat_map(|s| s.required_ports())
            .collect();

        let started = Instant::now();
        let name = request.cluster_name.clone();
        match self.launch_inner(&request).await {
            Ok(cluster) => {
                info!(
                    "orchestrator: cluster {} launched in {}",
                    name,
                    humantime::format_duration(round_secs(started.elapsed()))
                );
                Ok(cluster)
            }
            Err(e) => Err(self.rollback_launch(&name, e).await),
        }
    }

    async fn launch_inner(&self, request: &LaunchRequest) -> Result<Cluster> {
        let name = &request.cluster_name;
        let total = request.num_slaves + 1;

        let nodes = self.provider.allocate(name, total, &request.spec).await?;
        if nodes.len() != total as usize {
            return Err(FlintrockError::Provider(format!(
                "provider returned {} of {} requested instances",
                nodes.len(),
                total
            )));
        }
        info!(
            "orchestrator: allocated {} instances for cluster {}",
            nodes.len(),
            name
        );

        // The first allocated instance becomes the master.
        let mut master = nodes[0].clone();
        master.role = NodeRole::Master;
        let mut slaves: Vec<Node> = nodes[1..].to_vec();
        for slave in &mut slaves {
            slave.role = NodeRole::Slave;
        }
        self.provider
            .tag_role(&master.instance_id, NodeRole::Master)
            .await?;
        for slave in &slaves {
            self.provider
                .tag_role(&slave.instance_id, NodeRole::Slave)
                .await?;
        }

        let all: Vec<Node> = std::iter::once(master.clone())
            .chain(slaves.iter().cloned())
            .collect();
        self.provider
            .wait_reachable(&all, 22, REACHABLE_TIMEOUT)
            .await?;

        let params = self.bootstrap(name, &master, &slaves).await?;

        let results = self
            .for_each_node(
                &all,
                NodeJob::Install {
                    services: &request.services,
                    params: &params,
                },
            )
            .await;
        all_ok("install", results)?;

        self.distribute_services(&master, &request.services, &params)
            .await?;

        let results = self
            .for_each_node(
                &all,
                NodeJob::Configure {
                    services: &request.services,
                    params: &params,
                },
            )
            .await;
        all_ok("configure", results)?;

        self.start_services(&master, &slaves, &request.services, &params)
            .await?;

        let cluster = self.provider.describe(name).await?.ok_or_else(|| {
            FlintrockError::InconsistentCluster(format!("cluster {} vanished after launch", name))
        })?;
        self.await_all_healthy(&request.services, &cluster).await?;
        Ok(cluster)
    }

    /// Release everything allocated during a failed launch. The original
    /// error is always what the caller sees; rollback trouble is reported
    /// alongside it in the log.
    async fn rollback_launch(&self, name: &str, original: FlintrockError) -> FlintrockError {
        error!("orchestrator: launch of {} failed: {}", name, original);
        if matches!(original, FlintrockError::Config(_)) {
            return original;
        }
        if !self.assume_yes {
            let keep = !confirm(&format!(
                "Terminate the instances and security groups created for cluster {}? [y/N] ",
                name
            ))
            .await;
            if keep {
                warn!(
                    "orchestrator: leaving partially launched cluster {} in place",
                    name
                );
                return original;
            }
        }
        // The release itself gets one retry before we report it.
        for attempt in 1..=2u32 {
            match self.provider.terminate_cluster(name).await {
                Ok(count) => {
                    info!(
                        "orchestrator: rollback complete, cluster={}, instances_released={}",
                        name, count
                    );
                    return original;
                }
                Err(e) if attempt == 1 => {
                    warn!("orchestrator: rollback attempt failed, retrying: {}", e);
                }
                Err(e) => {
                    error!(
                        "orchestrator: rollback failed, cluster {} may have leaked resources: {}",
                        name, e
                    );
                }
            }
        }
        original
    }

    /// Best-effort cleanup after the user interrupts a launch.
    pub async fn cancel_launch(&self, name: &str) {
        let _ = self
            .rollback_launch(
                name,
                FlintrockError::Network("launch interrupted".to_string()),
            )
            .await;
    }

    // ---- Node bootstrap ----

    /// Prepare every node (ephemeral mounts, intra-cluster SSH key) and
    /// publish the cluster parameters. Runs before any service touches a
    /// node; the returned value is immutable from then on.
    async fn bootstrap(
        &self,
        cluster_name: &str,
        master: &Node,
        slaves: &[Node],
    ) -> Result<Arc<ClusterParams>> {
        // The cluster key lets the master reach the slaves (git-build rsync,
        // service start scripts). Generated once, reused across starts.
        let keygen = r#"mkdir -p "$HOME/.ssh"
chmod 700 "$HOME/.ssh"
if [ ! -f "$HOME/.ssh/flintrock" ]; then
    ssh-keygen -q -t rsa -N '' -f "$HOME/.ssh/flintrock"
fi
cat "$HOME/.ssh/flintrock.pub""#;
        let mut session = self.connect(master).await?;
        let pubkey = services::run_checked(session.as_mut(), "generate cluster key", keygen)
            .await?
            .trim()
            .to_string();
        let _ = session.close().await;

        let all: Vec<Node> = std::iter::once(master.clone())
            .chain(slaves.iter().cloned())
            .collect();
        let mounts: Mutex<HashMap<String, Vec<String>>> = Mutex::new(HashMap::new());
        let results = self
            .for_each_node(
                &all,
                NodeJob::Bootstrap {
                    pubkey: &pubkey,
                    mounts: &mounts,
                },
            )
            .await;
        all_ok("bootstrap", results)?;

        let mounts = mounts.lock().expect("mount map lock").clone();
        Ok(Arc::new(ClusterParams {
            cluster_name: cluster_name.to_string(),
            master_private: master.private_address.clone(),
            master_public: master.public_address.clone(),
            slave_privates: slaves.iter().map(|s| s.private_address.clone()).collect(),
            ephemeral_mounts: mounts,
            ssh_user: self.ssh_user.clone(),
        }))
    }

    // ---- Service phases ----

    async fn distribute_services(
        &self,
        master: &Node,
        services: &[Arc<dyn Service>],
        params: &Arc<ClusterParams>,
    ) -> Result<()> {
        let mut session = self.connect(master).await?;
        let mut result = Ok(());
        for service in services {
            result = service.distribute(master, session.as_mut(), params).await;
            if result.is_err() {
                break;
            }
        }
        let _ = session.close().await;
        result
    }

    /// Within each service the master starts before any slave; across
    /// services the list order (HDFS before Spark) is preserved.
    async fn start_services(
        &self,
        master: &Node,
        slaves: &[Node],
        services: &[Arc<dyn Service>],
        params: &Arc<ClusterParams>,
    ) -> Result<()> {
        for service in services {
            let mut session = self.connect(master).await?;
            let result = service.start_master(master, session.as_mut(), params).await;
            let _ = session.close().await;
            result?;
            info!(
                "orchestrator: {} master started on {}",
                service.name(),
                master.instance_id
            );

            let results = self
                .for_each_node(slaves, NodeJob::StartSlave { service, params })
                .await;
            all_ok("start slaves", results)?;
        }
        Ok(())
    }

    async fn await_all_healthy(
        &self,
        services: &[Arc<dyn Service>],
        cluster: &Cluster,
    ) -> Result<()> {
        for service in services {
            let deadline = Instant::now() + service.health_check_timeout();
            loop {
                match service.health_check(cluster, &self.http).await? {
                    HealthStatus::Ok => {
                        info!("orchestrator: {} healthy", service.name());
                        break;
                    }
                    HealthStatus::Failed => {
                        return Err(FlintrockError::HealthCheck(format!(
                            "{} reported failure",
                            service.name()
                        )));
                    }
                    HealthStatus::NotReady => {
                        if Instant::now() >= deadline {
                            return Err(FlintrockError::HealthCheck(format!(
                                "{} not healthy within {}",
                                service.name(),
                                humantime::format_duration(service.health_check_timeout())
                            )));
                        }
                        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Lifecycle operations on existing clusters ----

    pub async fn describe_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        self.provider.describe(name).await
    }

    pub async fn describe_all(&self) -> Result<Vec<Cluster>> {
        self.provider.describe_all().await
    }

    async fn existing_cluster(&self, name: &str, op: Operation) -> Result<Cluster> {
        let cluster = self
            .provider
            .describe(name)
            .await?
            .ok_or_else(|| FlintrockError::WrongState(format!("cluster {} does not exist", name)))?;
        cluster.check_operation(op)?;
        Ok(cluster)
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let cluster = self.existing_cluster(name, Operation::Stop).await?;
        let services = (self.service_factory)(&cluster.services)?;
        let nodes: Vec<Node> = cluster.nodes().into_iter().cloned().collect();
        let results = self
            .for_each_node(&nodes, NodeJob::StopServices { services: &services })
            .await;
        if let Err(e) = all_ok("stop services", results) {
            // Instances are going down anyway; a failed service stop only
            // costs an unclean shutdown.
            warn!("orchestrator: service stop incomplete: {}", e);
        }
        self.provider.stop_cluster(&cluster).await?;
        info!("orchestrator: cluster {} stopping", name);
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<Cluster> {
        let cluster = self.existing_cluster(name, Operation::Start).await?;
        let services = (self.service_factory)(&cluster.services)?;
        self.provider.start_cluster(&cluster).await?;

        // Public addresses change across stop/start, so the model must be
        // rebuilt and every config re-rendered.
        let cluster = self.provider.describe(name).await?.ok_or_else(|| {
            FlintrockError::InconsistentCluster(format!("cluster {} vanished during start", name))
        })?;
        let master = cluster.master()?.clone();
        let slaves = cluster.slaves.clone();
        let all: Vec<Node> = cluster.nodes().into_iter().cloned().collect();

        self.provider
            .wait_reachable(&all, 22, REACHABLE_TIMEOUT)
            .await?;
        // Ephemeral disks come back empty after a stop; remount them.
        let params = self.bootstrap(name, &master, &slaves).await?;
        let results = self
            .for_each_node(
                &all,
                NodeJob::Configure {
                    services: &services,
                    params: &params,
                },
            )
            .await;
        all_ok("configure", results)?;
        self.start_services(&master, &slaves, &services, &params)
            .await?;
        self.await_all_healthy(&services, &cluster).await?;
        Ok(cluster)
    }

    /// Returns `false` when no such cluster exists (an informational no-op).
    pub async fn destroy(&self, name: &str) -> Result<bool> {
        match self.provider.describe(name).await? {
            None => Ok(false),
            Some(cluster) => {
                cluster.check_operation(Operation::Destroy)?;
                if !self.assume_yes {
                    let go = confirm(&format!(
                        "Destroy cluster {} with {} nodes? [y/N] ",
                        name,
                        cluster.node_count()
                    ))
                    .await;
                    if !go {
                        return Err(FlintrockError::Config("destroy aborted".to_string()));
                    }
                }
                self.provider.terminate_cluster(name).await?;
                info!("orchestrator: cluster {} destroyed", name);
                Ok(true)
            }
        }
    }

    pub async fn add_slaves(&self, name: &str, count: u32) -> Result<AddSlavesOutcome> {
        let cluster = self.existing_cluster(name, Operation::AddSlaves).await?;
        let services = (self.service_factory)(&cluster.services)?;
        let master = cluster.master()?.clone();

        let new_nodes = self.provider.add(&cluster, count).await?;
        self.provider
            .wait_reachable(&new_nodes, 22, REACHABLE_TIMEOUT)
            .await?;

        // Parameters reflect the grown cluster: old slaves plus new ones.
        let mut slaves = cluster.slaves.clone();
        slaves.extend(new_nodes.iter().cloned());
        let params = self.bootstrap(name, &master, &slaves).await?;

        // At-least-once: nodes that made it all the way stay in the cluster,
        // failures are reported and the rest proceeds.
        let results = self
            .for_each_node(
                &new_nodes,
                NodeJob::ProvisionSlave {
                    services: &services,
                    params: &params,
                },
            )
            .await;
        let mut added = Vec::new();
        let mut failed = Vec::new();
        for (node, result) in results {
            match result {
                Ok(()) => added.push(node),
                Err(e) => {
                    error!(
                        "orchestrator: add-slaves failed on {}: {}",
                        node.instance_id, e
                    );
                    failed.push((node.instance_id.clone(), e.to_string()));
                }
            }
        }

        // Ask the master to pick up the new slave set.
        self.reconfigure_master(&master, &services, &params).await?;
        info!(
            "orchestrator: add-slaves done, cluster={}, added={}, failed={}",
            name,
            added.len(),
            failed.len()
        );
        Ok(AddSlavesOutcome { added, failed })
    }

    pub async fn remove_slaves(&self, name: &str, count: u32) -> Result<Vec<Node>> {
        let cluster = self.existing_cluster(name, Operation::RemoveSlaves).await?;
        let services = (self.service_factory)(&cluster.services)?;
        let master = cluster.master()?.clone();
        let victims = cluster.removal_candidates(count as usize)?;

        let results = self
            .for_each_node(&victims, NodeJob::StopServices { services: &services })
            .await;
        if let Err(e) = all_ok("stop removed slaves", results) {
            // The victims are about to be terminated; losing a graceful stop
            // is not worth failing the operation for.
            warn!(
                "orchestrator: service stop on removed slaves incomplete: {}",
                e
            );
        }
        self.provider.remove(&cluster, &victims).await?;

        let victim_ids: Vec<&str> = victims.iter().map(|n| n.instance_id.as_str()).collect();
        let survivors: Vec<Node> = cluster
            .slaves
            .iter()
            .filter(|s| !victim_ids.contains(&s.instance_id.as_str()))
            .cloned()
            .collect();
        let params = Arc::new(ClusterParams {
            cluster_name: cluster.name.clone(),
            master_private: master.private_address.clone(),
            master_public: master.public_address.clone(),
            slave_privates: survivors.iter().map(|s| s.private_address.clone()).collect(),
            ephemeral_mounts: HashMap::new(),
            ssh_user: self.ssh_user.clone(),
        });
        self.reconfigure_master(&master, &services, &params).await?;
        info!(
            "orchestrator: remove-slaves done, cluster={}, removed={}",
            name,
            victims.len()
        );
        Ok(victims)
    }

    /// Rewrite the master's slave list and nudge the running services.
    async fn reconfigure_master(
        &self,
        master: &Node,
        services: &[Arc<dyn Service>],
        params: &Arc<ClusterParams>,
    ) -> Result<()> {
        let mut session = self.connect(master).await?;
        let mut result = Ok(());
        for service in services {
            result = service.configure(master, session.as_mut(), params).await;
            if result.is_err() {
                break;
            }
        }
        let _ = session.close().await;
        result
    }

    // ---- Fan-out commands ----

    pub async fn run_command(
        &self,
        name: &str,
        command: &str,
    ) -> Result<Vec<(Node, CommandOutput)>> {
        let cluster = self.existing_cluster(name, Operation::RunCommand).await?;
        let nodes: Vec<Node> = cluster.nodes().into_iter().cloned().collect();
        let outputs: Mutex<Vec<(Node, CommandOutput)>> = Mutex::new(Vec::new());
        let results = self
            .for_each_node(
                &nodes,
                NodeJob::Run {
                    command,
                    outputs: &outputs,
                },
            )
            .await;
        all_ok("run-command", results)?;
        let mut outputs = outputs.lock().expect("output lock").clone();
        outputs.sort_by(|a, b| a.0.instance_id.cmp(&b.0.instance_id));
        Ok(outputs)
    }

    pub async fn copy_file(&self, name: &str, local: &Path, remote: &str) -> Result<usize> {
        let cluster = self.existing_cluster(name, Operation::CopyFile).await?;
        let data = std::fs::read(local).map_err(|e| {
            FlintrockError::Config(format!("cannot read {}: {}", local.display(), e))
        })?;
        let nodes: Vec<Node> = cluster.nodes().into_iter().cloned().collect();
        let results = self
            .for_each_node(
                &nodes,
                NodeJob::Copy {
                    data: &data,
                    remote_path: remote,
                },
            )
            .await;
        all_ok("copy-file", results)?;
        Ok(nodes.len())
    }

    /// SSH target for `login`: `(user@host, identity-file)`.
    pub async fn login_target(&self, name: &str) -> Result<(String, Option<PathBuf>)> {
        let cluster = self.existing_cluster(name, Operation::Login).await?;
        let master = cluster.master()?;
        Ok((
            format!("{}@{}", cluster.ssh_user, master.ssh_address()),
            cluster.identity_file.clone(),
        ))
    }

    // ---- Helpers ----

    async fn connect(&self, node: &Node) -> Result<Box<dyn SshSession>> {
        self.connector
            .connect(
                node.ssh_address(),
                &self.ssh_user,
                self.identity_file.as_deref(),
                SSH_CONNECT_RETRIES,
                SSH_RETRY_DELAY,
            )
            .await
    }

    /// Run `job` against every node concurrently, one SSH session per node,
    /// concurrency bounded by the node count. Sessions are closed when the
    /// job finishes, successfully or not; the transport also releases them
    /// on drop if a task is cancelled mid-flight.
    async fn for_each_node(&self, nodes: &[Node], job: NodeJob<'_>) -> Vec<(Node, Result<()>)> {
        let concurrency = nodes.len().max(1);
        let job = &job;
        stream::iter(nodes.iter().cloned())
            .map(|node| async move {
                let outcome = async {
                    let mut session = self.connect(&node).await?;
                    let result = job.run(&node, session.as_mut()).await;
                    let _ = session.close().await;
                    result
                }
                .await;
                (node, outcome)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await
    }
}

/// Collapse per-node results: log every failure, surface the first.
fn all_ok(label: &str, results: Vec<(Node, Result<()>)>) -> Result<()> {
    let mut first = None;
    for (node, result) in results {
        if let Err(e) = result {
            error!(
                "orchestrator: {} failed, instance={}, error={}",
                label, node.instance_id, e
            );
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Format and mount the selected devices under /media/ephemeralN, returning
/// the mount points. Already-mounted devices are left alone.
async fn mount_ephemeral_devices(
    session: &mut dyn SshSession,
    devices: &[String],
) -> Result<Vec<String>> {
    let mut mounts = Vec::with_capacity(devices.len());
    for (index, device) in devices.iter().enumerate() {
        let mount = format!("/media/ephemeral{}", index);
        let script = format!(
            r#"sudo mkdir -p {mount}
if ! mountpoint -q {mount}; then
    sudo mkfs.ext4 -q -F {device}
    sudo mount {device} {mount}
fi
sudo chown "$(id -u):$(id -g)" {mount}"#,
            device = shell_quote(device),
            mount = shell_quote(&mount),
        );
        services::run_checked(session, "mount ephemeral device", &script).await?;
        mounts.push(mount);
    }
    Ok(mounts)
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

/// One y/N prompt on the operator's terminal.
async fn confirm(prompt: &str) -> bool {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    })
    .await
    .unwrap_or(false)
}
