use crate::cluster::{
    Cluster, ClusterState, Node, NodeRole, ServiceDescriptor, CLUSTER_NAME_TAG, GROUP_PREFIX,
    ROLE_TAG, SERVICES_TAG,
};
use crate::error::{FlintrockError, Result};
use crate::provider::{CloudProvider, NodeSpec};
use async_trait::async_trait;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, Instance,
    InstanceStateName, InstanceType, IpPermission, IpRange, Placement,
    RequestSpotLaunchSpecification, ResourceType, SpotPlacement, Tag, TagSpecification,
    UserIdGroupPair, VolumeType,
};
use aws_sdk_ec2::Client;
use base64::Engine as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the security group shared by every flintrock cluster in a VPC.
/// It holds the client-facing rules (SSH and service UIs from the caller's
/// public IP); per-cluster groups hold the intra-cluster rules.
const SHARED_GROUP: &str = "flintrock";

const RUNNING_TIMEOUT: Duration = Duration::from_secs(600);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// EC2 implementation of the provider contract. Region and credentials come
/// from the SDK's standard chain; an explicit region overrides it.
pub struct Ec2Provider {
    client: Client,
    region: String,
    http: reqwest::Client,
    ssh_user: String,
    identity_file: Option<PathBuf>,
}

impl Ec2Provider {
    pub async fn connect(
        region: Option<String>,
        ssh_user: String,
        identity_file: Option<PathBuf>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref r) = region {
            loader = loader.region(aws_config::Region::new(r.clone()));
        }
        let shared = loader.load().await;
        let region = shared
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| {
                FlintrockError::Config(
                    "no region configured: pass --region or set the SDK default".to_string(),
                )
            })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Ok(Self {
            client: Client::new(&shared),
            region,
            http,
            ssh_user,
            identity_file,
        })
    }

    fn err<E: std::error::Error + 'static>(context: &str) -> impl FnOnce(E) -> FlintrockError + '_ {
        move |e| FlintrockError::Provider(format!("{}: {}", context, DisplayErrorContext(e)))
    }

    /// The caller's current public IP, as seen by AWS.
    async fn caller_public_ip(&self) -> Result<String> {
        let ip = self
            .http
            .get("https://checkip.amazonaws.com")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(ip.trim().to_string())
    }

    // ---- Instance listing and model reconstruction ----

    /// All non-terminated instances tagged with `cluster_name`, or with any
    /// flintrock cluster tag when `cluster_name` is `None`. One paginated
    /// listing; no local state is consulted. Throttled calls get one retry.
    async fn list_instances(&self, cluster_name: Option<&str>) -> Result<Vec<Instance>> {
        match self.list_instances_once(cluster_name).await {
            Err(e) if is_transient(&e) => {
                warn!("provider: ec2: transient describe failure, retrying once: {}", e);
                tokio::time::sleep(POLL_INTERVAL).await;
                self.list_instances_once(cluster_name).await
            }
            other => other,
        }
    }

    async fn list_instances_once(&self, cluster_name: Option<&str>) -> Result<Vec<Instance>> {
        let name_filter = match cluster_name {
            Some(name) => Filter::builder()
                .name(format!("tag:{}", CLUSTER_NAME_TAG))
                .values(name)
                .build(),
            None => Filter::builder().name("tag-key").values(CLUSTER_NAME_TAG).build(),
        };
        let mut pages = self
            .client
            .describe_instances()
            .filters(name_filter)
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .values("stopping")
                    .values("stopped")
                    .values("shutting-down")
                    .build(),
            )
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(Self::err("DescribeInstances"))?;
            for reservation in page.reservations() {
                instances.extend(reservation.instances().iter().cloned());
            }
        }
        Ok(instances)
    }

    fn build_cluster(&self, name: &str, instances: &[Instance]) -> Result<Cluster> {
        let states: Vec<&str> = instances
            .iter()
            .filter_map(|i| i.state().and_then(|s| s.name()).map(|n| n.as_str()))
            .collect();
        let mut state = Cluster::aggregate_state(&states);

        let mut masters: Vec<Node> = Vec::new();
        let mut slaves: Vec<Node> = Vec::new();
        for instance in instances {
            let node = match node_from_instance(instance) {
                Some(n) => n,
                None => continue,
            };
            match node.role {
                NodeRole::Master => masters.push(node),
                NodeRole::Slave => slaves.push(node),
            }
        }

        // Tie-breaks: a running master beats a stopped one; two running
        // masters cannot be reconciled.
        let running_masters = masters
            .iter()
            .filter(|m| instance_state(instances, &m.instance_id) == Some("running"))
            .count();
        let master = if running_masters > 1 {
            state = ClusterState::Inconsistent;
            warn!(
                "provider: ec2: cluster {} has {} running masters",
                name, running_masters
            );
            None
        } else {
            masters.sort_by_key(|m| {
                // Running first, then stable by id.
                let running = instance_state(instances, &m.instance_id) == Some("running");
                (!running, m.instance_id.clone())
            });
            masters.into_iter().next()
        };
        if master.is_none() && state != ClusterState::Inconsistent && !instances.is_empty() {
            state = ClusterState::Inconsistent;
        }

        // Allocation order: the launch batch shares a launch time, so the id
        // sort within a batch is the stable tiebreak, and later add-slaves
        // batches sort after it.
        slaves.sort_by(|a, b| {
            (a.launched_at, &a.instance_id).cmp(&(b.launched_at, &b.instance_id))
        });

        let services = instances
            .iter()
            .find_map(|i| tag_value(i, SERVICES_TAG))
            .map(ServiceDescriptor::decode_tag)
            .unwrap_or_default();

        let mut security_groups: Vec<String> = Vec::new();
        for instance in instances {
            for group in instance.security_groups() {
                let owned = group
                    .group_name()
                    .map(|n| n.starts_with(GROUP_PREFIX))
                    .unwrap_or(false);
                if owned {
                    if let Some(id) = group.group_id() {
                        if !security_groups.iter().any(|g| g == id) {
                            security_groups.push(id.to_string());
                        }
                    }
                }
            }
        }

        Ok(Cluster {
            name: name.to_string(),
            provider: "ec2".to_string(),
            region: self.region.clone(),
            state,
            master,
            slaves,
            services,
            security_groups,
            ssh_user: self.ssh_user.clone(),
            identity_file: self.identity_file.clone(),
        })
    }

    // ---- Security groups ----

    async fn resolve_vpc(&self, spec: &NodeSpec) -> Result<String> {
        if let Some(ref vpc) = spec.vpc_id {
            return Ok(vpc.clone());
        }
        if let Some(ref subnet) = spec.subnet_id {
            let resp = self
                .client
                .describe_subnets()
                .subnet_ids(subnet)
                .send()
                .await
                .map_err(Self::err("DescribeSubnets"))?;
            if let Some(vpc) = resp.subnets().first().and_then(|s| s.vpc_id()) {
                return Ok(vpc.to_string());
            }
            return Err(FlintrockError::Provider(format!(
                "subnet {} has no VPC",
                subnet
            )));
        }
        let resp = self
            .client
            .describe_vpcs()
            .filters(Filter::builder().name("is-default").values("true").build())
            .send()
            .await
            .map_err(Self::err("DescribeVpcs"))?;
        resp.vpcs()
            .first()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| {
                FlintrockError::Provider(
                    "no default VPC: pass --vpc-id or --subnet-id".to_string(),
                )
            })
    }

    async fn find_group(&self, name: &str, vpc_id: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(Self::err("DescribeSecurityGroups"))?;
        Ok(resp
            .security_groups()
            .first()
            .and_then(|g| g.group_id())
            .map(str::to_string))
    }

    async fn authorize(&self, group_id: &str, permission: IpPermission) -> Result<()> {
        let result = self
            .client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(permission)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            // Re-running launch against surviving groups must not fail.
            Err(e) if format!("{}", DisplayErrorContext(&e)).contains("InvalidPermission.Duplicate") => {
                Ok(())
            }
            Err(e) => Err(Self::err("AuthorizeSecurityGroupIngress")(e)),
        }
    }

    /// Find or create the shared flintrock group and the per-cluster group,
    /// returning `[cluster_group_id, shared_group_id]`. User-supplied groups
    /// are attached elsewhere and never modified here.
    async fn ensure_security_groups(
        &self,
        cluster_name: &str,
        spec: &NodeSpec,
    ) -> Result<Vec<String>> {
        let vpc_id = self.resolve_vpc(spec).await?;

        let shared_id = match self.find_group(SHARED_GROUP, &vpc_id).await? {
            Some(id) => id,
            None => {
                let id = self
                    .client
                    .create_security_group()
                    .group_name(SHARED_GROUP)
                    .description("flintrock client access")
                    .vpc_id(&vpc_id)
                    .send()
                    .await
                    .map_err(Self::err("CreateSecurityGroup"))?
                    .group_id()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        FlintrockError::Provider("CreateSecurityGroup returned no id".into())
                    })?;
                info!("provider: ec2: created shared group, id={}", id);
                id
            }
        };

        // Client rules track the caller's current public IP, so they are
        // (re)applied on every launch, not only on group creation.
        let caller_ip = self.caller_public_ip().await?;
        let cidr = format!("{}/32", caller_ip);
        let mut client_ports: Vec<u16> = vec![22];
        client_ports.extend(&spec.client_ports);
        for port in client_ports {
            self.authorize(
                &shared_id,
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(i32::from(port))
                    .to_port(i32::from(port))
                    .ip_ranges(IpRange::builder().cidr_ip(&cidr).build())
                    .build(),
            )
            .await?;
        }

        let cluster_group = format!("{}{}", GROUP_PREFIX, cluster_name);
        let cluster_id = match self.find_group(&cluster_group, &vpc_id).await? {
            Some(id) => id,
            None => {
                let id = self
                    .client
                    .create_security_group()
                    .group_name(&cluster_group)
                    .description(format!("flintrock cluster {}", cluster_name))
                    .vpc_id(&vpc_id)
                    .send()
                    .await
                    .map_err(Self::err("CreateSecurityGroup"))?
                    .group_id()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        FlintrockError::Provider("CreateSecurityGroup returned no id".into())
                    })?;
                info!(
                    "provider: ec2: created cluster group, name={}, id={}",
                    cluster_group, id
                );
                id
            }
        };

        // All intra-cluster traffic, any protocol.
        self.authorize(
            &cluster_id,
            IpPermission::builder()
                .ip_protocol("-1")
                .user_id_group_pairs(UserIdGroupPair::builder().group_id(&cluster_id).build())
                .build(),
        )
        .await?;

        Ok(vec![cluster_id, shared_id])
    }

    async fn delete_cluster_group(&self, cluster_name: &str) -> Result<()> {
        let group_name = format!("{}{}", GROUP_PREFIX, cluster_name);
        let resp = self
            .client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(&group_name).build())
            .send()
            .await
            .map_err(Self::err("DescribeSecurityGroups"))?;

        for group in resp.security_groups() {
            let Some(id) = group.group_id() else { continue };
            // Network interfaces of just-terminated instances can linger for
            // a little while and make the delete fail with DependencyViolation.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
            loop {
                match self.client.delete_security_group().group_id(id).send().await {
                    Ok(_) => {
                        info!("provider: ec2: deleted group, name={}, id={}", group_name, id);
                        break;
                    }
                    Err(e) => {
                        let rendered = format!("{}", DisplayErrorContext(&e));
                        if rendered.contains("DependencyViolation")
                            && tokio::time::Instant::now() < deadline
                        {
                            tokio::time::sleep(POLL_INTERVAL).await;
                            continue;
                        }
                        return Err(Self::err("DeleteSecurityGroup")(e));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Allocation ----

    /// Root device name of the AMI, needed to size the root EBS volume.
    async fn root_device_name(&self, ami: &str) -> Result<String> {
        let resp = self
            .client
            .describe_images()
            .image_ids(ami)
            .send()
            .await
            .map_err(Self::err("DescribeImages"))?;
        Ok(resp
            .images()
            .first()
            .and_then(|i| i.root_device_name())
            .unwrap_or("/dev/sda1")
            .to_string())
    }

    fn standard_tags(&self, cluster_name: &str, spec: &NodeSpec) -> Vec<Tag> {
        let mut tags = vec![
            Tag::builder()
                .key(CLUSTER_NAME_TAG)
                .value(cluster_name)
                .build(),
            Tag::builder().key(SERVICES_TAG).value(&spec.services_tag).build(),
            Tag::builder()
                .key("Name")
                .value(format!("{}{}", GROUP_PREFIX, cluster_name))
                .build(),
        ];
        for (key, value) in &spec.tags {
            tags.push(Tag::builder().key(key).value(value).build());
        }
        tags
    }

    async fn launch_on_demand(
        &self,
        cluster_name: &str,
        count: u32,
        spec: &NodeSpec,
        group_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut request = self
            .client
            .run_instances()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(count as i32)
            .max_count(count as i32);

        for group in group_ids {
            request = request.security_group_ids(group);
        }
        if let Some(ref key) = spec.key_name {
            request = request.key_name(key);
        }
        if let Some(ref subnet) = spec.subnet_id {
            request = request.subnet_id(subnet);
        }
        if let Some(ref zone) = spec.zone {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }
        if let Some(ref profile) = spec.instance_profile {
            request = request.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        if let Some(ref data) = spec.user_data {
            request = request.user_data(base64::engine::general_purpose::STANDARD.encode(data));
        }
        if let Some(gb) = spec.ebs_root_gb {
            let device = self.root_device_name(&spec.ami).await?;
            request = request.block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(device)
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(gb)
                            .volume_type(VolumeType::Gp3)
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            );
        }
        let mut tag_spec = TagSpecification::builder().resource_type(ResourceType::Instance);
        for tag in self.standard_tags(cluster_name, spec) {
            tag_spec = tag_spec.tags(tag);
        }
        request = request.tag_specifications(tag_spec.build());

        let resp = request.send().await.map_err(Self::err("RunInstances"))?;
        let ids: Vec<String> = resp
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();
        if ids.len() != count as usize {
            // min_count == max_count makes this unreachable in practice, but
            // the contract requires naming the partial allocation.
            return Err(FlintrockError::Provider(format!(
                "requested {} instances, provider created {}",
                count,
                ids.len()
            )));
        }
        Ok(ids)
    }

    async fn launch_spot(
        &self,
        cluster_name: &str,
        count: u32,
        spec: &NodeSpec,
        group_ids: &[String],
        price: f64,
    ) -> Result<Vec<String>> {
        let mut launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.instance_type.as_str()));
        for group in group_ids {
            launch = launch.security_group_ids(group);
        }
        if let Some(ref key) = spec.key_name {
            launch = launch.key_name(key);
        }
        if let Some(ref subnet) = spec.subnet_id {
            launch = launch.subnet_id(subnet);
        }
        if let Some(ref zone) = spec.zone {
            launch = launch.placement(SpotPlacement::builder().availability_zone(zone).build());
        }
        if let Some(ref profile) = spec.instance_profile {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        if let Some(ref data) = spec.user_data {
            launch = launch.user_data(base64::engine::general_purpose::STANDARD.encode(data));
        }

        let resp = self
            .client
            .request_spot_instances()
            .spot_price(format!("{}", price))
            .instance_count(count as i32)
            .launch_specification(launch.build())
            .send()
            .await
            .map_err(Self::err("RequestSpotInstances"))?;

        let request_ids: Vec<String> = resp
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect();
        info!(
            "provider: ec2: spot requests submitted, count={}, price={}",
            request_ids.len(),
            price
        );

        // Poll until every request is fulfilled, or cancel everything.
        let deadline = tokio::time::Instant::now() + spec.spot_timeout;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let resp = self
                .client
                .describe_spot_instance_requests()
                .set_spot_instance_request_ids(Some(request_ids.clone()))
                .send()
                .await
                .map_err(Self::err("DescribeSpotInstanceRequests"))?;

            let mut instance_ids = Vec::new();
            let mut pending = 0usize;
            let mut failed: Option<String> = None;
            for request in resp.spot_instance_requests() {
                match request.instance_id() {
                    Some(id) => instance_ids.push(id.to_string()),
                    None => {
                        let code = request
                            .status()
                            .and_then(|s| s.code())
                            .unwrap_or("pending");
                        if matches!(
                            code,
                            "price-too-low" | "capacity-not-available" | "bad-parameters"
                        ) {
                            failed = Some(code.to_string());
                        }
                        pending += 1;
                    }
                }
            }

            if pending == 0 {
                // Fulfilled requests do not tag their instances; do it now.
                let mut create_tags = self.client.create_tags();
                for id in &instance_ids {
                    create_tags = create_tags.resources(id);
                }
                for tag in self.standard_tags(cluster_name, spec) {
                    create_tags = create_tags.tags(tag);
                }
                create_tags.send().await.map_err(Self::err("CreateTags"))?;
                return Ok(instance_ids);
            }

            let out_of_time = tokio::time::Instant::now() >= deadline;
            if out_of_time || failed.is_some() {
                warn!(
                    "provider: ec2: spot allocation failed, fulfilled={}, pending={}, status={:?}",
                    instance_ids.len(),
                    pending,
                    failed
                );
                self.client
                    .cancel_spot_instance_requests()
                    .set_spot_instance_request_ids(Some(request_ids.clone()))
                    .send()
                    .await
                    .map_err(Self::err("CancelSpotInstanceRequests"))?;
                if !instance_ids.is_empty() {
                    self.client
                        .terminate_instances()
                        .set_instance_ids(Some(instance_ids.clone()))
                        .send()
                        .await
                        .map_err(Self::err("TerminateInstances"))?;
                }
                return Err(FlintrockError::Provider(format!(
                    "spot allocation failed after creating {} of {} instances ({}); \
                     requests cancelled and instances released",
                    instance_ids.len(),
                    count,
                    failed.unwrap_or_else(|| "fulfillment timeout".to_string()),
                )));
            }
            debug!(
                "provider: ec2: spot pending, fulfilled={}, pending={}",
                instance_ids.len(),
                pending
            );
        }
    }

    /// Poll until every instance is running, then return nodes in the order
    /// of `ids` (the allocation order).
    async fn wait_running(&self, ids: &[String]) -> Result<Vec<Instance>> {
        let deadline = tokio::time::Instant::now() + RUNNING_TIMEOUT;
        loop {
            let resp = match self
                .client
                .describe_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
            {
                Ok(resp) => resp,
                // Fresh instance ids can lag into the describe index.
                Err(e)
                    if format!("{}", DisplayErrorContext(&e))
                        .contains("InvalidInstanceID.NotFound")
                        && tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Err(Self::err("DescribeInstances")(e)),
            };

            let mut by_id: HashMap<String, Instance> = HashMap::new();
            for reservation in resp.reservations() {
                for instance in reservation.instances() {
                    if let Some(id) = instance.instance_id() {
                        by_id.insert(id.to_string(), instance.clone());
                    }
                }
            }

            let running = ids
                .iter()
                .filter(|id| {
                    by_id
                        .get(*id)
                        .and_then(|i| i.state())
                        .and_then(|s| s.name())
                        == Some(&InstanceStateName::Running)
                })
                .count();
            if running == ids.len() {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let instance = by_id.remove(id).ok_or_else(|| {
                        FlintrockError::Provider(format!("instance {} vanished", id))
                    })?;
                    out.push(instance);
                }
                return Ok(out);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlintrockError::Provider(format!(
                    "timed out waiting for {} of {} instances to run; \
                     the orchestrator will release this allocation",
                    ids.len() - running,
                    ids.len()
                )));
            }
            debug!(
                "provider: ec2: waiting for instances, running={}/{}",
                running,
                ids.len()
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn allocate_batch(
        &self,
        cluster_name: &str,
        count: u32,
        spec: &NodeSpec,
        group_ids: &[String],
    ) -> Result<Vec<Node>> {
        let ids = match spec.spot_price {
            Some(price) => {
                self.launch_spot(cluster_name, count, spec, group_ids, price)
                    .await?
            }
            None => {
                self.launch_on_demand(cluster_name, count, spec, group_ids)
                    .await?
            }
        };
        let instances = self.wait_running(&ids).await?;
        Ok(instances
            .iter()
            .filter_map(node_from_instance_untagged)
            .collect())
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    fn name(&self) -> &str {
        "ec2"
    }

    async fn allocate(
        &self,
        cluster_name: &str,
        count: u32,
        spec: &NodeSpec,
    ) -> Result<Vec<Node>> {
        let mut group_ids = self.ensure_security_groups(cluster_name, spec).await?;
        group_ids.extend(spec.extra_security_groups.iter().cloned());
        info!(
            "provider: ec2: allocating, cluster={}, count={}, type={}, spot={}",
            cluster_name,
            count,
            spec.instance_type,
            spec.spot_price.is_some()
        );
        self.allocate_batch(cluster_name, count, spec, &group_ids).await
    }

    async fn tag_role(&self, instance_id: &str, role: NodeRole) -> Result<()> {
        self.client
            .create_tags()
            .resources(instance_id)
            .tags(Tag::builder().key(ROLE_TAG).value(role.as_str()).build())
            .send()
            .await
            .map_err(Self::err("CreateTags"))?;
        Ok(())
    }

    async fn describe(&self, cluster_name: &str) -> Result<Option<Cluster>> {
        let instances = self.list_instances(Some(cluster_name)).await?;
        if instances.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.build_cluster(cluster_name, &instances)?))
    }

    async fn describe_all(&self) -> Result<Vec<Cluster>> {
        let instances = self.list_instances(None).await?;
        let mut by_cluster: HashMap<String, Vec<Instance>> = HashMap::new();
        for instance in instances {
            if let Some(name) = tag_value(&instance, CLUSTER_NAME_TAG) {
                by_cluster.entry(name.to_string()).or_default().push(instance);
            }
        }
        let mut names: Vec<String> = by_cluster.keys().cloned().collect();
        names.sort();
        let mut clusters = Vec::with_capacity(names.len());
        for name in names {
            clusters.push(self.build_cluster(&name, &by_cluster[&name])?);
        }
        Ok(clusters)
    }

    async fn start_cluster(&self, cluster: &Cluster) -> Result<()> {
        let ids: Vec<String> = cluster
            .nodes()
            .iter()
            .map(|n| n.instance_id.clone())
            .collect();
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.clone()))
            .send()
            .await
            .map_err(Self::err("StartInstances"))?;
        self.wait_running(&ids).await?;
        Ok(())
    }

    async fn stop_cluster(&self, cluster: &Cluster) -> Result<()> {
        let ids: Vec<String> = cluster
            .nodes()
            .iter()
            .map(|n| n.instance_id.clone())
            .collect();
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(Self::err("StopInstances"))?;
        Ok(())
    }

    async fn terminate_cluster(&self, cluster_name: &str) -> Result<usize> {
        let instances = self.list_instances(Some(cluster_name)).await?;
        let ids: Vec<String> = instances
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();

        if !ids.is_empty() {
            info!(
                "provider: ec2: terminating, cluster={}, instances={}",
                cluster_name,
                ids.len()
            );
            self.client
                .terminate_instances()
                .set_instance_ids(Some(ids.clone()))
                .send()
                .await
                .map_err(Self::err("TerminateInstances"))?;

            // Groups cannot be deleted until the instances are fully gone.
            let deadline = tokio::time::Instant::now() + TERMINATE_TIMEOUT;
            loop {
                let remaining = self.list_instances(Some(cluster_name)).await?;
                if remaining.is_empty() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(FlintrockError::Provider(format!(
                        "timed out waiting for {} instances of cluster {} to terminate",
                        remaining.len(),
                        cluster_name
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.delete_cluster_group(cluster_name).await?;
        Ok(ids.len())
    }

    async fn add(&self, cluster: &Cluster, count: u32) -> Result<Vec<Node>> {
        // New slaves clone the master's shape so the cluster stays
        // homogeneous without the caller restating launch options.
        let master = cluster.master()?;
        let resp = self
            .client
            .describe_instances()
            .instance_ids(&master.instance_id)
            .send()
            .await
            .map_err(Self::err("DescribeInstances"))?;
        let template = resp
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .cloned()
            .ok_or_else(|| {
                FlintrockError::Provider(format!(
                    "master instance {} not found",
                    master.instance_id
                ))
            })?;

        let mut request = self
            .client
            .run_instances()
            .min_count(count as i32)
            .max_count(count as i32);
        if let Some(image) = template.image_id() {
            request = request.image_id(image);
        }
        if let Some(instance_type) = template.instance_type() {
            request = request.instance_type(instance_type.clone());
        }
        if let Some(key) = template.key_name() {
            request = request.key_name(key);
        }
        if let Some(subnet) = template.subnet_id() {
            request = request.subnet_id(subnet);
        }
        if let Some(zone) = template.placement().and_then(|p| p.availability_zone()) {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }
        if let Some(arn) = template.iam_instance_profile().and_then(|p| p.arn()) {
            request = request
                .iam_instance_profile(IamInstanceProfileSpecification::builder().arn(arn).build());
        }
        for group in template.security_groups() {
            if let Some(id) = group.group_id() {
                request = request.security_group_ids(id);
            }
        }
        let mut tag_spec = TagSpecification::builder().resource_type(ResourceType::Instance);
        for tag in template.tags() {
            let keep = tag
                .key()
                .map(|k| k != ROLE_TAG && !k.starts_with("aws:"))
                .unwrap_or(false);
            if keep {
                tag_spec = tag_spec.tags(tag.clone());
            }
        }
        request = request.tag_specifications(tag_spec.build());

        let resp = request.send().await.map_err(Self::err("RunInstances"))?;
        let ids: Vec<String> = resp
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();
        let instances = self.wait_running(&ids).await?;
        let nodes: Vec<Node> = instances
            .iter()
            .filter_map(node_from_instance_untagged)
            .collect();
        for node in &nodes {
            self.tag_role(&node.instance_id, NodeRole::Slave).await?;
        }
        Ok(nodes)
    }

    async fn remove(&self, cluster: &Cluster, victims: &[Node]) -> Result<()> {
        if victims.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = victims.iter().map(|n| n.instance_id.clone()).collect();
        info!(
            "provider: ec2: removing slaves, cluster={}, instances={:?}",
            cluster.name, ids
        );
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(Self::err("TerminateInstances"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Instance helpers
// ---------------------------------------------------------------------------

/// Provider errors worth a single retry (API rate limiting).
fn is_transient(e: &FlintrockError) -> bool {
    matches!(
        e,
        FlintrockError::Provider(msg)
            if msg.contains("RequestLimitExceeded") || msg.contains("Throttling")
    )
}

fn tag_value<'a>(instance: &'a Instance, key: &str) -> Option<&'a str> {
    instance
        .tags()
        .iter()
        .find(|t| t.key() == Some(key))
        .and_then(|t| t.value())
}

fn instance_state<'a>(instances: &'a [Instance], id: &str) -> Option<&'a str> {
    instances
        .iter()
        .find(|i| i.instance_id() == Some(id))
        .and_then(|i| i.state())
        .and_then(|s| s.name())
        .map(|n| n.as_str())
}

fn public_address(instance: &Instance) -> Option<String> {
    instance
        .public_dns_name()
        .filter(|d| !d.is_empty())
        .or(instance.public_ip_address())
        .map(str::to_string)
}

fn launched_at(instance: &Instance) -> Option<chrono::DateTime<chrono::Utc>> {
    instance
        .launch_time()
        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

/// Build a node from a tagged instance; `None` when the role tag is missing
/// or the instance has no private address (should not happen in a VPC).
fn node_from_instance(instance: &Instance) -> Option<Node> {
    let role = NodeRole::parse(tag_value(instance, ROLE_TAG)?)?;
    Some(Node {
        instance_id: instance.instance_id()?.to_string(),
        role,
        public_address: public_address(instance),
        private_address: instance.private_ip_address()?.to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        launched_at: launched_at(instance),
    })
}

/// Same, for freshly allocated instances whose role tag is not applied yet.
fn node_from_instance_untagged(instance: &Instance) -> Option<Node> {
    Some(Node {
        instance_id: instance.instance_id()?.to_string(),
        role: NodeRole::Slave,
        public_address: public_address(instance),
        private_address: instance.private_ip_address()?.to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        launched_at: launched_at(instance),
    })
}
