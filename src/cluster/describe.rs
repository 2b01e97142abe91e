use crate::cluster::model::Cluster;
use serde::Serialize;

/// Machine-readable describe document. Key names are part of the external
/// interface and must stay stable across releases.
#[derive(Debug, Serialize)]
pub struct DescribeDocument {
    pub clusters: Vec<ClusterDocument>,
}

#[derive(Debug, Serialize)]
pub struct ClusterDocument {
    pub name: String,
    pub state: String,
    #[serde(rename = "node-count")]
    pub node_count: usize,
    /// Master public address; `null` while the cluster is stopped.
    pub master: Option<String>,
    /// Slave public addresses in allocation order; `null` entries while stopped.
    pub slaves: Vec<Option<String>>,
    pub services: Vec<ServiceDocument>,
}

#[derive(Debug, Serialize)]
pub struct ServiceDocument {
    pub name: String,
    pub version: String,
}

impl DescribeDocument {
    pub fn from_clusters(clusters: &[Cluster]) -> Self {
        Self {
            clusters: clusters.iter().map(ClusterDocument::from_cluster).collect(),
        }
    }

    pub fn render(&self) -> String {
        // Serialization of plain strings and vecs cannot fail.
        serde_json::to_string_pretty(self).expect("describe document serialization")
    }
}

impl ClusterDocument {
    pub fn from_cluster(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name.clone(),
            state: cluster.state.as_str().to_string(),
            node_count: cluster.node_count(),
            master: cluster
                .master
                .as_ref()
                .and_then(|m| m.public_address.clone()),
            slaves: cluster
                .slaves
                .iter()
                .map(|s| s.public_address.clone())
                .collect(),
            services: cluster
                .services
                .iter()
                .map(|s| ServiceDocument {
                    name: s.name.clone(),
                    version: s.version.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::model::{ClusterState, Node, NodeRole, ServiceDescriptor};

    fn sample_cluster(state: ClusterState, public: bool) -> Cluster {
        let addr = |host: &str| {
            if public {
                Some(format!("{}.compute.amazonaws.com", host))
            } else {
                None
            }
        };
        Cluster {
            name: "demo".into(),
            provider: "ec2".into(),
            region: "us-east-1".into(),
            state,
            master: Some(Node {
                instance_id: "i-0aa".into(),
                role: NodeRole::Master,
                public_address: addr("master"),
                private_address: "10.0.0.1".into(),
                instance_type: "m5.large".into(),
                launched_at: None,
            }),
            slaves: vec![Node {
                instance_id: "i-0ab".into(),
                role: NodeRole::Slave,
                public_address: addr("slave0"),
                private_address: "10.0.0.2".into(),
                instance_type: "m5.large".into(),
                launched_at: None,
            }],
            services: vec![ServiceDescriptor::new("spark", "3.2.1")],
            security_groups: vec![],
            ssh_user: "ec2-user".into(),
            identity_file: None,
        }
    }

    #[test]
    fn test_stable_keys() {
        let doc = DescribeDocument::from_clusters(&[sample_cluster(ClusterState::Running, true)]);
        let json: serde_json::Value = serde_json::from_str(&doc.render()).unwrap();
        let cluster = &json["clusters"][0];
        assert_eq!(cluster["name"], "demo");
        assert_eq!(cluster["state"], "running");
        assert_eq!(cluster["node-count"], 2);
        assert_eq!(cluster["services"][0]["name"], "spark");
        assert_eq!(cluster["services"][0]["version"], "3.2.1");
        assert!(cluster["master"].as_str().unwrap().contains("master"));
    }

    #[test]
    fn test_stopped_cluster_has_null_addresses() {
        let doc = DescribeDocument::from_clusters(&[sample_cluster(ClusterState::Stopped, false)]);
        let json: serde_json::Value = serde_json::from_str(&doc.render()).unwrap();
        let cluster = &json["clusters"][0];
        assert_eq!(cluster["state"], "stopped");
        assert_eq!(cluster["node-count"], 2);
        assert!(cluster["master"].is_null());
        assert!(cluster["slaves"][0].is_null());
    }
}
