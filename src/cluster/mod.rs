pub mod describe;
pub mod model;

pub use describe::{ClusterDocument, DescribeDocument};
pub use model::{
    Cluster, ClusterState, Node, NodeRole, Operation, ServiceDescriptor, CLUSTER_NAME_TAG,
    GROUP_PREFIX, ROLE_TAG, SERVICES_TAG,
};
