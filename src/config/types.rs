use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Defaults file for launch and SSH options. Everything here can be
/// overridden per invocation by a CLI flag; the file just keeps frequently
/// reused settings out of the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FlintrockConfig {
    pub ssh: SshConfig,
    pub launch: LaunchConfig,
    pub ec2: Ec2Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SshConfig {
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            identity_file: None,
        }
    }
}

fn default_ssh_user() -> String {
    "ec2-user".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LaunchConfig {
    pub num_slaves: u32,
    pub install_hdfs: bool,
    /// 8 or 11.
    pub java_version: u8,
    pub spark: SparkConfig,
    pub hdfs: HdfsConfig,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            num_slaves: 1,
            install_hdfs: false,
            java_version: default_java_version(),
            spark: SparkConfig::default(),
            hdfs: HdfsConfig::default(),
        }
    }
}

fn default_java_version() -> u8 {
    11
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SparkConfig {
    pub version: String,

    /// Custom tarball URL; `{v}` expands to the version. S3 URLs accepted.
    pub download_url: Option<String>,

    /// Building from git: repository plus a commit SHA, or the literal
    /// `latest` for the default branch's HEAD.
    pub git_repo: Option<String>,
    pub git_commit: Option<String>,

    pub executor_instances: u32,
}

impl Default for SparkConfig {
    fn default() -> Self {
        Self {
            version: default_spark_version(),
            download_url: None,
            git_repo: None,
            git_commit: None,
            executor_instances: 1,
        }
    }
}

fn default_spark_version() -> String {
    "3.5.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HdfsConfig {
    pub version: String,
    pub download_url: Option<String>,
}

impl Default for HdfsConfig {
    fn default() -> Self {
        Self {
            version: default_hdfs_version(),
            download_url: None,
        }
    }
}

fn default_hdfs_version() -> String {
    "3.3.6".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Ec2Config {
    /// Defaults to the cloud SDK's standard region chain when unset.
    pub region: Option<String>,
    pub zone: Option<String>,
    pub ami: Option<String>,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,

    /// Maximum hourly spot bid; on-demand when unset.
    pub spot_price: Option<f64>,
    pub spot_timeout_secs: u64,

    pub ebs_root_gb: Option<i32>,
    pub instance_profile: Option<String>,
    /// File whose contents become instance user data.
    pub user_data: Option<PathBuf>,
    /// Extra security groups, attached but never modified.
    pub security_groups: Vec<String>,
    /// Extra instance tags as `key=value` entries.
    pub tags: Vec<String>,
}

impl Default for Ec2Config {
    fn default() -> Self {
        Self {
            region: None,
            zone: None,
            ami: None,
            instance_type: default_instance_type(),
            key_name: None,
            vpc_id: None,
            subnet_id: None,
            spot_price: None,
            spot_timeout_secs: default_spot_timeout(),
            ebs_root_gb: None,
            instance_profile: None,
            user_data: None,
            security_groups: Vec::new(),
            tags: Vec::new(),
        }
    }
}

fn default_instance_type() -> String {
    "m5.large".to_string()
}

fn default_spot_timeout() -> u64 {
    300
}
