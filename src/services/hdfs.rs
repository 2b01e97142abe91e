use crate::cluster::{Cluster, Node};
use crate::error::Result;
use crate::services::{
    run_checked, spark::install_tarball_script, ClusterParams, HealthStatus, Service,
};
use crate::ssh::{shell_quote, SshSession};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const HDFS_NAMENODE_PORT: u16 = 9000;
const HDFS_NAMENODE_UI_PORT: u16 = 9870;

#[derive(Debug, Clone)]
pub struct HdfsOptions {
    pub version: String,
    /// Custom tarball URL; `{v}` expands to the version.
    pub download_url: Option<String>,
}

impl Default for HdfsOptions {
    fn default() -> Self {
        Self {
            version: "3.3.6".to_string(),
            download_url: None,
        }
    }
}

pub struct HdfsService {
    options: HdfsOptions,
}

impl HdfsService {
    pub fn new(options: HdfsOptions) -> Self {
        Self { options }
    }

    fn download_url(&self) -> String {
        match self.options.download_url {
            Some(ref template) => template.replace("{v}", &self.options.version),
            None => format!(
                "https://archive.apache.org/dist/hadoop/common/hadoop-{v}/hadoop-{v}.tar.gz",
                v = self.options.version
            ),
        }
    }
}

fn xml_document(properties: &[(String, String)]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<configuration>\n");
    for (name, value) in properties {
        out.push_str(&format!(
            "    <property>\n        <name>{}</name>\n        <value>{}</value>\n    </property>\n",
            name, value
        ));
    }
    out.push_str("</configuration>\n");
    out
}

pub(crate) fn render_core_site(master_private: &str) -> String {
    xml_document(&[(
        "fs.defaultFS".to_string(),
        format!("hdfs://{}:{}", master_private, HDFS_NAMENODE_PORT),
    )])
}

/// Namenode metadata directory: first ephemeral mount, or a /tmp fallback
/// on instance types without instance storage.
pub(crate) fn namenode_dir(mounts: &[String]) -> String {
    mounts
        .first()
        .map(|m| format!("{}/hdfs/name", m))
        .unwrap_or_else(|| "/tmp/flintrock-hdfs/name".to_string())
}

pub(crate) fn datanode_dirs(mounts: &[String]) -> Vec<String> {
    if mounts.is_empty() {
        vec!["/tmp/flintrock-hdfs/data".to_string()]
    } else {
        mounts.iter().map(|m| format!("{}/hdfs/data", m)).collect()
    }
}

pub(crate) fn render_hdfs_site(num_slaves: usize, mounts: &[String]) -> String {
    let replication = num_slaves.min(3).max(1);
    xml_document(&[
        ("dfs.replication".to_string(), replication.to_string()),
        (
            "dfs.namenode.name.dir".to_string(),
            format!("file://{}", namenode_dir(mounts)),
        ),
        (
            "dfs.datanode.data.dir".to_string(),
            datanode_dirs(mounts)
                .iter()
                .map(|d| format!("file://{}", d))
                .collect::<Vec<_>>()
                .join(","),
        ),
    ])
}

#[async_trait]
impl Service for HdfsService {
    fn name(&self) -> &'static str {
        "hdfs"
    }

    fn version(&self) -> &str {
        &self.options.version
    }

    fn required_ports(&self) -> Vec<u16> {
        vec![HDFS_NAMENODE_PORT, HDFS_NAMENODE_UI_PORT]
    }

    async fn install(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        run_checked(
            session,
            "install java",
            "command -v java >/dev/null 2>&1 || sudo yum install -q -y java-11-amazon-corretto-headless",
        )
        .await?;
        let script = install_tarball_script(&self.download_url(), "hadoop", "bin/hdfs");
        run_checked(session, "install hadoop", &script).await?;
        debug!("services: hdfs: installed, instance={}", node.instance_id);
        Ok(())
    }

    async fn configure(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        let mounts = params.mounts_for(node);
        session
            .copy(
                render_core_site(&params.master_private).as_bytes(),
                "hadoop/etc/hadoop/core-site.xml",
                0o644,
            )
            .await?;
        session
            .copy(
                render_hdfs_site(params.slave_privates.len(), mounts).as_bytes(),
                "hadoop/etc/hadoop/hdfs-site.xml",
                0o644,
            )
            .await?;
        // The start scripts need JAVA_HOME; derive it from the installed jre.
        session
            .copy(
                b"export JAVA_HOME=\"$(dirname \"$(dirname \"$(readlink -f \"$(command -v java)\")\")\")\"\n",
                "hadoop/etc/hadoop/hadoop-env.sh",
                0o644,
            )
            .await?;
        let mut workers = params.slave_privates.join("\n");
        workers.push('\n');
        session
            .copy(workers.as_bytes(), "hadoop/etc/hadoop/workers", 0o644)
            .await?;
        Ok(())
    }

    async fn start_master(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        let name_dir = namenode_dir(params.mounts_for(node));
        // Formatting is destructive; skip when the namenode was formatted on
        // an earlier start.
        let script = format!(
            r#"set -e
if [ ! -f {name_dir}/current/VERSION ]; then
    hadoop/bin/hdfs namenode -format -nonInteractive
fi
hadoop/bin/hdfs --daemon start namenode"#,
            name_dir = shell_quote(&name_dir),
        );
        run_checked(session, "start hdfs namenode", &script).await?;
        Ok(())
    }

    async fn start_slave(
        &self,
        _node: &Node,
        session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        run_checked(
            session,
            "start hdfs datanode",
            "hadoop/bin/hdfs --daemon start datanode",
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, _node: &Node, session: &mut dyn SshSession) -> Result<()> {
        run_checked(
            session,
            "stop hdfs",
            "hadoop/bin/hdfs --daemon stop datanode >/dev/null 2>&1 || true; \
             hadoop/bin/hdfs --daemon stop namenode >/dev/null 2>&1 || true",
        )
        .await?;
        Ok(())
    }

    async fn health_check(
        &self,
        cluster: &Cluster,
        http: &reqwest::Client,
    ) -> Result<HealthStatus> {
        let master = cluster.master()?;
        let url = format!(
            "http://{}:{}/jmx?qry=Hadoop:service=NameNode,name=FSNamesystemState",
            master.ssh_address(),
            HDFS_NAMENODE_UI_PORT
        );
        let response = match http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => return Ok(HealthStatus::NotReady),
        };
        if !response.status().is_success() {
            return Ok(HealthStatus::NotReady);
        }
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return Ok(HealthStatus::NotReady),
        };
        let live = body["beans"][0]["NumLiveDataNodes"].as_u64().unwrap_or(0) as usize;
        if live >= cluster.slaves.len() {
            Ok(HealthStatus::Ok)
        } else {
            debug!(
                "services: hdfs: datanodes live={}/{}",
                live,
                cluster.slaves.len()
            );
            Ok(HealthStatus::NotReady)
        }
    }
}
