use crate::cluster::{Cluster, Node};
use crate::error::{FlintrockError, Result};
use crate::services::{run_checked, ClusterParams, HealthStatus, Service};
use crate::ssh::{shell_quote, SshSession};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

const SPARK_MASTER_PORT: u16 = 7077;
const SPARK_MASTER_UI_PORT: u16 = 8080;
const SPARK_WORKER_UI_PORT: u16 = 8081;
const SPARK_APP_UI_PORT: u16 = 4040;

#[derive(Debug, Clone)]
pub struct SparkOptions {
    /// Release version for tarball installs; also the reported version for
    /// reconstructed clusters.
    pub version: Option<String>,
    /// Custom tarball URL; `{v}` expands to the version.
    pub download_url: Option<String>,
    pub git_repo: Option<String>,
    /// Commit SHA, or the literal `latest`, resolved at launch time.
    pub git_commit: Option<String>,
    pub executor_instances: u32,
    /// 8 or 11.
    pub java_version: u8,
}

impl Default for SparkOptions {
    fn default() -> Self {
        Self {
            version: None,
            download_url: None,
            git_repo: None,
            git_commit: None,
            executor_instances: 1,
            java_version: 11,
        }
    }
}

pub struct SparkService {
    options: SparkOptions,
}

impl SparkService {
    pub fn new(options: SparkOptions) -> Self {
        Self { options }
    }

    /// Resolve `--spark-git-commit=latest` to the default branch's HEAD via
    /// the GitHub API. Called once before launch; an unreachable API is an
    /// error, never silently substituted.
    pub async fn resolve_git_commit(&mut self, http: &reqwest::Client) -> Result<()> {
        if self.options.git_commit.as_deref() != Some("latest") {
            return Ok(());
        }
        let repo = self
            .options
            .git_repo
            .clone()
            .unwrap_or_else(default_git_repo);
        let slug = github_slug(&repo).ok_or_else(|| {
            FlintrockError::Config(format!("cannot derive a GitHub repo from {}", repo))
        })?;
        let url = format!("https://api.github.com/repos/{}/commits/HEAD", slug);
        let body: serde_json::Value = http
            .get(&url)
            .header("User-Agent", "flintrock")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let sha = body["sha"]
            .as_str()
            .ok_or_else(|| {
                FlintrockError::Provider(format!("GitHub API returned no commit SHA for {}", slug))
            })?
            .to_string();
        info!("services: spark: resolved git commit, repo={}, sha={}", slug, sha);
        self.options.git_commit = Some(sha);
        Ok(())
    }

    fn is_git_install(&self) -> bool {
        self.options.git_commit.is_some()
    }

    fn download_url(&self) -> String {
        let version = self.options.version.as_deref().unwrap_or_default();
        match self.options.download_url {
            Some(ref template) => template.replace("{v}", version),
            None => format!(
                "https://archive.apache.org/dist/spark/spark-{v}/spark-{v}-bin-hadoop3.tgz",
                v = version
            ),
        }
    }

    fn java_package(&self) -> &'static str {
        match self.options.java_version {
            8 => "java-1.8.0-openjdk",
            _ => "java-11-amazon-corretto-headless",
        }
    }
}

fn default_git_repo() -> String {
    "https://github.com/apache/spark".to_string()
}

/// `owner/repo` slug from a GitHub URL or a bare slug.
fn github_slug(repo: &str) -> Option<String> {
    let trimmed = repo
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("git@github.com:"))
        .unwrap_or(trimmed);
    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let name = parts.next()?;
    if owner.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(format!("{}/{}", owner, name))
}

/// Fetch command for a tarball URL; S3 URLs go through the AWS CLI.
fn fetch_command(url: &str, target: &str) -> String {
    if url.starts_with("s3://") {
        format!("aws s3 cp {} {}", shell_quote(url), shell_quote(target))
    } else {
        format!(
            "curl --silent --show-error --fail --location -o {} {}",
            shell_quote(target),
            shell_quote(url)
        )
    }
}

/// Download with retries, self-test the archive, unpack into `dest`.
/// Shared by Spark and HDFS installs.
pub(crate) fn install_tarball_script(url: &str, dest: &str, sentinel: &str) -> String {
    format!(
        r#"set -e
if [ -e {dest}/{sentinel} ]; then exit 0; fi
attempt=1
while true; do
    if {fetch}; then break; fi
    if [ "$attempt" -ge 3 ]; then echo 'download failed' >&2; exit 9; fi
    attempt=$((attempt + 1))
    sleep 1
done
gzip -t /tmp/flintrock-install.tgz
mkdir -p {dest}
tar xzf /tmp/flintrock-install.tgz -C {dest} --strip-components=1
rm -f /tmp/flintrock-install.tgz"#,
        dest = shell_quote(dest),
        sentinel = sentinel,
        fetch = fetch_command(url, "/tmp/flintrock-install.tgz"),
    )
}

/// Render `spark-env.sh`. The public DNS is resolved on the node at service
/// start, IMDSv1 first then IMDSv2; when neither answers the variable stays
/// unset.
pub(crate) fn render_spark_env(
    params: &ClusterParams,
    mounts: &[String],
    cpus: u32,
    options: &SparkOptions,
) -> String {
    let executor_instances = options.executor_instances.max(1);
    let executor_cores = (cpus / executor_instances).max(1);
    let mut env = String::from("#!/usr/bin/env bash\n\n");
    if !mounts.is_empty() {
        env.push_str(&format!("export SPARK_LOCAL_DIRS=\"{}\"\n", mounts.join(",")));
    }
    env.push_str(&format!(
        "export SPARK_MASTER_HOST=\"{}\"\n",
        params.master_private
    ));
    env.push_str(&format!(
        "export SPARK_EXECUTOR_INSTANCES={}\n",
        executor_instances
    ));
    env.push_str(&format!("export SPARK_EXECUTOR_CORES={}\n", executor_cores));
    env.push_str(&format!("export SPARK_WORKER_CORES={}\n", cpus.max(1)));
    env.push_str(
        r#"
SPARK_PUBLIC_DNS="$(curl --silent --fail --max-time 2 http://169.254.169.254/latest/meta-data/public-hostname || true)"
if [ -z "$SPARK_PUBLIC_DNS" ]; then
    IMDS_TOKEN="$(curl --silent --fail --max-time 2 -X PUT http://169.254.169.254/latest/api/token -H 'X-aws-ec2-metadata-token-ttl-seconds: 60' || true)"
    if [ -n "$IMDS_TOKEN" ]; then
        SPARK_PUBLIC_DNS="$(curl --silent --fail --max-time 2 -H "X-aws-ec2-metadata-token: $IMDS_TOKEN" http://169.254.169.254/latest/meta-data/public-hostname || true)"
    fi
fi
if [ -n "$SPARK_PUBLIC_DNS" ]; then
    export SPARK_PUBLIC_DNS
fi
"#,
    );
    env
}

/// One slave private address per line, allocation order.
pub(crate) fn render_slaves(params: &ClusterParams) -> String {
    let mut out = params.slave_privates.join("\n");
    out.push('\n');
    out
}

fn count_alive_workers(body: &str) -> Option<usize> {
    // The master UI renders "Alive Workers:</strong> N" (markup varies a
    // little across releases).
    let re = regex::Regex::new(r"Alive Workers:\s*(?:</strong>\s*)?(\d+)").ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}

#[async_trait]
impl Service for SparkService {
    fn name(&self) -> &'static str {
        "spark"
    }

    fn version(&self) -> &str {
        self.options
            .version
            .as_deref()
            .or(self.options.git_commit.as_deref())
            .unwrap_or("unknown")
    }

    fn required_ports(&self) -> Vec<u16> {
        vec![
            SPARK_MASTER_PORT,
            SPARK_MASTER_UI_PORT,
            SPARK_WORKER_UI_PORT,
            SPARK_APP_UI_PORT,
        ]
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
            &format!(
                "command -v java >/dev/null 2>&1 || sudo yum install -q -y {}",
                self.java_package()
            ),
        )
        .await?;

        if self.is_git_install() {
            // Git builds run on the master only; the artifact reaches the
            // slaves through distribute().
            if node.role != crate::cluster::NodeRole::Master {
                debug!(
                    "services: spark: skipping git build on slave, instance={}",
                    node.instance_id
                );
                return Ok(());
            }
            let repo = self
                .options
                .git_repo
                .clone()
                .unwrap_or_else(default_git_repo);
            let commit = self.options.git_commit.as_deref().unwrap_or_default();
            let script = format!(
                r#"set -e
if [ -x "$HOME/spark/bin/spark-submit" ]; then exit 0; fi
sudo yum install -q -y git
rm -rf "$HOME/spark-build"
git clone {repo} "$HOME/spark-build"
cd "$HOME/spark-build"
git checkout {commit}
./dev/make-distribution.sh --name flintrock -Phadoop-3.2
rm -rf "$HOME/spark"
mv dist "$HOME/spark"
cd && rm -rf "$HOME/spark-build""#,
                repo = shell_quote(&repo),
                commit = shell_quote(commit),
            );
            run_checked(session, "build spark from git", &script).await?;
        } else {
            let script = install_tarball_script(&self.download_url(), "spark", "bin/spark-submit");
            run_checked(session, "install spark", &script).await?;
        }

        // Shell environment for interactive use and for the start scripts.
        run_checked(
            session,
            "spark shell profile",
            r#"grep -q SPARK_HOME "$HOME/.bashrc" 2>/dev/null || cat >> "$HOME/.bashrc" <<'EOF'
export SPARK_HOME="$HOME/spark"
export PYSPARK_PYTHON=python3
export PATH="$SPARK_HOME/bin:$PATH"
EOF"#,
        )
        .await?;
        Ok(())
    }

    async fn distribute(
        &self,
        _master: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        if !self.is_git_install() {
            return Ok(());
        }
        // Push the master-built artifact out over the cluster's internal key.
        for slave in &params.slave_privates {
            let command = format!(
                "rsync -a -e \"ssh -o StrictHostKeyChecking=no -i $HOME/.ssh/flintrock\" \
                 \"$HOME/spark/\" {}@{}:spark/",
                shell_quote(&params.ssh_user),
                shell_quote(slave),
            );
            run_checked(session, "distribute spark build", &command).await?;
        }
        Ok(())
    }

    async fn configure(
        &self,
        node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        let cpus: u32 = run_checked(session, "detect cpu count", "nproc")
            .await?
            .trim()
            .parse()
            .unwrap_or(1);
        let env = render_spark_env(params, params.mounts_for(node), cpus, &self.options);
        session
            .copy(env.as_bytes(), "spark/conf/spark-env.sh", 0o755)
            .await?;
        session
            .copy(render_slaves(params).as_bytes(), "spark/conf/slaves", 0o644)
            .await?;
        debug!(
            "services: spark: configured, instance={}, cpus={}",
            node.instance_id, cpus
        );
        Ok(())
    }

    async fn start_master(
        &self,
        _node: &Node,
        session: &mut dyn SshSession,
        _params: &ClusterParams,
    ) -> Result<()> {
        run_checked(session, "start spark master", "spark/sbin/start-master.sh").await?;
        Ok(())
    }

    async fn start_slave(
        &self,
        _node: &Node,
        session: &mut dyn SshSession,
        params: &ClusterParams,
    ) -> Result<()> {
        let master_url = format!("spark://{}:{}", params.master_private, SPARK_MASTER_PORT);
        let command = format!(
            "if [ -x spark/sbin/start-worker.sh ]; then spark/sbin/start-worker.sh {url}; \
             else spark/sbin/start-slave.sh {url}; fi",
            url = shell_quote(&master_url),
        );
        run_checked(session, "start spark worker", &command).await?;
        Ok(())
    }

    async fn stop(&self, _node: &Node, session: &mut dyn SshSession) -> Result<()> {
        run_checked(
            session,
            "stop spark",
            "{ spark/sbin/stop-worker.sh || spark/sbin/stop-slave.sh || true; } >/dev/null 2>&1; \
             spark/sbin/stop-master.sh >/dev/null 2>&1 || true",
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
        let url = format!("http://{}:{}", master.ssh_address(), SPARK_MASTER_UI_PORT);
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
        let body = response.text().await.unwrap_or_default();
        match count_alive_workers(&body) {
            Some(alive) if alive >= cluster.slaves.len() => Ok(HealthStatus::Ok),
            Some(alive) => {
                debug!(
                    "services: spark: workers alive={}/{}",
                    alive,
                    cluster.slaves.len()
                );
                Ok(HealthStatus::NotReady)
            }
            None => Ok(HealthStatus::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params() -> ClusterParams {
        ClusterParams {
            cluster_name: "demo".into(),
            master_private: "10.0.0.1".into(),
            master_public: Some("ec2-master.example.com".into()),
            slave_privates: vec!["10.0.0.2".into(), "10.0.0.3".into()],
            ephemeral_mounts: HashMap::new(),
            ssh_user: "ec2-user".into(),
        }
    }

    #[test]
    fn test_render_spark_env_core_values() {
        let options = SparkOptions {
            version: Some("3.2.1".into()),
            executor_instances: 2,
            ..Default::default()
        };
        let mounts = vec!["/media/ephemeral0".to_string(), "/media/ephemeral1".to_string()];
        let env = render_spark_env(&params(), &mounts, 8, &options);
        assert!(env.contains("export SPARK_LOCAL_DIRS=\"/media/ephemeral0,/media/ephemeral1\""));
        assert!(env.contains("export SPARK_MASTER_HOST=\"10.0.0.1\""));
        assert!(env.contains("export SPARK_EXECUTOR_INSTANCES=2"));
        assert!(env.contains("export SPARK_EXECUTOR_CORES=4"));
        assert!(env.contains("export SPARK_WORKER_CORES=8"));
    }

    #[test]
    fn test_render_spark_env_no_mounts_leaves_local_dirs_alone() {
        let env = render_spark_env(&params(), &[], 4, &SparkOptions::default());
        assert!(!env.contains("SPARK_LOCAL_DIRS"));
    }

    #[test]
    fn test_render_spark_env_public_dns_guarded() {
        let env = render_spark_env(&params(), &[], 4, &SparkOptions::default());
        // The export only happens when IMDS answered; otherwise unset.
        assert!(env.contains(r#"if [ -n "$SPARK_PUBLIC_DNS" ]; then"#));
        assert!(env.contains("X-aws-ec2-metadata-token"));
    }

    #[test]
    fn test_render_slaves_order_and_trailing_newline() {
        assert_eq!(render_slaves(&params()), "10.0.0.2\n10.0.0.3\n");
    }

    #[test]
    fn test_default_download_url() {
        let service = SparkService::new(SparkOptions {
            version: Some("3.2.1".into()),
            ..Default::default()
        });
        assert_eq!(
            service.download_url(),
            "https://archive.apache.org/dist/spark/spark-3.2.1/spark-3.2.1-bin-hadoop3.tgz"
        );
    }

    #[test]
    fn test_custom_download_url_template() {
        let service = SparkService::new(SparkOptions {
            version: Some("3.2.1".into()),
            download_url: Some("s3://my-bucket/spark-{v}.tgz".into()),
            ..Default::default()
        });
        assert_eq!(service.download_url(), "s3://my-bucket/spark-3.2.1.tgz");
    }

    #[test]
    fn test_fetch_command_s3_uses_aws_cli() {
        let cmd = fetch_command("s3://bucket/spark.tgz", "/tmp/x.tgz");
        assert!(cmd.starts_with("aws s3 cp"));
        let cmd = fetch_command("https://example.com/spark.tgz", "/tmp/x.tgz");
        assert!(cmd.starts_with("curl"));
    }

    #[test]
    fn test_github_slug() {
        assert_eq!(
            github_slug("https://github.com/apache/spark").as_deref(),
            Some("apache/spark")
        );
        assert_eq!(
            github_slug("https://github.com/apache/spark.git").as_deref(),
            Some("apache/spark")
        );
        assert_eq!(github_slug("apache/spark").as_deref(), Some("apache/spark"));
        assert_eq!(github_slug("https://github.com/apache"), None);
    }

    #[test]
    fn test_count_alive_workers() {
        let body = r#"<li><strong>Alive Workers:</strong> 2</li>"#;
        assert_eq!(count_alive_workers(body), Some(2));
        assert_eq!(count_alive_workers("Alive Workers: 13"), Some(13));
        assert_eq!(count_alive_workers("<html>loading</html>"), None);
    }

    #[test]
    fn test_install_script_has_retry_and_integrity_check() {
        let script = install_tarball_script(
            "https://example.com/spark.tgz",
            "spark",
            "bin/spark-submit",
        );
        assert!(script.contains("gzip -t"));
        assert!(script.contains(r#"if [ "$attempt" -ge 3 ]"#));
        assert!(script.contains("sleep 1"));
    }
}
