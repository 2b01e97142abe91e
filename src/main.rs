use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flintrock::cluster::DescribeDocument;
use flintrock::config::{parse_tags, FlintrockConfig};
use flintrock::error::{FlintrockError, Result};
use flintrock::orchestrator::{LaunchRequest, Orchestrator};
use flintrock::provider::{Ec2Provider, NodeSpec};
use flintrock::services::{
    hdfs::HdfsOptions, spark::SparkOptions, HdfsService, Service, SparkService,
};
use flintrock::ssh::OpenSshConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flintrock", about = "Launch ephemeral Apache Spark clusters on EC2", version)]
struct Cli {
    /// Path to the defaults file
    #[arg(long, global = true, default_value = "flintrock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a new cluster
    Launch(LaunchArgs),
    /// Terminate a cluster and delete its security groups
    Destroy {
        name: String,
        #[arg(long)]
        assume_yes: bool,
    },
    /// Show one cluster, or all flintrock clusters in the region
    Describe {
        name: Option<String>,
        #[arg(long)]
        master_hostname_only: bool,
    },
    /// Open an SSH shell on the cluster master
    Login { name: String },
    /// Start a stopped cluster
    Start { name: String },
    /// Stop a running cluster, retaining disks and security groups
    Stop { name: String },
    /// Grow the cluster by n slaves
    AddSlaves { name: String, n: u32 },
    /// Shrink the cluster by n slaves (lowest instance ids first)
    RemoveSlaves { name: String, n: u32 },
    /// Run a shell command on every node
    RunCommand {
        name: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Copy a local file to the same path on every node
    CopyFile {
        name: String,
        local: PathBuf,
        remote: String,
    },
}

#[derive(Args)]
struct LaunchArgs {
    name: String,

    #[arg(long)]
    num_slaves: Option<u32>,

    // ---- Services ----
    #[arg(long)]
    spark_version: Option<String>,
    #[arg(long)]
    spark_download_url: Option<String>,
    #[arg(long)]
    spark_git_repo: Option<String>,
    /// Commit SHA, or `latest` for the default branch HEAD
    #[arg(long)]
    spark_git_commit: Option<String>,
    #[arg(long)]
    install_hdfs: bool,
    #[arg(long)]
    hdfs_version: Option<String>,
    #[arg(long)]
    hdfs_download_url: Option<String>,
    /// 8 or 11
    #[arg(long)]
    java_version: Option<u8>,
    #[arg(long)]
    executor_instances: Option<u32>,

    // ---- SSH ----
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    identity_file: Option<PathBuf>,

    // ---- Provider ----
    #[arg(long)]
    instance_type: Option<String>,
    #[arg(long)]
    key_name: Option<String>,
    #[arg(long)]
    ami: Option<String>,
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    zone: Option<String>,
    #[arg(long)]
    vpc_id: Option<String>,
    #[arg(long)]
    subnet_id: Option<String>,
    #[arg(long)]
    spot_price: Option<f64>,
    /// Extra instance tag, `key=value`; repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    ebs_root_gb: Option<i32>,
    #[arg(long)]
    instance_profile: Option<String>,
    /// File whose contents become instance user data
    #[arg(long)]
    user_data: Option<PathBuf>,
    /// Extra security group to attach; repeatable
    #[arg(long = "security-group")]
    security_groups: Vec<String>,

    #[arg(long)]
    assume_yes: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = FlintrockConfig::load(&cli.config)?;

    match cli.command {
        Command::Launch(args) => launch(&config, args).await,
        Command::Destroy { name, assume_yes } => {
            let orch = orchestrator(&config, None, None, None, assume_yes).await?;
            if orch.destroy(&name).await? {
                println!("cluster {} destroyed", name);
            } else {
                println!("cluster {} not found", name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Describe {
            name,
            master_hostname_only,
        } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            describe(&orch, name.as_deref(), master_hostname_only).await
        }
        Command::Login { name } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let (target, identity) = orch.login_target(&name).await?;
            login(&target, identity)
        }
        Command::Start { name } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let cluster = orch.start(&name).await?;
            let master = cluster.master()?;
            println!(
                "cluster {} running, master: {}",
                name,
                master.ssh_address()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { name } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            orch.stop(&name).await?;
            println!("cluster {} stopped", name);
            Ok(ExitCode::SUCCESS)
        }
        Command::AddSlaves { name, n } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let outcome = orch.add_slaves(&name, n).await?;
            println!("added {} slaves to cluster {}", outcome.added.len(), name);
            if outcome.failed.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                for (instance, error) in &outcome.failed {
                    eprintln!("slave {} failed: {}", instance, error);
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Command::RemoveSlaves { name, n } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let removed = orch.remove_slaves(&name, n).await?;
            for node in &removed {
                println!("removed {}", node.instance_id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::RunCommand { name, command } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let command = flintrock::ssh::shell_join(&command);
            let outputs = orch.run_command(&name, &command).await?;
            let mut all_ok = true;
            for (node, output) in &outputs {
                println!(
                    "--- {} ({}) exit={}",
                    node.instance_id,
                    node.ssh_address(),
                    output.exit_code
                );
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                all_ok &= output.success();
            }
            Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::CopyFile { name, local, remote } => {
            let orch = orchestrator(&config, None, None, None, true).await?;
            let count = orch.copy_file(&name, &local, &remote).await?;
            println!("copied {} to {} nodes", local.display(), count);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Build an orchestrator over the real EC2 provider and OpenSSH transport.
async fn orchestrator(
    config: &FlintrockConfig,
    region: Option<String>,
    user: Option<String>,
    identity: Option<PathBuf>,
    assume_yes: bool,
) -> Result<Orchestrator> {
    let region = region.or_else(|| config.ec2.region.clone());
    let user = user.unwrap_or_else(|| config.ssh.user.clone());
    let identity = identity.or_else(|| config.ssh.identity_file.clone());
    let provider = Ec2Provider::connect(region, user.clone(), identity.clone()).await?;
    Ok(Orchestrator::new(
        Arc::new(provider),
        Arc::new(OpenSshConnector),
        user,
        identity,
        assume_yes,
    ))
}

async fn launch(config: &FlintrockConfig, args: LaunchArgs) -> Result<ExitCode> {
    let orch = orchestrator(
        config,
        args.region.clone(),
        args.user.clone(),
        args.identity_file.clone(),
        args.assume_yes,
    )
    .await?;

    let services = build_services(config, &args, orch.http()).await?;
    let spec = build_spec(config, &args)?;
    let name = args.name.clone();
    let request = LaunchRequest {
        cluster_name: name.clone(),
        num_slaves: args.num_slaves.unwrap_or(config.launch.num_slaves),
        services,
        spec,
    };

    // A Ctrl-C mid-launch cancels the in-flight work and releases whatever
    // was allocated.
    let cluster = tokio::select! {
        result = orch.launch(request) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted, rolling back launch of {}", name);
            orch.cancel_launch(&name).await;
            return Err(FlintrockError::Network("launch interrupted".to_string()));
        }
    };

    let master = cluster.master()?;
    println!(
        "cluster {} running, master: {}",
        cluster.name,
        master.ssh_address()
    );
    Ok(ExitCode::SUCCESS)
}

async fn build_services(
    config: &FlintrockConfig,
    args: &LaunchArgs,
    http: &reqwest::Client,
) -> Result<Vec<Arc<dyn Service>>> {
    let mut services: Vec<Arc<dyn Service>> = Vec::new();

    // HDFS always precedes Spark.
    if args.install_hdfs || config.launch.install_hdfs {
        services.push(Arc::new(HdfsService::new(HdfsOptions {
            version: args
                .hdfs_version
                .clone()
                .unwrap_or_else(|| config.launch.hdfs.version.clone()),
            download_url: args
                .hdfs_download_url
                .clone()
                .or_else(|| config.launch.hdfs.download_url.clone()),
        })));
    }

    let git_commit = args
        .spark_git_commit
        .clone()
        .or_else(|| config.launch.spark.git_commit.clone());
    let version = if git_commit.is_some() {
        None
    } else {
        Some(
            args.spark_version
                .clone()
                .unwrap_or_else(|| config.launch.spark.version.clone()),
        )
    };
    let mut spark = SparkService::new(SparkOptions {
        version,
        download_url: args
            .spark_download_url
            .clone()
            .or_else(|| config.launch.spark.download_url.clone()),
        git_repo: args
            .spark_git_repo
            .clone()
            .or_else(|| config.launch.spark.git_repo.clone()),
        git_commit,
        executor_instances: args
            .executor_instances
            .unwrap_or(config.launch.spark.executor_instances),
        java_version: args.java_version.unwrap_or(config.launch.java_version),
    });
    spark.resolve_git_commit(http).await?;
    services.push(Arc::new(spark));
    Ok(services)
}

fn build_spec(config: &FlintrockConfig, args: &LaunchArgs) -> Result<NodeSpec> {
    let ami = args
        .ami
        .clone()
        .or_else(|| config.ec2.ami.clone())
        .ok_or_else(|| FlintrockError::Config("--ami is required".to_string()))?;

    let mut tag_entries = config.ec2.tags.clone();
    tag_entries.extend(args.tags.iter().cloned());
    let tags = parse_tags(&tag_entries)?;

    let user_data = match args.user_data.clone().or_else(|| config.ec2.user_data.clone()) {
        Some(path) => Some(
            std::fs::read(&path)
                .with_context(|| format!("cannot read user-data file {}", path.display()))
                .map_err(|e| FlintrockError::Config(format!("{:#}", e)))?,
        ),
        None => None,
    };

    let mut security_groups = config.ec2.security_groups.clone();
    security_groups.extend(args.security_groups.iter().cloned());

    Ok(NodeSpec {
        instance_type: args
            .instance_type
            .clone()
            .unwrap_or_else(|| config.ec2.instance_type.clone()),
        ami,
        key_name: args.key_name.clone().or_else(|| config.ec2.key_name.clone()),
        zone: args.zone.clone().or_else(|| config.ec2.zone.clone()),
        vpc_id: args.vpc_id.clone().or_else(|| config.ec2.vpc_id.clone()),
        subnet_id: args.subnet_id.clone().or_else(|| config.ec2.subnet_id.clone()),
        spot_price: args.spot_price.or(config.ec2.spot_price),
        spot_timeout: Duration::from_secs(config.ec2.spot_timeout_secs),
        ebs_root_gb: args.ebs_root_gb.or(config.ec2.ebs_root_gb),
        instance_profile: args
            .instance_profile
            .clone()
            .or_else(|| config.ec2.instance_profile.clone()),
        user_data,
        extra_security_groups: security_groups,
        tags,
        // Filled by the orchestrator from the selected services.
        services_tag: String::new(),
        client_ports: Vec::new(),
    })
}

async fn describe(
    orch: &Orchestrator,
    name: Option<&str>,
    master_hostname_only: bool,
) -> Result<ExitCode> {
    let clusters = match name {
        Some(name) => match orch.describe_cluster(name).await? {
            Some(cluster) => vec![cluster],
            None => {
                println!("cluster {} not found", name);
                return Ok(ExitCode::SUCCESS);
            }
        },
        None => orch.describe_all().await?,
    };

    if master_hostname_only {
        for cluster in &clusters {
            if let Some(master) = cluster.master.as_ref() {
                println!("{}", master.ssh_address());
            }
        }
    } else {
        println!("{}", DescribeDocument::from_clusters(&clusters).render());
    }
    Ok(ExitCode::SUCCESS)
}

/// Replace this process with an SSH shell to the master.
fn login(target: &str, identity: Option<PathBuf>) -> Result<ExitCode> {
    let mut cmd = std::process::Command::new("ssh");
    if let Some(identity) = identity {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(target);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = cmd.exec();
        Err(FlintrockError::Network(format!("exec ssh failed: {}", err)))
    }
    #[cfg(not(unix))]
    {
        let status = cmd
            .status()
            .map_err(|e| FlintrockError::Network(format!("spawn ssh failed: {}", e)))?;
        Ok(if status.success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}
