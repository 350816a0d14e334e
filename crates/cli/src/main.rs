use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use portage_core::events::LogEventSink;
use portage_core::{
    names, CleanupOutcome, CopyStrategy, ExposeType, MoverSession, MoverStatus, OwnerRef, Role,
    SyncOutcome,
};
use portage_mover::Mover;
use portage_store::{KubeStore, ObjectStore, StoreError};

mod provision;
use provision::{PvcVolumes, SaPrincipals, VolumeOptions};

#[derive(Parser, Debug)]
#[command(name = "portagectl", version, about = "Portage transfer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass for a transfer endpoint
    Sync(SessionArgs),
    /// Remove the endpoint's transient objects
    Cleanup(SessionArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Which side of the transfer this endpoint drives
    #[arg(long, value_enum)]
    role: RoleArg,

    /// Name anchoring this transfer's objects and status
    #[arg(long)]
    owner: String,

    /// Mover container image
    #[arg(long, default_value = "quay.io/portage/mover:latest")]
    image: String,

    /// Volume to send from (source) or receive into (destination)
    #[arg(long)]
    volume: Option<String>,

    /// Explicit peer address; suppresses Service publication
    #[arg(long)]
    address: Option<String>,

    /// Transfer port (default 8000)
    #[arg(long)]
    port: Option<i32>,

    /// Service type used to publish the endpoint
    #[arg(long = "service-type", value_enum)]
    service_type: Option<ServiceTypeArg>,

    /// Annotation for the published Service, as key=value (repeatable)
    #[arg(long = "service-annotation")]
    service_annotations: Vec<String>,

    /// Existing pre-shared-key secret; generated when omitted
    #[arg(long = "key-secret")]
    key_secret: Option<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    privileged: bool,

    #[arg(long, action = ArgAction::SetTrue)]
    paused: bool,

    /// Copy directly from the live volume instead of via snapshot
    #[arg(long, action = ArgAction::SetTrue)]
    direct: bool,

    /// Delete the working volume once the image has been preserved
    #[arg(long = "cleanup-temp", action = ArgAction::SetTrue)]
    cleanup_temp: bool,

    /// Service account the mover job runs as
    #[arg(long = "service-account", default_value = "portage-mover")]
    service_account: String,

    /// Working volume capacity when one must be provisioned
    #[arg(long, default_value = "1Gi")]
    capacity: String,

    #[arg(long = "storage-class")]
    storage_class: Option<String>,

    #[arg(long = "snapshot-class")]
    snapshot_class: Option<String>,

    /// Extra diagnostics inside the mover pod
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum RoleArg {
    Source,
    Destination,
}

impl From<RoleArg> for Role {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Source => Role::Source,
            RoleArg::Destination => Role::Destination,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ServiceTypeArg {
    ClusterIp,
    LoadBalancer,
    ExternalName,
}

impl From<ServiceTypeArg> for ExposeType {
    fn from(s: ServiceTypeArg) -> Self {
        match s {
            ServiceTypeArg::ClusterIp => ExposeType::ClusterIp,
            ServiceTypeArg::LoadBalancer => ExposeType::LoadBalancer,
            ServiceTypeArg::ExternalName => ExposeType::ExternalName,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("PORTAGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PORTAGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PORTAGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_annotation(kv: &str) -> Option<(String, String)> {
    kv.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
}

/// The status is persisted between invocations in the owner anchor's
/// data, under this key.
const STATUS_KEY: &str = "status";

/// Owner anchor: a ConfigMap whose uid scopes this transfer's objects
/// and whose data carries the status across invocations.
async fn anchor_owner(
    store: &KubeStore,
    namespace: &str,
    owner: &str,
) -> Result<(OwnerRef, MoverStatus)> {
    let name = names::clamp(&format!("portage-owner-{owner}"));
    let cm = match store.get::<ConfigMap>(namespace, &name).await? {
        Some(cm) => cm,
        None => {
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match store.create(&cm).await {
                Ok(created) => created,
                Err(StoreError::AlreadyExists { .. }) => store
                    .get::<ConfigMap>(namespace, &name)
                    .await?
                    .context("owner anchor disappeared after create race")?,
                Err(e) => return Err(e.into()),
            }
        }
    };
    let uid = cm
        .metadata
        .uid
        .clone()
        .context("owner anchor has no uid")?;
    let status = cm
        .data
        .as_ref()
        .and_then(|d| d.get(STATUS_KEY))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    Ok((
        OwnerRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name,
            namespace: namespace.to_string(),
            uid,
        },
        status,
    ))
}

async fn save_status(store: &KubeStore, owner: &OwnerRef, status: &MoverStatus) -> Result<()> {
    let Some(mut cm) = store
        .get::<ConfigMap>(&owner.namespace, &owner.name)
        .await?
    else {
        return Ok(());
    };
    cm.data
        .get_or_insert_with(Default::default)
        .insert(STATUS_KEY.to_string(), serde_json::to_string(status)?);
    store.update(&cm).await?;
    Ok(())
}

fn build_session(args: &SessionArgs, owner: OwnerRef, prior_status: MoverStatus) -> MoverSession {
    MoverSession {
        role: args.role.into(),
        owner,
        image: args.image.clone(),
        key_secret: args.key_secret.clone(),
        address: args.address.clone(),
        port: args.port,
        service_type: args.service_type.map(Into::into),
        service_annotations: args
            .service_annotations
            .iter()
            .filter_map(|kv| parse_annotation(kv))
            .collect::<BTreeMap<_, _>>(),
        paused: args.paused,
        privileged: args.privileged,
        main_volume: args.volume.clone(),
        cleanup_temp_volume: args.cleanup_temp,
        copy_strategy: if args.direct {
            CopyStrategy::Direct
        } else {
            CopyStrategy::Snapshot
        },
        config: portage_core::MoverConfig {
            debug: args.debug,
            ..Default::default()
        },
        prior_status,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let store = KubeStore::try_default()
        .await
        .context("connecting to the cluster")?;

    match cli.command {
        Commands::Sync(args) => {
            let (owner, prior) = anchor_owner(&store, &cli.namespace, &args.owner).await?;
            info!(owner = %args.owner, role = ?args.role, "sync invoked");
            let session = build_session(&args, owner.clone(), prior);
            let volumes = PvcVolumes::new(
                &store,
                owner.clone(),
                VolumeOptions {
                    capacity: args.capacity.clone(),
                    storage_class: args.storage_class.clone(),
                    snapshot_class: args.snapshot_class.clone(),
                    copy_strategy: session.copy_strategy,
                },
            );
            let principals = SaPrincipals::new(&store, owner.clone(), args.service_account.clone());
            let events = LogEventSink;

            let mut mover = Mover::new(&store, &volumes, &principals, &events, &session);
            let outcome = mover.synchronize().await?;
            let status = mover.into_status();
            save_status(&store, &owner, &status).await?;

            match cli.output {
                Output::Human => {
                    match &outcome {
                        SyncOutcome::InProgress => println!("in progress"),
                        SyncOutcome::Complete { image: None } => println!("complete"),
                        SyncOutcome::Complete { image: Some(img) } => {
                            println!("complete • image {}/{}", img.kind, img.name)
                        }
                    }
                    if let Some(addr) = &status.address {
                        println!("address: {addr}");
                    }
                    if let Some(key) = &status.key_secret {
                        println!("key secret: {key}");
                    }
                    if let Some(logs) = &status.logs {
                        println!("--\n{logs}");
                    }
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "outcome": outcome,
                        "status": status,
                    }))?
                ),
            }
        }
        Commands::Cleanup(args) => {
            let (owner, prior) = anchor_owner(&store, &cli.namespace, &args.owner).await?;
            info!(owner = %args.owner, role = ?args.role, "cleanup invoked");
            let session = build_session(&args, owner.clone(), prior);
            let volumes = PvcVolumes::new(
                &store,
                owner.clone(),
                VolumeOptions {
                    capacity: args.capacity.clone(),
                    storage_class: args.storage_class.clone(),
                    snapshot_class: args.snapshot_class.clone(),
                    copy_strategy: session.copy_strategy,
                },
            );
            let principals = SaPrincipals::new(&store, owner.clone(), args.service_account.clone());
            let events = LogEventSink;

            let mut mover = Mover::new(&store, &volumes, &principals, &events, &session);
            let outcome = mover.cleanup().await?;
            let status = mover.into_status();
            save_status(&store, &owner, &status).await?;

            match cli.output {
                Output::Human => match outcome {
                    CleanupOutcome::Complete => println!("cleaned up"),
                    CleanupOutcome::InProgress => println!("cleanup in progress"),
                },
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "outcome": outcome }))?
                ),
            }
        }
    }

    Ok(())
}
