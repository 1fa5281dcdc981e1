use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use steward_converge::{
    ready, wait_until, wait_until_not_found, ConvergeConfig, Converger, MergeFn, Predicate, WaitOptions,
};
use steward_core::{ClaimCodec, ClaimMode, ObjectRef};
use steward_kubehub::{describe_registry, KubeStore};
use steward_store::ObjectStore;
use tracing::info;

mod manifest;

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward CLI: converge owned objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced objects that do not set one
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// How owner claims are stored on dependents
    #[arg(long = "claim-mode", global = true, env = "STEWARD_CLAIM_MODE", default_value_t = ClaimMode::Shared)]
    claim_mode: ClaimMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MergeMode {
    /// Only add the owner's claim to existing objects
    ClaimOnly,
    /// Replace the body of existing objects with the manifest
    Overwrite,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served resources (incl. CRDs)
    Discover,
    /// Make the objects owned by OWNER equal the manifests
    Converge {
        /// Owner, e.g. "Account.catalog.steward.io/o1" or "Offering.catalog.steward.io/ns/name"
        #[arg(long = "owner")]
        owner: String,
        /// Dependent types to converge, e.g. "ConfigMap" or "Certificate.cert-manager.io"
        #[arg(long = "type", required = true)]
        types: Vec<String>,
        /// Multi-document YAML file; "-" reads stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long = "merge", value_enum, default_value_t = MergeMode::ClaimOnly)]
        merge: MergeMode,
    },
    /// Drop OWNER's claims, deleting dependents no one else claims
    Release {
        #[arg(long = "owner")]
        owner: String,
        #[arg(long = "type", required = true)]
        types: Vec<String>,
    },
    /// Show the owners claiming an object
    Claims {
        /// GVK key, e.g. "v1/ConfigMap"
        gvk: String,
        name: String,
    },
    /// Block until an object exists (optionally ready) or is gone
    Wait {
        /// GVK key, e.g. "v1/ConfigMap"
        gvk: String,
        name: String,
        /// Also require a ready status
        #[arg(long = "ready", action = ArgAction::SetTrue, conflicts_with = "gone")]
        ready: bool,
        /// Wait for the object to be deleted instead
        #[arg(long = "gone", action = ArgAction::SetTrue)]
        gone: bool,
        /// Hard timeout in seconds (default STEWARD_WAIT_TIMEOUT_SECS)
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_refs(output: Output, refs: &[ObjectRef]) -> Result<()> {
    match output {
        Output::Human => {
            for r in refs {
                println!("{}", r);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(refs)?),
    }
    Ok(())
}

/// Resolve `v1/ConfigMap` + name into a reference, defaulting the namespace for namespaced kinds.
fn target_ref(store: &KubeStore, gvk: &str, name: &str, namespace: &str) -> Result<ObjectRef> {
    let rt = store.registry().lookup_key(gvk)?;
    let ns = rt.namespaced.then_some(namespace);
    Ok(ObjectRef::new(&rt.group_kind(), ns, name))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ConvergeConfig::from_env();
    config.claim_mode = cli.claim_mode;
    let store = KubeStore::try_default().await.context("connecting to the cluster")?;

    match cli.command {
        Commands::Discover => {
            let resources = describe_registry(store.registry());
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Converge { owner, types, file, merge } => {
            let owner = manifest::parse_owner(&owner)?;
            let types = manifest::parse_types(&types)?;
            let text = manifest::read_manifest_file(&file)?;
            let desired = manifest::parse_manifests(&text, store.registry(), &cli.namespace)?;
            info!(owner = %owner, objects = desired.len(), mode = %config.claim_mode, "converge invoked");

            let converger = Converger::new(store, &config);
            converger.register(&types)?;
            let overwrite: Box<MergeFn> = Box::new(manifest::overwrite);
            let merge_fn = match merge {
                MergeMode::Overwrite => Some(&*overwrite),
                MergeMode::ClaimOnly => None,
            };
            let report = converger.converge(&owner, desired, &types, merge_fn).await?;
            match cli.output {
                Output::Human => {
                    for (verb, refs) in [
                        ("created", &report.created),
                        ("updated", &report.updated),
                        ("released", &report.released),
                        ("deleted", &report.deleted),
                    ] {
                        for r in refs {
                            println!("{} {}", verb, r);
                        }
                    }
                    if !report.changed() {
                        println!("unchanged");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Release { owner, types } => {
            let owner = manifest::parse_owner(&owner)?;
            let types = manifest::parse_types(&types)?;
            let converger = Converger::new(store, &config);
            converger.register(&types)?;
            let cleaned_up = converger.release(&owner, &types).await?;
            match cli.output {
                Output::Human if cleaned_up => println!("released"),
                Output::Human => println!("release in progress; dependents still terminating"),
                Output::Json => println!("{}", serde_json::json!({ "cleanedUp": cleaned_up })),
            }
        }
        Commands::Claims { gvk, name } => {
            let target = target_ref(&store, &gvk, &name, &cli.namespace)?;
            let obj = store.get(&target).await?;
            let claims = ClaimCodec::new(config.claim_mode).claims_of(&obj.metadata)?;
            print_refs(cli.output, &claims)?;
        }
        Commands::Wait { gvk, name, ready: want_ready, gone, timeout } => {
            let target = target_ref(&store, &gvk, &name, &cli.namespace)?;
            let mut options: WaitOptions = config.wait;
            if let Some(secs) = timeout {
                options.timeout = Duration::from_secs(secs);
            }
            info!(object = %target, timeout_s = options.timeout.as_secs(), "wait invoked");
            if gone {
                wait_until_not_found(&store, &target, options).await?;
                println!("{} gone", target);
            } else {
                let predicates: Vec<Predicate> = if want_ready { vec![ready()] } else { Vec::new() };
                let obj = wait_until(&store, &target, options, &predicates).await?;
                match cli.output {
                    Output::Human => println!("{} ok (resourceVersion {})", target, obj.metadata.resource_version.unwrap_or_default()),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
                }
            }
        }
    }

    Ok(())
}
