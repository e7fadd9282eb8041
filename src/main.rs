use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use k8s_openapi::serde_json;
use navicache::k8s::cache::{WatchCallback, WatchEvent};
use navicache::k8s::kube_client::KubeClusterClient;
use navicache::k8s::utils::parse_label_pairs;
use navicache::{CacheConfig, CacheManager, SearchFilters};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List namespaces
    Namespaces,
    /// List resources of one type
    List {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Resource type: plural, kind or short name
        #[arg(short = 't', long = "type", default_value = "pods")]
        resource_type: String,
    },
    /// Search names, labels and annotations
    Search {
        query: String,
        #[arg(short, long)]
        namespace: Vec<String>,
        #[arg(short = 't', long = "type")]
        resource_type: Vec<String>,
        /// Label filter as key=value
        #[arg(short, long)]
        label: Vec<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Print change events for one type
    Watch {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        #[arg(short = 't', long = "type", default_value = "pods")]
        resource_type: String,
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Load every namespace's workloads and print cache statistics as JSON
    Stats,
}

fn print_resource(r: &navicache::k8s::resource::Resource) {
    println!(
        "{:<20} {:<12} {:<48} {:<12} {}",
        r.namespace(),
        r.kind,
        r.name(),
        r.phase(),
        r.age()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("navicache=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let client = Arc::new(
        KubeClusterClient::try_default()
            .await
            .context("connecting to the cluster")?,
    );
    let manager = CacheManager::new(client, CacheConfig::from_env())?;

    match args.command {
        Command::Namespaces => {
            for ns in manager.get_namespaces().await?.iter() {
                println!("{:<32} {:<12} {}", ns.name, ns.status, ns.age());
            }
        }
        Command::List {
            namespace,
            resource_type,
        } => {
            for r in manager.get_resources_by_type(&namespace, &resource_type).await?.iter() {
                print_resource(r);
            }
        }
        Command::Search {
            query,
            namespace,
            resource_type,
            label,
            status,
        } => {
            let Some(labels) = parse_label_pairs(&label) else {
                bail!("labels must be given as key=value");
            };
            let filters = SearchFilters {
                namespaces: namespace,
                resource_types: resource_type,
                labels,
                status,
            };
            for r in &manager.search_resources(&query, &filters).await? {
                print_resource(r);
            }
        }
        Command::Watch {
            namespace,
            resource_type,
            seconds,
        } => {
            let callback: WatchCallback = Arc::new(|event: WatchEvent| {
                println!(
                    "{} {:<9} {}/{} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.event_type,
                    event.resource.namespace(),
                    event.resource.name(),
                    event.resource.phase()
                );
            });
            manager
                .watch_resources(&namespace, &resource_type, callback)
                .await?;

            match seconds {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => tokio::signal::ctrl_c().await?,
            }
            if let Some(stats) = manager.watch_stats() {
                eprintln!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::Stats => {
            for ns in manager.get_namespaces().await?.iter() {
                if let Err(e) = manager.refresh_namespace(&ns.name).await {
                    warn!("⚠️  Could not refresh {}: {}", ns.name, e);
                }
            }
            println!("{}", serde_json::to_string_pretty(&manager.get_cache_stats().await)?);
        }
    }

    manager.close().await;
    Ok(())
}
