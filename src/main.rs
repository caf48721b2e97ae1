use resource_search::index::builder::{
    JsonDocumentBuilder, MemorySearchBackend, StaticBuilderSupplier,
};
use resource_search::server::service::{SearchService, ServiceConfig};
use resource_search::storage::backend::MemoryBackend;
use resource_search::storage::types::{Kind, ResourceKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--ring-bind <addr:port>] [--seed <addr:port>] [--token <token>] [--workers <n>] [--rebuild-secs <n>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:8080", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:8081 --ring-bind 127.0.0.1:7946 --seed 127.0.0.1:7945",
            args[0]
        );
        std::process::exit(1);
    }

    let mut cfg = ServiceConfig::default();
    let mut bind_addr: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--ring-bind" => {
                cfg.ring.enabled = true;
                cfg.ring.bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                cfg.ring.seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--token" => {
                cfg.auth_token = Some(args[i + 1].clone());
                i += 2;
            }
            "--workers" => {
                cfg.worker_threads = args[i + 1].parse()?;
                i += 2;
            }
            "--rebuild-secs" => {
                cfg.rebuild_interval = Duration::from_secs(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    cfg.bind_addr =
        bind_addr.ok_or_else(|| anyhow::anyhow!("--bind <addr:port> is required"))?;

    let backend = Arc::new(MemoryBackend::new());
    seed_demo_data(&backend);

    let supplier = StaticBuilderSupplier::new();
    supplier.register(
        Kind::new("dashboards.example.io", "dashboards"),
        Arc::new(JsonDocumentBuilder),
    );
    supplier.register(
        Kind::new("folders.example.io", "folders"),
        Arc::new(JsonDocumentBuilder),
    );

    let service = SearchService::new(cfg, backend, MemorySearchBackend::new(), supplier).await?;

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    service.run().await
}

/// A few objects so a fresh instance has something to index and serve.
fn seed_demo_data(backend: &MemoryBackend) {
    let dashboards = [
        ("cpu-usage", "CPU usage by node"),
        ("memory-pressure", "Memory pressure overview"),
        ("request-latency", "Request latency percentiles"),
    ];
    for (name, title) in dashboards {
        backend.write(
            ResourceKey::new("dashboards.example.io", "dashboards", "default", name),
            serde_json::json!({"title": title, "tags": ["demo"]}),
            None,
        );
    }
    backend.write(
        ResourceKey::new("folders.example.io", "folders", "default", "infrastructure"),
        serde_json::json!({"title": "Infrastructure"}),
        Some("provisioning-repo".to_string()),
    );
}
