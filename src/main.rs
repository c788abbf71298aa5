use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use dotenvy::dotenv;
use http::HeaderValue;
use tokio::time::{Duration, sleep};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use codesync::application::access::AllowAllAccess;
use codesync::application::ports::bucket_access::BucketAccess;
use codesync::application::ports::snapshot_store::SnapshotStore;
use codesync::bootstrap::config::{Config, SnapshotBackend};
use codesync::bootstrap::engine::Engine;
use codesync::infrastructure::access::HttpBucketAccess;
use codesync::infrastructure::snapshot::{FsSnapshotStore, S3SnapshotStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "codesync=debug,axum=info,tower_http=info".into()),
        )
        .init();

    let cfg = Config::from_env()?;
    info!(
        port = cfg.api_port,
        backend = ?cfg.snapshot_backend,
        "starting sync server"
    );

    let snapshots: Arc<dyn SnapshotStore> = match cfg.snapshot_backend {
        SnapshotBackend::Filesystem => Arc::new(FsSnapshotStore::new(&cfg.snapshot_root)),
        SnapshotBackend::S3 => Arc::new(S3SnapshotStore::new(&cfg).await?),
    };

    let access: Arc<dyn BucketAccess> = match &cfg.access_api_url {
        Some(url) => Arc::new(HttpBucketAccess::new(url.clone())),
        None => {
            tracing::warn!("ACCESS_API_URL not set; granting all authenticated users full access");
            Arc::new(AllowAllAccess)
        }
    };

    let engine = Engine::new(cfg.clone(), snapshots, access);

    let cors = match cfg
        .frontend_url
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
            .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
            .allow_credentials(true),
        None => CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
            .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION]),
    };

    let app = Router::new()
        .nest("/api", codesync::presentation::http::health::routes())
        .nest(
            "/api",
            codesync::presentation::http::buckets::routes(engine.clone()),
        )
        .merge(codesync::presentation::ws::routes(engine.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");

    // Periodic flush: the write-behind retry path. Dirty documents whose
    // debounced flush failed get another attempt here until a save lands.
    let flush_engine = engine.clone();
    let flush_interval = Duration::from_secs(cfg.flush_interval_secs);
    tokio::spawn(async move {
        loop {
            sleep(flush_interval).await;
            flush_engine.store().flush_all().await;
        }
    });

    // Eviction sweeper.
    let sweep_engine = engine.clone();
    let sweep_interval = Duration::from_secs(cfg.sweep_interval_secs);
    tokio::spawn(async move {
        loop {
            sleep(sweep_interval).await;
            sweep_engine.store().sweep();
        }
    });

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(?e, "API server failed");
    }

    info!("flushing dirty documents before exit");
    engine.shutdown_flush().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
