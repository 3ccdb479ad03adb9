use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use grading::config::{DataBackend, GraderConfig};
use grading::languages::Languages;
use grading::redis_manager::{self, RedisManager};
use grading::rpc::{self, RpcState};
use grading::sandbox::{self, IsolateFactory};
use grading::store::{ArtifactStore, DataStore, FsDataStore, MemoryStore, S3DataStore};
use grading::{logging, BoxManager, Grader, GraderDeps};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = GraderConfig::from_env()?;
    let _log_guard = logging::init(&config.log_dir)?;

    info!("Starting grader...");

    // Language registry
    let mut languages = match &config.languages_path {
        Some(path) => {
            let langs = Languages::load(path)?;
            info!("Loaded language configurations from {:?}", path);
            langs
        }
        None => Languages::embedded()?,
    };
    let disabled = languages.disable_unavailable();
    if !disabled.is_empty() {
        warn!("Disabled languages with missing toolchains: {}", disabled.join(", "));
    }
    info!("Enabled languages: {}", languages.enabled().join(", "));
    let languages = Arc::new(languages);

    // Isolate must work before anything reports ready
    sandbox::ensure_isolate_available(&config.isolate_path, config.box_id_base)
        .await
        .context("isolate is not usable")?;
    info!(
        "Confirmed isolate is available ({})",
        sandbox::isolate_version(&config.isolate_path).await
    );

    let data: Arc<dyn DataStore> = match config.data_backend {
        DataBackend::Fs => {
            let store = FsDataStore::new(&config.data_dir).await?;
            info!("Using filesystem data store at {:?}", config.data_dir);
            Arc::new(store)
        }
        DataBackend::S3 => {
            let store = S3DataStore::from_env().await?;
            info!("Connected to MinIO storage");
            Arc::new(store)
        }
    };

    let artifacts = ArtifactStore::new(&config.compile_dir).await?;
    let factory = Arc::new(IsolateFactory::new(
        config.isolate_path.clone(),
        config.memory_quota_kb,
    ));
    let boxes = BoxManager::new(factory, artifacts, config.concurrency, config.box_id_base);
    info!(
        "Box manager ready: concurrency={}, box ids from {}",
        config.concurrency, config.box_id_base
    );

    let submissions = Arc::new(MemoryStore::new());
    let grader = Grader::new(
        &config,
        GraderDeps {
            submissions: submissions.clone(),
            data: data.clone(),
            languages: languages.clone(),
            boxes,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(false));

    let rpc_handle = config.rpc_addr.clone().map(|addr| {
        let state = RpcState {
            boxes: grader.boxes().clone(),
            data: data.clone(),
            languages: languages.clone(),
            submissions: submissions.clone(),
            waker: grader.waker(),
            ready: ready.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(&addr, state, shutdown).await {
                error!("Evaluator RPC failed: {:#}", e);
            }
        })
    });

    let mut redis_tasks = Vec::new();
    if let Some(url) = &config.redis_url {
        let listener = RedisManager::connect(url).await?;
        let publisher = RedisManager::connect(url).await?;
        redis_tasks.push(redis_manager::spawn_wake_listener(
            listener,
            grader.waker(),
            shutdown_rx.clone(),
        ));
        redis_tasks.push(redis_manager::spawn_result_publisher(
            publisher,
            grader.subscribe(),
        ));
    }

    ready.store(true, Ordering::Release);
    info!("Grader ready");

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, cancelling in-flight submissions..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    grader.run(shutdown_rx).await?;

    // Dropping the grader closes the finished-event channel, which stops
    // the publisher after it flushed everything
    drop(grader);
    for handle in redis_tasks {
        let _ = handle.await;
    }
    if let Some(handle) = rpc_handle {
        let _ = handle.await;
    }

    info!("Grader shut down");
    Ok(())
}
