use casbridge::cli::{Args, Commands};
use casbridge::config::Settings;
use casbridge::daemon::{self, DaemonState};
use casbridge::error::{BridgeError, Result};
use casbridge::fs::path_context::{PathContext, GLOBUS_TRANSFER_TYPE};
use casbridge::fs::{BridgeFs, Engine};
use casbridge::globus::GlobusClient;
use casbridge::monitor::{ActivityMonitor, GlobusTaskMonitor, TransferRequestMonitor};

use clap::Parser;
use fuser::MountOption;
use sqlx::mysql::MySqlPoolOptions;
use std::future::IntoFuture;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("CASBRIDGE_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    match args.command {
        Commands::Mount {
            mount_path,
            transfer_request_id,
        } => mount_bridge(&mount_path, transfer_request_id).await,
        Commands::Daemon => run_daemon().await,
    }
}

async fn connect(settings: &Settings) -> Result<(Arc<Engine>, Arc<GlobusClient>)> {
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(&settings.dsn)
        .await?;

    let globus = Arc::new(GlobusClient::new(
        &settings.globus_cc_user,
        &settings.globus_cc_token,
    ));
    let engine = Arc::new(Engine::new(settings, pool, globus.clone()));
    Ok((engine, globus))
}

fn mount(engine: Arc<Engine>, mount_path: &Path) -> Result<fuser::BackgroundSession> {
    let fs = BridgeFs::new(engine, tokio::runtime::Handle::current());
    let options = [
        MountOption::FSName("casbridge".to_string()),
        MountOption::DefaultPermissions,
    ];

    fuser::spawn_mount2(fs, mount_path, &options)
        .map_err(|e| BridgeError::Mount(format!("unable to mount {:?}: {}", mount_path, e)))
}

/// A per-transfer bridge process: mounts the virtual tree, then runs until
/// its transfer request is closed or deleted, the mount goes idle past the
/// activity window, or a signal arrives.
async fn mount_bridge(mount_path: &Path, transfer_request_id: i64) -> Result<i32> {
    let settings = Settings::load()?;
    let (engine, _globus) = connect(&settings).await?;

    engine.registry.load_from_database().await?;

    let request = engine
        .transfer_store
        .get_transfer_request(transfer_request_id)
        .await?
        .ok_or_else(|| {
            BridgeError::Config(format!(
                "transfer request {} does not exist",
                transfer_request_id
            ))
        })?;

    let session = mount(engine.clone(), mount_path)?;
    tracing::info!(
        "Mounted transfer request {} at {:?}, use ctrl+c to stop",
        request.id,
        mount_path
    );

    let token = CancellationToken::new();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(
        TransferRequestMonitor::new(engine.transfer_store.clone(), request.id, shutdown_tx)
            .run(token.clone()),
    );
    tokio::spawn(
        ActivityMonitor::new(
            engine.transfer_store.clone(),
            request.clone(),
            engine.activity.clone(),
        )
        .run(token.clone()),
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let request_finished = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("Transfer request {} finished, unmounting", request.id);
            true
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, unmounting {:?}", mount_path);
            false
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, unmounting {:?}", mount_path);
            false
        }
    };

    token.cancel();
    drop(session);

    if request_finished {
        // The sanctioned window ended: revoke the ACL and retire the row.
        let ctx = PathContext::parse(&format!(
            "/{}/{}/{}",
            GLOBUS_TRANSFER_TYPE, request.owner_id, request.project_id
        ));
        engine.registry.cleanup(&ctx).await;
    }

    Ok(0)
}

/// The supervising daemon: closes residual open requests, mounts the shared
/// tree under `{MCFS_DIR}/__transfers`, runs the Globus task monitor, and
/// serves the localhost control plane.
async fn run_daemon() -> Result<i32> {
    let settings = Settings::load()?;
    let (engine, globus) = connect(&settings).await?;

    let residual = engine.transfer_store.close_all_open_requests().await?;
    if residual > 0 {
        tracing::info!("Closed {} residual open transfer requests", residual);
    }
    engine.registry.load_from_database().await?;

    let transfers_root = transfers_root(&settings.mcfs_dir)?;
    let session = mount(engine.clone(), &transfers_root)?;
    tracing::info!("Mounted transfer tree at {:?}", transfers_root);

    let token = CancellationToken::new();
    let state_path = settings.mcfs_dir.join(".globus-task-monitor-state");
    tokio::spawn(
        GlobusTaskMonitor::new(
            globus,
            engine.clone(),
            settings.globus_endpoint_id.clone(),
            settings.settling_period,
            daemon::load_last_processed(&state_path),
            daemon::save_last_processed_fn(state_path),
        )
        .run(token.clone()),
    );

    let state = Arc::new(DaemonState::new(engine.transfer_store.clone()));
    let listener = tokio::net::TcpListener::bind(&settings.daemon_addr).await?;
    tracing::info!("casbridge daemon listening on {}", settings.daemon_addr);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        served = axum::serve(listener, daemon::router(state)).into_future() => {
            served.map_err(BridgeError::Io)?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down daemon");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down daemon");
        }
    }

    token.cancel();
    drop(session);
    Ok(0)
}

fn transfers_root(mcfs_dir: &Path) -> Result<PathBuf> {
    let root = mcfs_dir.join("__transfers");
    std::fs::create_dir_all(&root)?;
    std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o777))?;
    Ok(root)
}
