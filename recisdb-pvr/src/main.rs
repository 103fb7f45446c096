//! recisdb-pvr: recording daemon.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use recisdb_pvr::config::{Args, Config};
use recisdb_pvr::database::{Database, DatabaseHandle, ProgramSource, RecordedStore};
use recisdb_pvr::encode::{EncodeManager, EncodeProcessPool};
use recisdb_pvr::event::EventBus;
use recisdb_pvr::logging;
use recisdb_pvr::recorder::{spawn_encode_listener, RecordingManager, SessionContext};
use recisdb_pvr::reserve::{ReservationStore, ReserveFile};
use recisdb_pvr::tuner::{MirakurunSource, TunerSource};
use recisdb_pvr::PvrService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config errors are reported before logging exists
    let (config, config_path) = match Config::load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    logging::init_logging(&config.logging)?;
    if let Some(path) = &config_path {
        info!("Loaded config from: {}", path.display());
    }

    info!("Opening database: {:?}", config.database_path);
    let db = match Database::open(&config.database_path) {
        Ok(db) => DatabaseHandle::new(db),
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    let programs: Arc<dyn ProgramSource> = Arc::new(db.clone());
    let recorded: Arc<dyn RecordedStore> = Arc::new(db);

    let events = EventBus::new();
    #[cfg(feature = "webhook")]
    if let Some(section) = &config.webhook {
        info!("Webhook notifications enabled ({})", section.format);
        recisdb_pvr::webhook::WebhookNotifier::new(section).register(&events);
    }
    #[cfg(not(feature = "webhook"))]
    if config.webhook.is_some() {
        log::warn!("Webhook configured but the webhook feature is disabled");
    }

    // A corrupt reservation file is fatal
    let store = match ReservationStore::load(
        ReserveFile::new(config.reserves_path.clone()),
        config.tuners.clone(),
        Arc::clone(&programs),
        Arc::clone(&events),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load reservations: {}", e);
            return Err(e.into());
        }
    };

    let pool = Arc::new(
        EncodeProcessPool::new(config.encode.max_slots)
            .with_preempt_timeout(config.encode.preempt_timeout),
    );
    let encoder = EncodeManager::with_error_grace(
        pool,
        config.encode.modes.clone(),
        config.encode.directory.clone(),
        Arc::clone(&events),
        config.encode.error_grace,
    );

    let source: Arc<dyn TunerSource> = Arc::new(MirakurunSource::new(config.mirakurun_url.clone())?);
    let recorder = RecordingManager::new(SessionContext {
        store: Arc::clone(&store),
        source,
        recorded: Arc::clone(&recorded),
        programs,
        events: Arc::clone(&events),
        encoder: Some(Arc::clone(&encoder)),
        settings: config.recorder.clone(),
    });

    info!("recisdb-pvr starting...");
    info!("  Reservations: {:?} ({} loaded)", config.reserves_path, store.reserves().len());
    info!("  Tuners: {}", config.tuners.len());
    for tuner in &config.tuners {
        info!(
            "    {} {:?}{}",
            tuner.name,
            tuner.types,
            if tuner.exclusive { " (exclusive)" } else { "" }
        );
    }
    info!("  Tuner source: {}", config.mirakurun_url);
    info!("  Recording directory: {:?}", config.recorder.directory);
    info!(
        "  Encode slots: {}, modes: {}",
        config.encode.max_slots,
        config.encode.modes.len()
    );

    let _listener = spawn_encode_listener(&events, recorded);
    let _recorder_tasks = recorder.start();

    let resync_store = Arc::clone(&store);
    let update_interval = config.update_interval;
    let _resync = tokio::spawn(async move {
        resync_store.run_resync_loop(update_interval).await;
    });
    // Held for the lifetime of the daemon; an API layer would wrap it
    let _service = PvrService::new(store, recorder, encoder);

    tokio::signal::ctrl_c().await?;
    info!("recisdb-pvr shutting down");
    Ok(())
}
