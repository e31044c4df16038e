//! framecast: broadcast a video source into an `.fcraw` recording

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use framecast::target::RawFileWriter;
use framecast::broadcast::effective_rate;
use framecast::utils::lock;
use framecast::{BroadcastDaemon, Config, DaemonConfig, VideoSource, VideoTarget};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecast=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("framecast launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    config.publish();

    let source = config.source.open()?;
    let native = source.frame_rate();
    let requested = config.broadcast.frame_rate.unwrap_or(native);
    let frame_rate = effective_rate(requested, native).map_err(|e| {
        eyre!(
            "{}: source reports {} fps, set broadcast.frame_rate to choose a rate",
            e,
            native
        )
    })?;
    let colour = source.colour();
    let (cols, rows) = source.frame_dimensions();
    info!(%colour, cols, rows, native, frame_rate, "Source ready");

    // Record into the configured file
    let writer = Arc::new(Mutex::new(RawFileWriter::new(colour)));
    lock(&writer).initialize(&config.target.path, frame_rate as f32)?;

    let daemon = Arc::new(BroadcastDaemon::with_config(
        source,
        DaemonConfig::from(&config.broadcast),
    ));
    let writer_id = daemon.attach(writer.clone());
    daemon.start(frame_rate)?;

    // Surface consumer failures as they happen
    let failures = daemon.failures();
    let _failure_handle = tokio::spawn(async move {
        while let Ok(failure) = failures.recv_async().await {
            error!(target_id = %failure.target, sequence = failure.sequence, "{}", failure.error);
        }
    });

    let run_for = config.run.duration_secs.map(Duration::from_secs);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
        _ = async {
            match run_for {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        } => {
            info!(secs = ?run_for.map(|d| d.as_secs()), "Run duration reached");
        }
    }

    // Joining the broadcast thread blocks
    let stopping = daemon.clone();
    tokio::task::spawn_blocking(move || {
        stopping.stop();
        stopping.detach(writer_id);
    })
    .await
    .map_err(|e| eyre!("broadcast shutdown failed: {}", e))?;

    let mut writer = lock(&writer);
    if let Err(e) = writer.finalize() {
        warn!("Finalizing recording failed: {}", e);
    }
    info!(
        frames = writer.frames_written(),
        path = ?writer.path(),
        stats = ?daemon.stats(),
        "framecast shutting down"
    );
    Ok(())
}
