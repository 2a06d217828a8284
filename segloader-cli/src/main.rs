use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use segloader::{
    LoaderConfig, LoaderDeps, LoaderEvent, LoaderKind, MediaBuffer, Playlist, ReqwestTransport,
    SegmentLoader, SourceUpdater, SyncController, TimelineChangeController, TransportConfig,
    create_client,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

mod cli;
mod clock;
mod error;
mod headers;
mod output;
mod playlist;
mod probe;

use cli::CliArgs;
use clock::SimulatedPlayback;
use error::AppError;
use output::FileMediaBuffer;
use probe::TsProbe;

const RETRY_DELAY: Duration = Duration::from_secs(1);

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    if args.speed.is_nan() || args.speed <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "Playback speed must be positive, got {}",
            args.speed
        )));
    }
    if args.goal_buffer.is_nan() || args.goal_buffer <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "Goal buffer must be positive, got {}",
            args.goal_buffer
        )));
    }
    let url = Url::parse(&args.url)
        .map_err(|e| AppError::InvalidInput(format!("Invalid playlist URL {}: {e}", args.url)))?;

    info!(
        "HTTP timeout configuration: overall={}s, connect={}s",
        args.timeout, args.connect_timeout
    );
    let transport_config = TransportConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_headers(headers::parse_headers(&args.headers))
        .build();
    let client = create_client(&transport_config)?;

    let initial = playlist::fetch_media_playlist(&client, &url).await?;
    info!(
        uri = %url,
        segments = initial.segments.len(),
        target_duration = initial.target_duration,
        live = !initial.end_list,
        "Loaded media playlist"
    );

    let output = Arc::new(FileMediaBuffer::create(&args.output).await?);
    let buffer: Arc<dyn MediaBuffer> = output.clone();
    let playback = Arc::new(SimulatedPlayback::new(buffer.clone()));
    playback.set_playlist(&initial);

    let deps = LoaderDeps {
        transport: Arc::new(ReqwestTransport::with_client(client.clone())),
        transmuxer: Arc::new(TsProbe),
        sync: Arc::new(SyncController::new()),
        playback: playback.clone(),
        // One file backs both slots; the probe routes muxed bytes to one of them.
        source_updater: Arc::new(SourceUpdater::new(Some(buffer.clone()), Some(buffer))),
        timelines: Arc::new(TimelineChangeController::new()),
    };
    let config = LoaderConfig::builder()
        .with_goal_buffer_length(args.goal_buffer)
        .with_request_timeout(Duration::from_secs(args.timeout))
        .build();

    let loader = SegmentLoader::new(LoaderKind::Main, config, deps);
    let mut events = loader.subscribe();
    let clock = playback.spawn(args.speed);
    loader.playlist(initial.clone());
    loader.load();

    let session = Session {
        loader: &loader,
        client: &client,
        url: &url,
        playback: &playback,
        max_retries: args.max_retries,
    };
    let result = session.run(&mut events, &initial).await;

    clock.abort();
    loader.dispose();
    output.finish().await?;
    match serde_json::to_string(&loader.snapshot()) {
        Ok(snapshot) => info!(%snapshot, "Session finished"),
        Err(e) => warn!(error = %e, "Failed to serialize loader snapshot"),
    }
    result
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn next_refresh(playlist: &Playlist) -> Option<Instant> {
    (!playlist.end_list)
        .then(|| Instant::now() + Duration::from_secs_f64(playlist.target_duration.max(1.0)))
}

struct Session<'a> {
    loader: &'a SegmentLoader,
    client: &'a reqwest::Client,
    url: &'a Url,
    playback: &'a SimulatedPlayback,
    max_retries: u32,
}

impl Session<'_> {
    /// Pumps loader events until the stream ends or fails, refreshing live
    /// playlists and resuming after recoverable errors.
    async fn run(
        &self,
        events: &mut broadcast::Receiver<LoaderEvent>,
        initial: &Playlist,
    ) -> Result<(), AppError> {
        let mut refresh_at = next_refresh(initial);
        let mut retry_at: Option<Instant> = None;
        let mut retries = 0u32;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(LoaderEvent::Appended { media_index, part_index, bytes }) => {
                        retries = 0;
                        info!(media_index, ?part_index, bytes, "Segment appended");
                    }
                    Ok(LoaderEvent::Error(err)) => {
                        if err.is_fatal() || retries >= self.max_retries {
                            error!(error = %err, uri = ?err.uri, "Loader failed");
                            return Err(err.into());
                        }
                        retries += 1;
                        warn!(error = %err, attempt = retries, "Loader error, resuming shortly");
                        retry_at = Some(Instant::now() + RETRY_DELAY);
                    }
                    Ok(LoaderEvent::Ended) => {
                        info!("Stream ended");
                        return Ok(());
                    }
                    Ok(LoaderEvent::BandwidthUpdate { bandwidth, round_trip }) => {
                        debug!(bandwidth, ?round_trip, "Bandwidth updated");
                    }
                    Ok(LoaderEvent::TimestampOffset { media_type, offset }) => {
                        debug!(%media_type, offset, "Timestamp offset changed");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped loader events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(AppError::LoaderStopped),
                },
                _ = sleep_until_opt(retry_at) => {
                    retry_at = None;
                    self.loader.load();
                }
                _ = sleep_until_opt(refresh_at) => {
                    match playlist::fetch_media_playlist(self.client, self.url).await {
                        Ok(updated) => {
                            debug!(
                                media_sequence = updated.media_sequence,
                                segments = updated.segments.len(),
                                "Playlist refreshed"
                            );
                            self.playback.set_playlist(&updated);
                            refresh_at = next_refresh(&updated);
                            self.loader.playlist(updated);
                        }
                        Err(e) => {
                            warn!(error = %e, "Playlist refresh failed");
                            refresh_at = next_refresh(initial);
                        }
                    }
                }
            }
        }
    }
}
