use std::{fs::OpenOptions, future::Future, path::PathBuf, pin::Pin, sync::Arc};

use anyhow::{Context, bail};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use drive_log_lib::{SessionError, gps_point::Coords, trip_session::TripSession};
use drive_log_recorder::{
    RecorderError, RecorderState, RecordingStatus, RecoveryChoice, TripRecorder,
    actor::RecorderService,
    clock::{Clock, SystemClock},
    config::RecorderConfig,
    gpx_util,
    position::{ChannelPositionSource, GpxReplaySource, PositionSample, PositionSource},
    store::{FileStore, PersistedSession, SessionPhase},
    sync::{HttpSyncClient, SessionSync},
    wake_lock::WakeLockManager,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "drive_log")]
#[command(about = "Records car trips and syncs them with the drive log server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a trip until Ctrl-C. Positions are read from stdin as `lat,lng`
    /// or `lat,lng,accuracy_m` lines unless a GPX track is given
    Record {
        /// Replay this GPX track instead of reading stdin
        #[arg(long)]
        gpx: Option<PathBuf>,
        /// Replay speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        /// Continue the unfinished trip, if there is one
        #[arg(long, conflicts_with = "discard")]
        resume: bool,
        /// Throw away the unfinished trip, if there is one
        #[arg(long)]
        discard: bool,
    },
    /// Send the stopped but unsynced trip to the server again
    RetrySync,
    /// Throw away the unfinished or unsynced trip
    Discard,
    /// Total distance driven and the last trip
    Summary,
    /// List the sessions stored on the server
    List,
    /// Print a stored session as JSON
    Show { session_id: i64 },
    /// Delete a stored session
    Delete { session_id: i64 },
    /// Write the trace of a stored session to a GPX file
    ExportGpx { session_id: i64, path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RecorderConfig::load()?;

    std::fs::create_dir_all(config.log_dir())?;
    let log_file = config.log_dir().join("drive_log.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open {log_file:?}"))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,drive_log_recorder=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
        .init();

    let sync = Arc::new(HttpSyncClient::new(&config.server_url, config.sync.request_timeout())?);

    match cli.command {
        Commands::Record {
            gpx,
            speed,
            resume,
            discard,
        } => record(&config, sync, gpx, speed, resume, discard).await?,
        Commands::RetrySync => {
            let mut recorder = build_recorder(&config, Arc::new(ChannelPositionSource::new()), sync).await?;
            let stored = recorder.retry_sync().await?;
            println!("Synced trip {}", describe_trip(&stored));
        }
        Commands::Discard => {
            let mut recorder = build_recorder(&config, Arc::new(ChannelPositionSource::new()), sync).await?;
            if recorder.discard_pending().await? {
                println!("Discarded the unsynced trip");
            } else {
                println!("Nothing to discard");
            }
        }
        Commands::Summary => {
            let recorder = build_recorder(&config, Arc::new(ChannelPositionSource::new()), sync.clone()).await?;
            match sync.total_distance().await {
                Ok(total) => {
                    let progress = if config.progress_target_km > 0.0 {
                        (total / config.progress_target_km * 100.0).min(100.0)
                    } else {
                        100.0
                    };
                    println!(
                        "Driven {total:.0} of {:.0} km ({progress:.0}%)",
                        config.progress_target_km
                    );
                }
                Err(err) => println!("Total distance unavailable: {err}"),
            }
            match recorder.last_trip().await? {
                Some(trip) => println!("Last trip: {}", describe_trip(&trip)),
                None => println!("No trips recorded yet"),
            }
            if let Some(pending) = recorder.pending_recovery().await? {
                println!("{}", describe_pending(&pending));
            }
        }
        Commands::List => {
            for session in sync.all_sessions().await? {
                println!(
                    "{}\t{}\t{}\t{} km",
                    session.id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    session
                        .start_time
                        .map(|start| start.format("%d/%m/%Y %H:%M").to_string())
                        .unwrap_or_else(|| "-".into()),
                    session.duration().map(format_elapsed).unwrap_or_else(|| "-".into()),
                    session.travel_distance_km.unwrap_or_default()
                );
            }
        }
        Commands::Show { session_id } => {
            let session = sync.get_session(session_id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Delete { session_id } => {
            sync.delete_session(session_id).await?;
            println!("Deleted session {session_id}");
        }
        Commands::ExportGpx { session_id, path } => {
            let session = sync.get_session(session_id).await?;
            gpx_util::export_session(&session, &path)?;
            println!("Wrote {} points to {path:?}", session.gps_points().len());
        }
    }

    Ok(())
}

async fn build_recorder(
    config: &RecorderConfig,
    source: Arc<dyn PositionSource>,
    sync: Arc<dyn SessionSync>,
) -> Result<TripRecorder, RecorderError> {
    let store = Arc::new(FileStore::open(&config.data_dir).await?);

    Ok(TripRecorder::new(
        source,
        store,
        sync,
        WakeLockManager::from_config(&config.wake_lock),
        Arc::new(SystemClock),
        config,
    ))
}

async fn record(
    config: &RecorderConfig,
    sync: Arc<HttpSyncClient>,
    gpx: Option<PathBuf>,
    speed: f64,
    resume: bool,
    discard: bool,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (source, finished): (Arc<dyn PositionSource>, Pin<Box<dyn Future<Output = ()> + Send>>) = match gpx {
        Some(path) => {
            let replay = Arc::new(GpxReplaySource::from_file(&path, speed, clock.clone())?);
            if replay.is_empty() {
                bail!("{path:?} has no timed track points");
            }
            println!("Replaying {} points from {path:?}", replay.len());
            let waiter = replay.clone();
            (replay, Box::pin(async move { waiter.wait_finished().await }))
        }
        None => {
            let channel = ChannelPositionSource::new();
            let reader = tokio::spawn(read_stdin(channel.clone(), clock.clone()));
            (Arc::new(channel), Box::pin(async move {
                let _ = reader.await;
            }))
        }
    };

    let recorder = build_recorder(config, source, sync).await?;
    let (handle, task) = RecorderService::spawn(recorder, clock, config.refresh_interval());

    if let Some(pending) = handle.pending_recovery().await? {
        if !resume && !discard {
            println!("{}", describe_pending(&pending));
            handle.shutdown().await;
            let _ = task.await;
            bail!("Run again with --resume or --discard");
        }
    }

    let choice = if discard { RecoveryChoice::Discard } else { RecoveryChoice::Resume };
    let status = handle.start(choice).await?;
    if status.recovered {
        println!("Resumed trip with {} points, Ctrl-C to stop", status.points);
    } else {
        println!("Recording, Ctrl-C to stop");
    }

    let mut updates = handle.watch_status();
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        _ = finished => None,
        status = async {
            loop {
                if updates.changed().await.is_err() {
                    break None;
                }
                let status = updates.borrow_and_update().clone();
                if status.state == RecorderState::Idle {
                    break status.interruption;
                }
                print_progress(&status);
            }
        } => status,
    };

    if let Some(reason) = interrupted {
        handle.shutdown().await;
        let _ = task.await;
        bail!("Recording interrupted: {reason}. Run `drive_log record --resume` to continue");
    }

    println!();
    let result = handle.stop().await;
    handle.shutdown().await;
    let _ = task.await;

    match result {
        Ok(stored) => {
            println!("Synced trip {}", describe_trip(&stored));
            Ok(())
        }
        Err(RecorderError::Sync(err)) => {
            bail!("{err}. The trip is kept locally, run `drive_log retry-sync` to send it again")
        }
        Err(err) => Err(err.into()),
    }
}

/// Reads `lat,lng` or `lat,lng,accuracy_m`.
fn parse_sample(line: &str, now: DateTime<Utc>) -> Result<PositionSample, String> {
    let (coords, accuracy) = match line.trim().rsplit_once(',') {
        Some((head, tail)) if head.contains(',') => (head, Some(tail)),
        _ => (line.trim(), None),
    };

    let coords: Coords = coords.parse().map_err(|err: SessionError| err.to_string())?;
    let sample = PositionSample::new(coords.lat, coords.lng, now);

    match accuracy {
        Some(raw) => raw
            .trim()
            .parse()
            .map(|accuracy_m| sample.with_accuracy(accuracy_m))
            .map_err(|_| format!("Invalid accuracy: {raw:?}")),
        None => Ok(sample),
    }
}

/// Feeds position lines from stdin into the source until stdin closes.
async fn read_stdin(source: ChannelPositionSource, clock: Arc<dyn Clock>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match parse_sample(&line, clock.now()) {
                Ok(sample) => {
                    if !source.push_sample(sample).await {
                        tracing::debug!("No active recording, dropped {line:?}");
                    }
                }
                Err(err) => tracing::warn!("Ignoring input line: {err}"),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::error!("Failed to read stdin: {err}");
                break;
            }
        }
    }

    tracing::info!("Position input closed");
}

fn print_progress(status: &RecordingStatus) {
    eprint!(
        "\r{}  {:.2} km  {} points",
        format_elapsed(status.elapsed),
        status.distance_km,
        status.points
    );
}

fn format_elapsed(elapsed: TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn describe_trip(trip: &TripSession) -> String {
    format!(
        "{} from {} ({}, {} km, {} points)",
        trip.id.map(|id| format!("#{id}")).unwrap_or_else(|| "(unsynced)".into()),
        trip.start_time
            .map(|start| start.format("%d/%m/%Y %H:%M").to_string())
            .unwrap_or_else(|| "-".into()),
        trip.duration().map(format_elapsed).unwrap_or_else(|| "-".into()),
        trip.travel_distance_km.unwrap_or_default(),
        trip.gps_points().len()
    )
}

fn describe_pending(pending: &PersistedSession) -> String {
    let what = match pending.phase {
        SessionPhase::AwaitingSync => "A stopped trip has not reached the server",
        _ => "A trip was interrupted while recording",
    };
    format!("{what}: {}", describe_trip(&pending.session))
}
