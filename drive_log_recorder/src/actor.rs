use std::{sync::Arc, time::Duration};

use drive_log_lib::trip_session::TripSession;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    RecorderError, RecordingStatus, RecoveryChoice, TripRecorder, clock::Clock, store::PersistedSession,
};

const COMMAND_CAPACITY: usize = 16;

type Reply<T> = oneshot::Sender<Result<T, RecorderError>>;

pub enum RecorderCommand {
    Start { choice: RecoveryChoice, reply: Reply<RecordingStatus> },
    Stop { reply: Reply<TripSession> },
    RetrySync { reply: Reply<TripSession> },
    DiscardPending { reply: Reply<bool> },
    PendingRecovery { reply: Reply<Option<PersistedSession>> },
    LastTrip { reply: Reply<Option<TripSession>> },
    Shutdown,
}

/// Runs a `TripRecorder` on its own task. Commands, position events and the
/// refresh tick are handled one at a time, in arrival order.
pub struct RecorderService;

impl RecorderService {
    pub fn spawn(
        recorder: TripRecorder,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
    ) -> (RecorderHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(recorder.status(clock.now()));

        let task = tokio::spawn(run(recorder, commands_rx, status_tx, clock, refresh_interval));

        (
            RecorderHandle {
                commands: commands_tx,
                status: status_rx,
            },
            task,
        )
    }
}

async fn run(
    mut recorder: TripRecorder,
    mut commands: mpsc::Receiver<RecorderCommand>,
    status: watch::Sender<RecordingStatus>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // Delivered samples go before any command, so a stop sees them all.
        tokio::select! {
            biased;
            event = recorder.next_position_event() => {
                if let Err(err) = recorder.handle_position_event(event).await {
                    warn!("Recording ended: {err}");
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All recorder handles dropped");
                    break;
                };
                if !handle_command(&mut recorder, command).await {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        status.send_replace(recorder.status(clock.now()));
    }

    recorder.suspend().await;
    status.send_replace(recorder.status(clock.now()));
    info!("Recorder service stopped");
}

/// Returns false when the service should shut down.
async fn handle_command(recorder: &mut TripRecorder, command: RecorderCommand) -> bool {
    match command {
        RecorderCommand::Start { choice, reply } => {
            let _ = reply.send(recorder.start(choice).await);
        }
        RecorderCommand::Stop { reply } => {
            let _ = reply.send(recorder.stop().await);
        }
        RecorderCommand::RetrySync { reply } => {
            let _ = reply.send(recorder.retry_sync().await);
        }
        RecorderCommand::DiscardPending { reply } => {
            let _ = reply.send(recorder.discard_pending().await);
        }
        RecorderCommand::PendingRecovery { reply } => {
            let _ = reply.send(recorder.pending_recovery().await);
        }
        RecorderCommand::LastTrip { reply } => {
            let _ = reply.send(recorder.last_trip().await);
        }
        RecorderCommand::Shutdown => return false,
    }

    true
}

/// Cheap to clone. Every call waits for the service to answer.
#[derive(Clone)]
pub struct RecorderHandle {
    commands: mpsc::Sender<RecorderCommand>,
    status: watch::Receiver<RecordingStatus>,
}

impl RecorderHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> RecorderCommand) -> Result<T, RecorderError> {
        let (reply, answer) = oneshot::channel();

        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RecorderError::Precondition("the recorder service has stopped".into()))?;

        answer
            .await
            .map_err(|_| RecorderError::Precondition("the recorder service has stopped".into()))?
    }

    pub async fn start(&self, choice: RecoveryChoice) -> Result<RecordingStatus, RecorderError> {
        self.request(|reply| RecorderCommand::Start { choice, reply }).await
    }

    pub async fn stop(&self) -> Result<TripSession, RecorderError> {
        self.request(|reply| RecorderCommand::Stop { reply }).await
    }

    pub async fn retry_sync(&self) -> Result<TripSession, RecorderError> {
        self.request(|reply| RecorderCommand::RetrySync { reply }).await
    }

    pub async fn discard_pending(&self) -> Result<bool, RecorderError> {
        self.request(|reply| RecorderCommand::DiscardPending { reply }).await
    }

    pub async fn pending_recovery(&self) -> Result<Option<PersistedSession>, RecorderError> {
        self.request(|reply| RecorderCommand::PendingRecovery { reply }).await
    }

    pub async fn last_trip(&self) -> Result<Option<TripSession>, RecorderError> {
        self.request(|reply| RecorderCommand::LastTrip { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(RecorderCommand::Shutdown).await;
    }

    pub fn status(&self) -> RecordingStatus {
        self.status.borrow().clone()
    }

    /// Status updates, published after every handled event and tick.
    pub fn watch_status(&self) -> watch::Receiver<RecordingStatus> {
        self.status.clone()
    }
}
