use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One progress tick emitted by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub percent: f32,
    pub message: String,
}

/// Write end of the progress channel handed to an engine for a single run.
///
/// Engines never touch task bookkeeping directly: every tick becomes a
/// [`ProgressEvent`] that the owning worker turns into a store update. The
/// sink also carries the task's cancellation token so long-running engines
/// can stop early.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn channel(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, cancel }, receiver)
    }

    pub fn report(&self, percent: f32, message: impl Into<String>) {
        // the worker drops the receiver once the task is terminal; late ticks go nowhere
        let _ = self.sender.send(ProgressEvent {
            percent,
            message: message.into(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
