//! Streaming sessions: one refinement run per request, delivered as a finite
//! sequence of [`StreamEvent`]s.
//!
//! The run executes on tokio's blocking pool and hands events back through a
//! bounded channel. The latent and optimizer state never leave that worker.

use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::Stream;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

use crate::{
    config::Settings,
    decoder::Decoder,
    encode::FrameEncoder,
    events::StreamEvent,
    latent::random_latent,
    loss::LossComposer,
    models::{AcceptedRequest, GenerationRequest, ValidationError},
    progress::ProgressEmitter,
    refine::{self, ProgressSnapshot, RefinementConfig},
};

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub stream_buffer: usize,
    pub learning_rate: f32,
    pub max_iterations: usize,
    pub max_run_duration: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionOptions {
    fn from(s: &Settings) -> Self {
        Self {
            stream_buffer: s.stream_buffer,
            learning_rate: s.learning_rate,
            max_iterations: s.max_iterations,
            max_run_duration: s.max_run_duration,
        }
    }
}

/// Starts generation sessions against one shared decoder.
#[derive(Clone)]
pub struct Generator {
    decoder: Arc<dyn Decoder>,
    encoder: Arc<dyn FrameEncoder>,
    options: SessionOptions,
}

impl Generator {
    pub fn new(decoder: Arc<dyn Decoder>, encoder: Arc<dyn FrameEncoder>, options: SessionOptions) -> Self {
        Self {
            decoder,
            encoder,
            options,
        }
    }

    /// Validates `request` and launches its refinement run.
    ///
    /// Must be called from within a tokio runtime. Invalid requests are
    /// rejected here and never produce a stream.
    pub fn start(&self, request: GenerationRequest) -> Result<EventStream, ValidationError> {
        let accepted = request.validate(self.options.max_iterations)?;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.options.stream_buffer.max(1));
        let cancel = CancellationToken::new();

        let config = RefinementConfig {
            total_iterations: accepted.total_iterations(),
            show_steps: accepted.show_steps(),
            learning_rate: self.options.learning_rate,
            max_duration: self.options.max_run_duration,
        };
        let worker = Worker {
            id,
            accepted,
            config,
            decoder: Arc::clone(&self.decoder),
            emitter: ProgressEmitter::new(Arc::clone(&self.encoder)),
            encoder: Arc::clone(&self.encoder),
            tx,
            cancel: cancel.clone(),
            runtime: Handle::current(),
        };
        tokio::task::spawn_blocking(move || worker.run());

        Ok(EventStream {
            id,
            rx,
            cancel,
            finished: false,
        })
    }
}

struct Worker {
    id: Uuid,
    accepted: AcceptedRequest,
    config: RefinementConfig,
    decoder: Arc<dyn Decoder>,
    emitter: ProgressEmitter,
    encoder: Arc<dyn FrameEncoder>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl Worker {
    fn run(self) {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();
        let req = &self.accepted;
        info!(
            "🚀 Generating for prompt {:?}: {} iterations, snapshot every {}, seed {}, {} include hint(s), exclude={}, extras={}, guidance {}",
            req.prompt(),
            req.total_iterations(),
            req.show_steps(),
            req.seed(),
            req.include().len(),
            req.exclude_present(),
            req.extras_present(),
            req.guidance_scale()
        );

        let latent = random_latent(self.decoder.latent_shape(), req.seed());
        let composer = LossComposer::new(req.exclude_present(), req.extras_present());
        let outcome = refine::run(
            &latent,
            &self.config,
            &composer,
            self.decoder.as_ref(),
            &self.cancel,
            |snapshot| self.forward(snapshot),
        );

        let terminal = match outcome {
            Ok(best) => {
                info!("✅ Best loss {:.6} at step {}", best.loss, best.step);
                match self.encoder.encode(&best.image) {
                    Ok(image) => StreamEvent::complete(image),
                    Err(e) => {
                        error!("❌ Failed to encode final image: {}", e);
                        StreamEvent::error(format!("Failed to encode final image: {e}"))
                    }
                }
            }
            Err(e) => {
                error!("❌ Generation failed: {}", e);
                StreamEvent::error(format!("Generation failed: {e}"))
            }
        };

        // Blocks only on a full buffer; fails once the consumer is gone.
        if self.tx.blocking_send(terminal).is_err() {
            debug!("consumer left before the terminal event");
        }
    }

    /// Waits for room in the buffer, so a slow consumer slows the run down
    /// instead of losing snapshots. Cancellation or a departed consumer
    /// releases the wait.
    fn forward(&self, snapshot: &ProgressSnapshot) {
        let Some(event) = self.emitter.emit(snapshot.step, snapshot.total, &snapshot.image) else {
            return;
        };
        let delivered = self.runtime.block_on(async {
            tokio::select! {
                sent = self.tx.send(StreamEvent::Progress(event)) => sent.is_ok(),
                _ = self.cancel.cancelled() => false,
            }
        });
        if delivered {
            debug!(step = snapshot.step, "snapshot queued");
        } else if !self.cancel.is_cancelled() {
            info!("🔌 Consumer disconnected at step {}; cancelling", snapshot.step);
            self.cancel.cancel();
        }
    }
}

/// Events of one session, ending with exactly one `Complete` or `Error`.
///
/// Dropping the stream (or calling [`EventStream::cancel`]) asks the worker to
/// stop at its next iteration boundary.
pub struct EventStream {
    id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let event = match ready!(self.rx.poll_recv(cx)) {
            Some(event) => event,
            // The worker vanished (it panicked) without reporting an outcome.
            None => StreamEvent::error("Generation failed: worker stopped unexpectedly"),
        };
        if event.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Poll::Ready(Some(event))
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
