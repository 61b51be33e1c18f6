use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    encode::FrameEncoder,
    events::{ProgressEvent, ITERATION_MARKER},
    latent::ImageTensor,
};

/// Turns refinement snapshots into transport-ready progress events.
#[derive(Clone)]
pub struct ProgressEmitter {
    encoder: Arc<dyn FrameEncoder>,
}

impl ProgressEmitter {
    pub fn new(encoder: Arc<dyn FrameEncoder>) -> Self {
        Self { encoder }
    }

    /// Encodes one snapshot. A snapshot that fails to encode is logged and
    /// skipped; it never aborts the run.
    pub fn emit(&self, step: usize, total: usize, image: &ImageTensor) -> Option<ProgressEvent> {
        match self.encoder.encode(image) {
            Ok(image) => {
                debug!(step, total, bytes = image.len(), "📸 Snapshot encoded");
                Some(ProgressEvent {
                    step,
                    total_steps: total,
                    iteration: ITERATION_MARKER,
                    image,
                    timestamp: Utc::now(),
                })
            }
            Err(e) => {
                warn!("⚠️ Dropping snapshot for step {}/{}: {}", step, total, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{EncodingError, PngBase64};
    use ndarray::Array4;

    struct Broken;

    impl FrameEncoder for Broken {
        fn encode(&self, _image: &ImageTensor) -> Result<String, EncodingError> {
            Err(EncodingError::Empty)
        }
    }

    #[test]
    fn emits_encoded_event() {
        let emitter = ProgressEmitter::new(Arc::new(PngBase64));
        let image = Array4::zeros((1, 3, 2, 2));
        let before = Utc::now();
        let event = emitter.emit(6, 12, &image).unwrap();
        assert_eq!((event.step, event.total_steps, event.iteration), (6, 12, 1));
        assert!(event.image.starts_with("iVBORw0KGgo"));
        assert!(event.timestamp >= before);
    }

    #[test]
    fn encoding_failure_yields_none() {
        let emitter = ProgressEmitter::new(Arc::new(Broken));
        assert!(emitter.emit(0, 1, &Array4::zeros((1, 3, 2, 2))).is_none());
    }
}
