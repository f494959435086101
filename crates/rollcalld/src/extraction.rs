use rollcall_core::{DetectedFace, ExtractError, FaceExtractor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// Run the extractor on a blocking worker, bounded by `timeout`.
///
/// A timed-out worker is abandoned, not cancelled; its result is discarded.
pub async fn extract_faces(
    extractor: &Arc<dyn FaceExtractor>,
    image: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<DetectedFace>, ExtractionError> {
    let extractor = Arc::clone(extractor);
    let work = tokio::task::spawn_blocking(move || extractor.extract(&image));

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(join)) => Err(ExtractionError::Worker(join.to_string())),
        Err(_) => Err(ExtractionError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    impl FaceExtractor for Slow {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>, ExtractError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct Panics;

    impl FaceExtractor for Panics {
        fn extract(&self, _image: &[u8]) -> Result<Vec<DetectedFace>, ExtractError> {
            panic!("model crashed")
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let extractor: Arc<dyn FaceExtractor> = Arc::new(Slow);
        let err = extract_faces(&extractor, vec![], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_worker_panic_is_an_error() {
        let extractor: Arc<dyn FaceExtractor> = Arc::new(Panics);
        let err = extract_faces(&extractor, vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Worker(_)));
    }
}
