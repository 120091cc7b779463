use faceproof_core::{
    AnalysisOptions, CancelToken, DeepfakeDetector, DetectionResult, InferenceBackend,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from async tasks to the engine thread.
enum EngineRequest {
    AnalyzeAll {
        image: RgbImage,
        options: AnalysisOptions,
        cancel: CancelToken,
        reply: oneshot::Sender<Vec<DetectionResult>>,
    },
    AnalyzeBest {
        image: RgbImage,
        options: AnalysisOptions,
        cancel: CancelToken,
        reply: oneshot::Sender<Option<DetectionResult>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Every face in the image, in detection order.
    pub async fn analyze_all(
        &self,
        image: RgbImage,
        options: AnalysisOptions,
        cancel: CancelToken,
    ) -> Result<Vec<DetectionResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::AnalyzeAll {
                image,
                options,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// The single most confident result for the image.
    pub async fn analyze_best(
        &self,
        image: RgbImage,
        options: AnalysisOptions,
        cancel: CancelToken,
    ) -> Result<Option<DetectionResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::AnalyzeBest {
                image,
                options,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Inference is blocking, so it runs off the async runtime. The thread
/// owns the pipeline and releases both models once every handle is dropped.
pub fn spawn_engine(
    backend: Arc<dyn InferenceBackend>,
    detector: DeepfakeDetector,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceproof-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::AnalyzeAll {
                        image,
                        options,
                        cancel,
                        reply,
                    } => {
                        let results = detector.analyze_all_with(&image, &options, &cancel);
                        let _ = reply.send(results);
                    }
                    EngineRequest::AnalyzeBest {
                        image,
                        options,
                        cancel,
                        reply,
                    } => {
                        let best = detector.analyze_best_with(&image, &options, &cancel);
                        let _ = reply.send(best);
                    }
                }
            }
            if let Err(e) = detector.release(backend.as_ref()) {
                tracing::warn!(error = %e, "failed to release models");
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceproof_core::{BackendError, Label, ModelHandle, ModelOutputs, PipelineConfig, Tensor};
    use ndarray::{Array2, Array3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detects two faces; the classifier always answers Real at ~0.82.
    #[derive(Default)]
    struct TwoFaceBackend {
        released: AtomicUsize,
    }

    impl InferenceBackend for TwoFaceBackend {
        fn load(&self, model_id: &str) -> Result<ModelHandle, BackendError> {
            Ok(ModelHandle(if model_id == "detector" { 0 } else { 1 }))
        }

        fn run(&self, model: ModelHandle, _input_name: &str, _input: &Tensor) -> Result<ModelOutputs, BackendError> {
            if model == ModelHandle(0) {
                let rows = vec![
                    0.0, 0.0, 100.0, 100.0, 0.9, 0.0, //
                    300.0, 300.0, 400.0, 400.0, 0.95, 0.0,
                ];
                let out = Array3::from_shape_vec((1, 2, 6), rows).unwrap();
                Ok(ModelOutputs::new().with("output0", out.into_dyn()))
            } else {
                let out = Array2::from_shape_vec((1, 2), vec![0.5, 2.0]).unwrap();
                Ok(ModelOutputs::new().with("output", out.into_dyn()))
            }
        }

        fn release(&self, _model: ModelHandle) -> Result<(), BackendError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn() -> (Arc<TwoFaceBackend>, EngineHandle, AnalysisOptions) {
        let backend = Arc::new(TwoFaceBackend::default());
        let detector =
            DeepfakeDetector::load(backend.clone(), "detector", "classifier", PipelineConfig::default()).unwrap();
        let options = detector.default_options();
        let handle = spawn_engine(backend.clone(), detector).unwrap();
        (backend, handle, options)
    }

    #[tokio::test]
    async fn test_analyze_all_through_engine() {
        let (_backend, engine, options) = spawn();
        let image = RgbImage::new(640, 640);
        let results = engine.analyze_all(image, options, CancelToken::new()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].face_index, 0);
        assert_eq!(results[1].face_index, 1);
        assert!(results.iter().all(|r| r.label == Label::Real));
    }

    #[tokio::test]
    async fn test_analyze_best_and_cancel() {
        let (_backend, engine, options) = spawn();
        let best = engine
            .analyze_best(RgbImage::new(640, 640), options, CancelToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.face_index, 0);

        let cancel = CancelToken::new();
        cancel.cancel();
        let none = engine.analyze_best(RgbImage::new(640, 640), options, cancel).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_models_released_when_handles_dropped() {
        let (backend, engine, _options) = spawn();
        drop(engine);
        for _ in 0..100 {
            if backend.released.load(Ordering::SeqCst) == 2 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("engine did not release models");
    }
}
