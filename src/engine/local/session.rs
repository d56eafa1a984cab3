// Honyaku Engine — ONNX session wrapper
//
// Owns one compiled inference graph and exposes a typed run call over the
// named tensors the OPUS-MT export uses (`input_ids`, `attention_mask`,
// `decoder_input_ids` → logits). The session is not re-entrant in this
// design: callers serialize access (the engine holds the mutex).

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::DeviceKind;
use log::{info, warn};
use ndarray::{Array2, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;

pub struct OnnxSession {
    session: Session,
    /// Name of the logits output as advertised by the model metadata
    /// ("output", "logits", or "last_hidden_state" depending on exporter).
    output_name: String,
}

impl OnnxSession {
    /// Compile the graph from disk. Construction is slow (graph optimization
    /// runs here) and fatal on a missing or unloadable model.
    pub fn load(model_path: &Path, device: DeviceKind) -> CoreResult<Self> {
        if !model_path.exists() {
            return Err(CoreError::config(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let mut builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level2))
            .and_then(|b| b.with_memory_pattern(true))
            .and_then(|b| b.with_intra_threads(1))
            .map_err(|e| CoreError::config(format!("session builder: {}", e)))?;

        match device {
            DeviceKind::Cpu => {}
            DeviceKind::Cuda => {
                #[cfg(feature = "cuda")]
                {
                    use ort::execution_providers::CUDAExecutionProvider;
                    builder = builder
                        .with_execution_providers([CUDAExecutionProvider::default().build()])
                        .map_err(|e| CoreError::config(format!("cuda provider: {}", e)))?;
                    info!("[opusmt] CUDA execution provider registered");
                }
                #[cfg(not(feature = "cuda"))]
                {
                    warn!("[opusmt] CUDA requested but this build has no `cuda` feature, using CPU");
                }
            }
        }

        let session = builder
            .commit_from_file(model_path)
            .map_err(|e| CoreError::config(format!("cannot load {}: {}", model_path.display(), e)))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| CoreError::config("model advertises no outputs"))?;

        info!(
            "[opusmt] session ready: {} (output `{}`)",
            model_path.display(),
            output_name
        );

        Ok(OnnxSession { session, output_name })
    }

    /// One forward pass. Shapes: `encoder_ids`/`encoder_mask` are `[1, L]`,
    /// `decoder_ids` is `[1, D]`; the result is the logits tensor
    /// `[1, D, vocab]`. Not safe for concurrent calls.
    pub fn run(
        &self,
        encoder_ids: Array2<i64>,
        encoder_mask: Array2<i64>,
        decoder_ids: Array2<i64>,
    ) -> CoreResult<ArrayD<f32>> {
        let inputs = ort::inputs![
            "input_ids" => encoder_ids,
            "attention_mask" => encoder_mask,
            "decoder_input_ids" => decoder_ids,
        ]
        .map_err(|e| CoreError::processing(format!("session inputs: {}", e)))?;

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| CoreError::processing(format!("session run: {}", e)))?;

        let logits = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| CoreError::processing(format!("logits extract: {}", e)))?;

        Ok(logits.to_owned())
    }
}
