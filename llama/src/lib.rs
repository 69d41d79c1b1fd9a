// See https://github.com/huggingface/candle/tree/main/candle-examples/examples/quantized
// for the reference llama runner this follows.

use std::{fs::File, path::Path};

use candle_core::{quantized::gguf_file, utils, DType, Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use streamchat_model_interface::{
  EngineOptions, GenericModel, LoadModel, StreamChatError,
};

/// Used when the GGUF metadata does not say.
pub const DEFAULT_CONTEXT_LENGTH: usize = 4096;

const CONTEXT_LENGTH_KEY: &str = "llama.context_length";

pub struct Model {
  weights: ModelWeights,
  device: Device,
  context_length: usize,
}

/// Position of the next token in the engine's attention cache.
///
/// The cache itself lives inside `ModelWeights`; feeding from position 0
/// overwrites it, so a fresh `State` starts a fresh conversation.
#[derive(Debug, Default)]
pub struct State {
  n_past: usize,
}

impl GenericModel for Model {
  type SessionState = State;

  fn predict_logits(
    &mut self,
    session: &mut Self::SessionState,
    input_tokens: &[u32],
  ) -> Result<Vec<f32>, StreamChatError> {
    if input_tokens.is_empty() {
      return Err(StreamChatError::generation("cannot run the model on empty input"));
    }

    // the causal mask only covers the new tokens, so a multi-token input on
    // top of an existing cache has to go in one position at a time
    let logits = if session.n_past > 0 && input_tokens.len() > 1 {
      let mut logits = Vec::new();
      for (offset, token) in input_tokens.iter().enumerate() {
        logits = self.forward(&[*token], session.n_past + offset)?;
      }
      logits
    } else {
      self.forward(input_tokens, session.n_past)?
    };

    session.n_past += input_tokens.len();
    Ok(logits)
  }

  fn context_length(&self) -> usize {
    self.context_length
  }
}

impl LoadModel for Model {
  fn load(weights: &Path, options: &EngineOptions) -> Result<Self, StreamChatError> {
    Model::new(weights, options.force_cpu)
  }
}

impl Model {
  fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Vec<f32>, StreamChatError> {
    let input = Tensor::new(tokens, &self.device)
      .and_then(|t| t.unsqueeze(0))
      .map_err(StreamChatError::generation)?;

    self
      .weights
      .forward(&input, index_pos)
      .and_then(|l| l.squeeze(0))
      .and_then(|l| l.to_dtype(DType::F32))
      .and_then(|l| l.to_vec1::<f32>())
      .map_err(StreamChatError::generation)
  }

  pub fn new<P: AsRef<Path>>(model_path: P, force_cpu: bool) -> Result<Model, StreamChatError> {
    let model_path = model_path.as_ref();
    let model_name = model_path.display().to_string();
    let init_error = |e: candle_core::Error| StreamChatError::initialization(model_name.clone(), e);

    let device = device(force_cpu).map_err(init_error)?;

    let mut file =
      File::open(model_path).map_err(|e| StreamChatError::initialization(model_name.clone(), e))?;
    let content = gguf_file::Content::read(&mut file)
      .map_err(|e| e.with_path(model_path))
      .map_err(init_error)?;

    let context_length = content
      .metadata
      .get(CONTEXT_LENGTH_KEY)
      .and_then(|value| value.to_u32().ok())
      .map(|value| value as usize)
      .unwrap_or_else(|| {
        log::warn!(
          "{:?} has no {}, assuming {}",
          model_path,
          CONTEXT_LENGTH_KEY,
          DEFAULT_CONTEXT_LENGTH
        );
        DEFAULT_CONTEXT_LENGTH
      });

    log::debug!(
      "Loaded {} tensors from {:?}, context length {}",
      content.tensor_infos.len(),
      model_path,
      context_length
    );

    let weights = ModelWeights::from_gguf(content, &mut file, &device).map_err(init_error)?;

    Ok(Model {
      weights,
      device,
      context_length,
    })
  }
}

pub fn device(force_cpu: bool) -> candle_core::Result<Device> {
  if force_cpu {
    return Ok(Device::Cpu);
  }
  if utils::cuda_is_available() {
    Device::new_cuda(0)
  } else if utils::metal_is_available() {
    Device::new_metal(0)
  } else {
    log::info!("Running on CPU, to run on GPU build with `--features cuda` or `--features metal`");
    Ok(Device::Cpu)
  }
}
