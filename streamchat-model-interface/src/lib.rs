use std::path::{Path, PathBuf};

use thiserror::Error;
use tokenizers::Tokenizer;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum StreamChatError {
  #[error("Model `{model}` not found, searched {searched:?}")]
  ModelNotFound { model: String, searched: Vec<PathBuf> },

  #[error("Unable to initialize engine for `{model}`")]
  EngineInitializationError {
    model: String,
    #[source]
    source: BoxError,
  },

  #[error("Invalid chat config {path:?}")]
  InvalidConfig {
    path: PathBuf,
    #[source]
    source: BoxError,
  },

  #[error("Unknown conversation template `{0}`")]
  UnknownTemplate(String),

  #[error("Tokens encoding error")]
  TokenEncodeError {
    #[source]
    source: BoxError,
  },

  #[error("Tokens decoding error")]
  TokenDecodeError {
    #[source]
    source: BoxError,
  },

  #[error("Prompt is empty")]
  EmptyPrompt,

  #[error("Prompt needs {needed} tokens but the context window holds {available}")]
  ContextWindowExceeded { needed: usize, available: usize },

  #[error("Token sampling failed: {0}")]
  SamplingError(String),

  #[error("Generation failed")]
  GenerationError {
    #[source]
    source: BoxError,
  },

  #[error("Output sink failure")]
  SinkError {
    #[source]
    source: std::io::Error,
  },

  #[error("Output sink closed before generation finished")]
  SinkClosed,
}

impl StreamChatError {
  pub fn generation<E>(source: E) -> StreamChatError
  where
    E: Into<BoxError>,
  {
    StreamChatError::GenerationError {
      source: source.into(),
    }
  }

  pub fn initialization<E>(model: impl Into<String>, source: E) -> StreamChatError
  where
    E: Into<BoxError>,
  {
    StreamChatError::EngineInitializationError {
      model: model.into(),
      source: source.into(),
    }
  }
}

/// Settings handed to the engine when a model is loaded.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
  /// Stay on the CPU even when an accelerator is available.
  pub force_cpu: bool,
}

/// The inference side of an engine: turns tokens into next-token logits.
///
/// The engine owns whatever per-conversation cache it needs through
/// `SessionState`; the driver keeps one state per chat and hands it back on
/// every call.
pub trait GenericModel {
  type SessionState: Default;

  /// Feeds `input_tokens` after everything already in `session` and returns
  /// the logits for the token that follows them.
  fn predict_logits(
    &mut self,
    session: &mut Self::SessionState,
    input_tokens: &[u32],
  ) -> Result<Vec<f32>, StreamChatError>;

  /// Number of positions the engine can attend to in one session.
  fn context_length(&self) -> usize;
}

pub trait LoadModel: GenericModel + Sized {
  fn load(weights: &Path, options: &EngineOptions) -> Result<Self, StreamChatError>;
}

/// Text <-> token id conversion.
pub trait TokenCodec {
  fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, StreamChatError>;

  fn decode(&self, tokens: &[u32]) -> Result<String, StreamChatError>;
}

impl TokenCodec for Tokenizer {
  fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, StreamChatError> {
    let encoding = (**self)
      .encode(text, add_special_tokens)
      .map_err(|source| StreamChatError::TokenEncodeError { source })?;
    Ok(encoding.get_ids().to_vec())
  }

  fn decode(&self, tokens: &[u32]) -> Result<String, StreamChatError> {
    (**self)
      .decode(tokens, true)
      .map_err(|source| StreamChatError::TokenDecodeError { source })
  }
}

#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  const WORD_LEVEL: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
      "type": "WordLevel",
      "vocab": { "[UNK]": 0, "hello": 1, "world": 2 },
      "unk_token": "[UNK]"
    }
  }"#;

  fn codec() -> impl TokenCodec {
    Tokenizer::from_str(WORD_LEVEL).unwrap()
  }

  #[test]
  fn tokenizer_encodes_and_decodes() {
    let codec = codec();

    let ids = codec.encode("hello world", false).unwrap();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(codec.decode(&ids).unwrap(), "hello world");
  }

  #[test]
  fn tokenizer_maps_unknown_words() {
    let codec = codec();

    assert_eq!(codec.encode("hello there", true).unwrap(), vec![1, 0]);
  }

  #[test]
  fn not_found_lists_searched_paths() {
    let err = StreamChatError::ModelNotFound {
      model: "nonexistent-model".to_string(),
      searched: vec![PathBuf::from("dist/prebuilt/nonexistent-model")],
    };

    let message = err.to_string();
    assert!(message.contains("nonexistent-model"));
    assert!(message.contains("dist/prebuilt"));
  }

  #[test]
  fn initialization_keeps_source() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
    let err = StreamChatError::initialization("tiny", io);

    let source = std::error::Error::source(&err).map(|s| s.to_string());
    assert_eq!(source.as_deref(), Some("weights missing"));
  }
}
