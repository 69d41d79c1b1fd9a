use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use streamchat_model_interface::StreamChatError;

use crate::token_functions::SampleOptions;

/// Generation settings of a model bundle, read from `chat-config.json`.
///
/// Every field is optional in the file; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
  pub conv_template: String,
  /// Replaces the template's built-in system prompt when set.
  pub system_prompt: Option<String>,
  pub temperature: f32,
  pub top_p: f32,
  pub repetition_penalty: f32,
  pub repeat_last_n: usize,
  pub max_gen_len: usize,
  pub stop_tokens: Vec<u32>,
  pub seed: Option<u64>,
}

impl Default for ChatConfig {
  fn default() -> Self {
    ChatConfig {
      conv_template: "llama-2".to_string(),
      system_prompt: None,
      temperature: 0.7,
      top_p: 0.95,
      repetition_penalty: 1.0,
      repeat_last_n: 64,
      max_gen_len: 512,
      stop_tokens: vec![2],
      seed: None,
    }
  }
}

impl ChatConfig {
  /// Layers the fields present in the file at `path` over `self`.
  pub fn merge_file<P: AsRef<Path>>(self, path: P) -> Result<ChatConfig, StreamChatError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| StreamChatError::InvalidConfig {
      path: path.to_path_buf(),
      source: e.into(),
    })?;
    let partial: ChatConfigOverride =
      serde_json::from_str(&text).map_err(|e| StreamChatError::InvalidConfig {
        path: path.to_path_buf(),
        source: e.into(),
      })?;

    Ok(self.apply(&partial))
  }

  pub fn apply(mut self, overrides: &ChatConfigOverride) -> ChatConfig {
    if let Some(conv_template) = &overrides.conv_template {
      self.conv_template = conv_template.clone();
    }
    if let Some(system_prompt) = &overrides.system_prompt {
      self.system_prompt = Some(system_prompt.clone());
    }
    if let Some(temperature) = overrides.temperature {
      self.temperature = temperature;
    }
    if let Some(top_p) = overrides.top_p {
      self.top_p = top_p;
    }
    if let Some(repetition_penalty) = overrides.repetition_penalty {
      self.repetition_penalty = repetition_penalty;
    }
    if let Some(repeat_last_n) = overrides.repeat_last_n {
      self.repeat_last_n = repeat_last_n;
    }
    if let Some(max_gen_len) = overrides.max_gen_len {
      self.max_gen_len = max_gen_len;
    }
    if let Some(stop_tokens) = &overrides.stop_tokens {
      self.stop_tokens = stop_tokens.clone();
    }
    if overrides.seed.is_some() {
      self.seed = overrides.seed;
    }
    self
  }

  pub fn sample_options(&self) -> SampleOptions {
    SampleOptions {
      temp: self.temperature,
      top_p: self.top_p,
      repeat_penalty: self.repetition_penalty,
      repeat_len: self.repeat_last_n,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfigOverride {
  pub conv_template: Option<String>,
  pub system_prompt: Option<String>,
  pub temperature: Option<f32>,
  pub top_p: Option<f32>,
  pub repetition_penalty: Option<f32>,
  pub repeat_last_n: Option<usize>,
  pub max_gen_len: Option<usize>,
  pub stop_tokens: Option<Vec<u32>>,
  pub seed: Option<u64>,
}
