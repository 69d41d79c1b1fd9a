use std::{path::PathBuf, time::Instant};

mod bundle;
mod callback;
mod config;
mod output;
mod stats;
mod template;
mod token_functions;

pub use bundle::{ModelBundle, CHAT_CONFIG_FILE, TOKENIZER_FILE};
pub use callback::{
  forward, ChannelStream, StreamCallback, StreamEvent, StreamToStdout, StreamToWriter,
};
pub use config::{ChatConfig, ChatConfigOverride};
pub use stats::GenerationStats;
pub use template::{ConversationTemplate, Prompt};
pub use token_functions::{sample_token, SampleOptions};

use rand::{rngs::StdRng, SeedableRng};
use streamchat_model_interface::{
  EngineOptions, GenericModel, LoadModel, StreamChatError, TokenCodec,
};
use tokenizers::Tokenizer;

use crate::output::TextOutput;

fn flush(
  output: &mut TextOutput,
  callback: &mut dyn StreamCallback,
  last: bool,
  stats: &mut GenerationStats,
) -> Result<(), StreamChatError> {
  let fragment = output.take_fragment(last);
  stats.flushes += 1;
  callback.on_fragment(&fragment)
}

/// Where model identifiers are looked up when they are not a path.
pub fn default_search_roots() -> Vec<PathBuf> {
  vec![PathBuf::from("dist/prebuilt"), PathBuf::from("dist")]
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
  pub search_roots: Vec<PathBuf>,
  /// Extra `chat-config.json`-style file layered over the bundle's own.
  pub config_file: Option<PathBuf>,
  pub overrides: ChatConfigOverride,
  pub engine: EngineOptions,
}

impl Default for ChatOptions {
  fn default() -> Self {
    ChatOptions {
      search_roots: default_search_roots(),
      config_file: None,
      overrides: Default::default(),
      engine: Default::default(),
    }
  }
}

/// A chat bound to one loaded model.
///
/// Turns are appended to the same engine state until [`ChatModule::reset_chat`]
/// is called.
pub struct ChatModule<Model: GenericModel, Codec: TokenCodec = Tokenizer> {
  model: Model,
  codec: Codec,
  config: ChatConfig,
  template: ConversationTemplate,
  state: Model::SessionState,
  rng: StdRng,
  n_past: usize,
  turns: usize,
  // tokens the engine has not seen yet from the end of the previous turn
  carry: Vec<u32>,
  // the previous turn ended on the stop string, so the next turn picks up
  // right after it
  stop_str_open: bool,
  stats: Option<GenerationStats>,
  bundle: Option<ModelBundle>,
}

impl<Model: LoadModel> ChatModule<Model, Tokenizer> {
  /// Resolves `model` to a bundle and loads its tokenizer and weights.
  ///
  /// Chat settings are layered: defaults, the bundle's `chat-config.json`,
  /// `options.config_file`, then `options.overrides`.
  pub fn initialize(model: &str, options: &ChatOptions) -> Result<Self, StreamChatError> {
    let bundle = ModelBundle::resolve(model, &options.search_roots)?;

    let mut config = ChatConfig::default();
    if let Some(path) = &bundle.chat_config {
      config = config.merge_file(path)?;
    }
    if let Some(path) = &options.config_file {
      config = config.merge_file(path)?;
    }
    let config = config.apply(&options.overrides);
    let template =
      ConversationTemplate::from_name(&config.conv_template, config.system_prompt.as_deref())?;

    log::info!("Loading tokenizer {:?}...", bundle.tokenizer);
    let tokenizer = Tokenizer::from_file(&bundle.tokenizer)
      .map_err(|e| StreamChatError::initialization(model, e))?;

    log::info!("Loading weights {:?}...", bundle.weights);
    let engine = Model::load(&bundle.weights, &options.engine)?;
    log::info!("Model `{}` loaded", model);

    let mut module = ChatModule::new(engine, tokenizer, config, template);
    module.bundle = Some(bundle);
    Ok(module)
  }
}

impl<Model: GenericModel, Codec: TokenCodec> ChatModule<Model, Codec> {
  pub fn new(
    model: Model,
    codec: Codec,
    config: ChatConfig,
    template: ConversationTemplate,
  ) -> ChatModule<Model, Codec> {
    let rng = match config.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };

    ChatModule {
      model,
      codec,
      config,
      template,
      state: Default::default(),
      rng,
      n_past: 0,
      turns: 0,
      carry: vec![],
      stop_str_open: false,
      stats: None,
      bundle: None,
    }
  }

  pub fn config(&self) -> &ChatConfig {
    &self.config
  }

  pub fn bundle(&self) -> Option<&ModelBundle> {
    self.bundle.as_ref()
  }

  /// Numbers from the last successful `generate`.
  pub fn stats(&self) -> Option<&GenerationStats> {
    self.stats.as_ref()
  }

  /// Forgets every previous turn.
  pub fn reset_chat(&mut self) {
    log::debug!("Resetting chat after {} turns", self.turns);
    self.state = Default::default();
    self.n_past = 0;
    self.turns = 0;
    self.carry.clear();
    self.stop_str_open = false;
  }

  fn consume_tokens(&mut self, tokens: &[u32]) -> Result<Vec<f32>, StreamChatError> {
    let logits = self.model.predict_logits(&mut self.state, tokens)?;
    self.n_past += tokens.len();
    Ok(logits)
  }

  /// Answers `prompt`, handing text to `callback` every
  /// `callback.interval()` generated tokens, and returns the whole answer.
  ///
  /// A response of `k` tokens produces `ceil(k / interval)` flushes. If the
  /// engine fails halfway, whatever was flushed stays flushed and
  /// `on_finish` is not called.
  ///
  /// The token that ended a turn (stop token or the last piece of the stop
  /// string) is fed at the start of the next turn, which then continues the
  /// transcript right after the stop string.
  pub fn generate(
    &mut self,
    prompt: &str,
    callback: &mut dyn StreamCallback,
  ) -> Result<String, StreamChatError> {
    if prompt.trim().is_empty() {
      return Err(StreamChatError::EmptyPrompt);
    }
    let interval = callback.interval().get();

    let first_turn = self.turns == 0;
    let mut input_format = self.template.format_turn(prompt, first_turn);
    let mut add_special_tokens = first_turn || self.template.special_tokens_every_turn();
    if self.stop_str_open {
      let stop_str = self.template.stop_str();
      if let Some(pos) = input_format.find(&stop_str) {
        input_format = input_format[pos + stop_str.len()..].to_string();
        add_special_tokens = false;
      }
    }
    log::info!("Patterning response with {:?}", input_format);

    let mut input_tokens = self.carry.clone();
    input_tokens.extend(self.codec.encode(&input_format, add_special_tokens)?);

    let available = self.model.context_length().saturating_sub(self.n_past);
    if input_tokens.len() >= available {
      return Err(StreamChatError::ContextWindowExceeded {
        needed: input_tokens.len(),
        available,
      });
    }
    log::debug!("Loading {} prompt tokens...", input_tokens.len());

    let mut stats = GenerationStats {
      prompt_tokens: input_tokens.len(),
      ..Default::default()
    };

    let prefill_started = Instant::now();
    let mut logits = self.consume_tokens(&input_tokens)?;
    stats.prefill = prefill_started.elapsed();
    self.carry.clear();
    self.stop_str_open = false;
    self.turns += 1;

    let sample_options = self.config.sample_options();
    let mut output = TextOutput::new(self.template.stop_str());
    let decode_started = Instant::now();

    loop {
      if output.tokens().len() >= self.config.max_gen_len {
        log::debug!("Reached max_gen_len {}", self.config.max_gen_len);
        break;
      }
      if self.n_past >= self.model.context_length() {
        log::warn!(
          "Context window of {} tokens is full, cutting the response",
          self.model.context_length()
        );
        break;
      }

      let token = sample_token(&logits, output.tokens(), &sample_options, &mut self.rng)?;
      if self.config.stop_tokens.contains(&token) {
        self.carry.push(token);
        break;
      }

      if output.push(token, &self.codec)? {
        self.carry.push(token);
        self.stop_str_open = true;
        break;
      }

      if output.tokens().len() % interval == 0 {
        flush(&mut output, callback, false, &mut stats)?;
      }

      logits = self.consume_tokens(&[token])?;
    }

    let generated = output.tokens().len();
    if generated % interval != 0 || output.stopped() {
      flush(&mut output, callback, true, &mut stats)?;
    }
    let tail = output.take_fragment(true);

    stats.decode = decode_started.elapsed();
    stats.generated_tokens = generated;
    log::debug!("Predicted tokens {:?}", output.tokens());

    callback.on_finish(&tail)?;

    let text = output.into_text();
    log::info!("Produced response {:?} ({})", text, stats);
    self.stats = Some(stats);

    Ok(text)
  }
}
