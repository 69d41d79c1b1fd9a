use std::{
  io::{self, Write},
  num::NonZeroUsize,
  path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use streamchat_model::{
  default_search_roots, forward, ChannelStream, ChatConfigOverride, ChatModule, ChatOptions,
  StreamToStdout,
};
use streamchat_model_interface::EngineOptions;
use tokio::io::{AsyncBufReadExt, BufReader};

type Chat = ChatModule<llama::Model>;

/// Stream a local chat model's answer to the terminal
#[derive(Parser, Debug)]
#[command(name = "streamchat")]
#[command(after_help = r#"Examples:
    # Ask the default model the default question
    streamchat

    # Pick a bundle and print every token as soon as it is produced
    streamchat -m Llama-2-7b-chat-hf-q4f16_1 --callback-interval 1 "Why is the sky blue?"

    # Keep chatting; /reset, /stats and /exit are understood
    streamchat --interactive
"#)]
struct Cli {
  /// Model bundle name (looked up under the model path) or a path to a bundle or .gguf file
  #[arg(short, long, env = "STREAMCHAT_MODEL", default_value = "Llama-2-7b-chat-hf-q4f16_1")]
  model: String,

  /// Directories holding model bundles, colon separated [default: dist/prebuilt:dist]
  #[arg(long, env = "STREAMCHAT_MODEL_PATH", value_delimiter = ':')]
  model_path: Vec<PathBuf>,

  /// chat-config.json style file layered over the bundle's own settings
  #[arg(long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Generated tokens between two writes to stdout
  #[arg(long, default_value = "2")]
  callback_interval: NonZeroUsize,

  /// Pending fragments buffered between the generation worker and stdout
  #[arg(long, default_value = "16")]
  channel_capacity: NonZeroUsize,

  /// Conversation template (llama-2 or plain)
  #[arg(long)]
  conv_template: Option<String>,

  /// System prompt for the first turn
  #[arg(long)]
  system_prompt: Option<String>,

  #[arg(long)]
  temperature: Option<f32>,

  #[arg(long)]
  top_p: Option<f32>,

  #[arg(long)]
  repetition_penalty: Option<f32>,

  /// Upper bound on generated tokens per answer
  #[arg(long)]
  max_gen_len: Option<usize>,

  #[arg(long)]
  seed: Option<u64>,

  /// Run on the CPU even if an accelerator is available
  #[arg(long)]
  cpu: bool,

  /// Print prefill/decode speed to stderr after each answer
  #[arg(long)]
  stats: bool,

  /// Read prompts from stdin until /exit or end of input
  #[arg(short, long)]
  interactive: bool,

  /// Prompt to answer
  #[arg(default_value = "What is the meaning of life?")]
  prompt: String,
}

impl Cli {
  fn chat_options(&self) -> ChatOptions {
    let search_roots = if self.model_path.is_empty() {
      default_search_roots()
    } else {
      self.model_path.clone()
    };

    ChatOptions {
      search_roots,
      config_file: self.config.clone(),
      overrides: ChatConfigOverride {
        conv_template: self.conv_template.clone(),
        system_prompt: self.system_prompt.clone(),
        temperature: self.temperature,
        top_p: self.top_p,
        repetition_penalty: self.repetition_penalty,
        max_gen_len: self.max_gen_len,
        seed: self.seed,
        ..Default::default()
      },
      engine: EngineOptions {
        force_cpu: self.cpu,
      },
    }
  }
}

/// Runs one generation on a blocking worker while this task writes the
/// fragments it sends to stdout.
async fn stream_response(
  mut chat: Chat,
  prompt: String,
  interval: NonZeroUsize,
  capacity: NonZeroUsize,
) -> Result<(Chat, String)> {
  let (mut stream, mut events) = ChannelStream::new(interval, capacity);

  let worker = tokio::task::spawn_blocking(move || {
    let response = chat.generate(&prompt, &mut stream);
    (chat, response)
  });

  let mut stdout = StreamToStdout::stdout(interval);
  let forwarded = forward(&mut events, &mut stdout).await;
  // unblocks the worker if stdout went away mid-answer
  drop(events);

  let (chat, response) = worker.await.context("Generation worker panicked")?;
  forwarded.context("Could not write to stdout")?;
  let response = response.context("Generation failed")?;

  log::debug!("Wrote {} flushes", stdout.flushes());
  Ok((chat, response))
}

fn print_stats(chat: &Chat) {
  match chat.stats() {
    Some(stats) => eprintln!("{}", stats),
    None => eprintln!("No answer generated yet"),
  }
}

fn prompt_marker() -> Result<()> {
  print!("> ");
  io::stdout().flush()?;
  Ok(())
}

async fn run_interactive(mut chat: Chat, cli: &Cli) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  prompt_marker()?;
  while let Some(line) = lines.next_line().await? {
    match line.trim() {
      "" => {}
      "/exit" => break,
      "/reset" => {
        chat.reset_chat();
        eprintln!("Chat reset");
      }
      "/stats" => print_stats(&chat),
      "/help" => eprintln!("/reset  forget the conversation\n/stats  last answer speed\n/exit   quit"),
      text => {
        let (next, _) = stream_response(
          chat,
          text.to_string(),
          cli.callback_interval,
          cli.channel_capacity,
        )
        .await?;
        chat = next;
        if cli.stats {
          print_stats(&chat);
        }
      }
    }
    prompt_marker()?;
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  env_logger::init();

  let cli = Cli::parse();
  let options = cli.chat_options();
  let model = cli.model.clone();

  log::info!("Loading model {}...", model);
  let chat = tokio::task::spawn_blocking(move || Chat::initialize(&model, &options))
    .await
    .context("Model loading panicked")?
    .with_context(|| format!("Unable to initialize model `{}`", cli.model))?;
  if let Some(bundle) = chat.bundle() {
    log::info!("Model loaded from {:?}", bundle.dir);
  }
  log::debug!("Chat settings {:?}", chat.config());

  if cli.interactive {
    return run_interactive(chat, &cli).await;
  }

  let (chat, _) = stream_response(
    chat,
    cli.prompt.clone(),
    cli.callback_interval,
    cli.channel_capacity,
  )
  .await?;
  if cli.stats {
    print_stats(&chat);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn command_is_well_formed() {
    Cli::command().debug_assert();
  }

  #[test]
  fn defaults_match_the_classic_invocation() {
    let cli = Cli::try_parse_from(["streamchat"]).unwrap();

    assert_eq!(cli.model, "Llama-2-7b-chat-hf-q4f16_1");
    assert_eq!(cli.prompt, "What is the meaning of life?");
    assert_eq!(cli.callback_interval.get(), 2);
    assert_eq!(cli.chat_options().search_roots, default_search_roots());
  }

  #[test]
  fn zero_interval_is_rejected() {
    assert!(Cli::try_parse_from(["streamchat", "--callback-interval", "0"]).is_err());
  }

  #[test]
  fn flags_become_overrides() {
    let cli = Cli::try_parse_from([
      "streamchat",
      "--model-path",
      "/models:/more-models",
      "--temperature",
      "0",
      "--seed",
      "9",
      "--cpu",
      "Hello",
    ])
    .unwrap();
    let options = cli.chat_options();

    assert_eq!(
      options.search_roots,
      vec![PathBuf::from("/models"), PathBuf::from("/more-models")]
    );
    assert_eq!(options.overrides.temperature, Some(0.0));
    assert_eq!(options.overrides.seed, Some(9));
    assert_eq!(options.overrides.top_p, None);
    assert!(options.engine.force_cpu);
    assert_eq!(cli.prompt, "Hello");
  }
}
