use streamchat_model_interface::StreamChatError;

const LLAMA_2_SYSTEM: &str = "You are a helpful, respectful and honest assistant.";

#[derive(Clone, Debug, PartialEq)]
pub struct Prompt {
  pub user: String,
  pub bot: String,
  pub separator: String,
  pub prompt: String,
}

impl Default for Prompt {
  fn default() -> Self {
    Prompt {
      user: "User".to_string(),
      bot: "Assistant".to_string(),
      separator: ":".to_string(),
      prompt: r#"
The following is a verbose and detailed conversation between an AI assistant and a human user. The assistant is intelligent, knowledgeable, wise and polite.

"#
      .to_string(),
    }
  }
}

/// How a user turn is laid out before it is handed to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum ConversationTemplate {
  /// `[INST] ... [/INST]` turns with a `<<SYS>>` block on the first one.
  Llama2 { system: String },
  /// `User: ...` / `Assistant:` transcript after a free-form preamble.
  Plain(Prompt),
}

impl ConversationTemplate {
  pub fn from_name(name: &str, system: Option<&str>) -> Result<ConversationTemplate, StreamChatError> {
    match name {
      "llama-2" | "llama2" => Ok(ConversationTemplate::Llama2 {
        system: system.unwrap_or(LLAMA_2_SYSTEM).to_string(),
      }),
      "plain" => {
        let mut prompt = Prompt::default();
        if let Some(system) = system {
          prompt.prompt = system.to_string();
        }
        Ok(ConversationTemplate::Plain(prompt))
      }
      other => Err(StreamChatError::UnknownTemplate(other.to_string())),
    }
  }

  pub fn format_turn(&self, text: &str, first_turn: bool) -> String {
    match self {
      ConversationTemplate::Llama2 { system } if first_turn && !system.is_empty() => {
        format!("[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST]", system, text)
      }
      ConversationTemplate::Llama2 { .. } => format!("[INST] {} [/INST]", text),
      ConversationTemplate::Plain(prompt) => {
        let turn = format!(
          "{}{} {}\n\n{}{}",
          prompt.user, prompt.separator, text, prompt.bot, prompt.separator
        );
        if first_turn {
          format!("{}{}", prompt.prompt, turn)
        } else {
          format!("\n\n{}", turn)
        }
      }
    }
  }

  /// Text that marks the model starting the next user turn on its own.
  pub fn stop_str(&self) -> String {
    match self {
      ConversationTemplate::Llama2 { .. } => "[INST]".to_string(),
      ConversationTemplate::Plain(prompt) => format!("\n{}{}", prompt.user, prompt.separator),
    }
  }

  /// Whether every turn starts with the tokenizer's special prefix tokens.
  pub fn special_tokens_every_turn(&self) -> bool {
    matches!(self, ConversationTemplate::Llama2 { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn llama_2_first_turn_carries_system() {
    let template = ConversationTemplate::from_name("llama-2", Some("Be brief.")).unwrap();

    assert_eq!(
      template.format_turn("What is the meaning of life?", true),
      "[INST] <<SYS>>\nBe brief.\n<</SYS>>\n\nWhat is the meaning of life? [/INST]"
    );
    assert_eq!(template.format_turn("And then?", false), "[INST] And then? [/INST]");
  }

  #[test]
  fn llama_2_empty_system_is_omitted() {
    let template = ConversationTemplate::from_name("llama-2", Some("")).unwrap();

    assert_eq!(template.format_turn("Hi", true), "[INST] Hi [/INST]");
  }

  #[test]
  fn plain_follows_prompt_layout() {
    let template = ConversationTemplate::from_name("plain", Some("Preamble.\n\n")).unwrap();

    assert_eq!(
      template.format_turn("Hello", true),
      "Preamble.\n\nUser: Hello\n\nAssistant:"
    );
    assert_eq!(template.format_turn("Bye", false), "\n\nUser: Bye\n\nAssistant:");
    assert_eq!(template.stop_str(), "\nUser:");
    assert!(!template.special_tokens_every_turn());
  }

  #[test]
  fn unknown_name_is_rejected() {
    let err = ConversationTemplate::from_name("vicuna", None).unwrap_err();

    assert!(matches!(err, StreamChatError::UnknownTemplate(name) if name == "vicuna"));
  }
}
