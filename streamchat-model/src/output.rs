use streamchat_model_interface::{StreamChatError, TokenCodec};

/// Tracks the tokens of one response and how much of their text has been
/// handed out already.
pub(crate) struct TextOutput {
  tokens: Vec<u32>,
  text: String,
  emitted: usize,
  stop_str: String,
  stopped: bool,
}

impl TextOutput {
  pub(crate) fn new(stop_str: String) -> TextOutput {
    TextOutput {
      tokens: vec![],
      text: String::new(),
      emitted: 0,
      stop_str,
      stopped: false,
    }
  }

  pub(crate) fn tokens(&self) -> &[u32] {
    &self.tokens
  }

  pub(crate) fn stopped(&self) -> bool {
    self.stopped
  }

  /// Appends `token` and re-decodes the response. Returns true once the
  /// stop string shows up; the text is cut right before it.
  pub(crate) fn push<C: TokenCodec + ?Sized>(
    &mut self,
    token: u32,
    codec: &C,
  ) -> Result<bool, StreamChatError> {
    self.tokens.push(token);
    self.text = codec.decode(&self.tokens)?;

    if !self.stop_str.is_empty() {
      if let Some(pos) = self.text.find(&self.stop_str) {
        self.text.truncate(pos);
        self.stopped = true;
      }
    }
    Ok(self.stopped)
  }

  /// Text not handed out yet. Unless `last`, a tail that may still turn
  /// into the stop string or is an unfinished character stays back.
  pub(crate) fn take_fragment(&mut self, last: bool) -> String {
    let visible = if last {
      self.text.len()
    } else {
      let trimmed = self.text.trim_end_matches('\u{FFFD}');
      trimmed.len() - partial_stop_len(trimmed, &self.stop_str)
    };

    // earlier text can change when more tokens merge; resume from the
    // longest boundary both versions share
    let emitted = self.emitted.min(visible);
    let emitted = (0..=emitted)
      .rev()
      .find(|i| self.text.is_char_boundary(*i))
      .unwrap_or(0);

    let fragment = self.text[emitted..visible].to_string();
    self.emitted = visible.max(self.emitted);
    fragment
  }

  pub(crate) fn into_text(self) -> String {
    self.text
  }
}

/// Length of the longest suffix of `text` that is a proper prefix of `stop`.
fn partial_stop_len(text: &str, stop: &str) -> usize {
  stop
    .char_indices()
    .skip(1)
    .map(|(i, _)| i)
    .filter(|i| text.ends_with(&stop[..*i]))
    .max()
    .unwrap_or(0)
}
