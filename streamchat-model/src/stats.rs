use std::{fmt, time::Duration};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
  pub prompt_tokens: usize,
  pub generated_tokens: usize,
  pub flushes: usize,
  pub prefill: Duration,
  pub decode: Duration,
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
  let secs = elapsed.as_secs_f64();
  if secs > 0.0 {
    tokens as f64 / secs
  } else {
    0.0
  }
}

impl GenerationStats {
  pub fn prefill_rate(&self) -> f64 {
    rate(self.prompt_tokens, self.prefill)
  }

  pub fn decode_rate(&self) -> f64 {
    rate(self.generated_tokens, self.decode)
  }
}

impl fmt::Display for GenerationStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "prefill: {:.1} tok/s, decode: {:.1} tok/s",
      self.prefill_rate(),
      self.decode_rate()
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rates_per_second() {
    let stats = GenerationStats {
      prompt_tokens: 20,
      generated_tokens: 6,
      flushes: 3,
      prefill: Duration::from_millis(500),
      decode: Duration::from_secs(2),
    };

    assert_eq!(stats.to_string(), "prefill: 40.0 tok/s, decode: 3.0 tok/s");
  }

  #[test]
  fn zero_duration_reports_zero() {
    assert_eq!(GenerationStats::default().decode_rate(), 0.0);
  }
}
