use std::cmp::Ordering;

use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use streamchat_model_interface::StreamChatError;

fn softmax(logits: &[f32]) -> Vec<f32> {
  // shift by the max so large logits do not overflow exp()
  let max = logits
    .iter()
    .copied()
    .filter(|val| val.is_finite())
    .fold(f32::NEG_INFINITY, f32::max);
  let denominator: f32 = logits.iter().map(|val| (val - max).exp()).sum();

  logits.iter().map(|val| (val - max).exp() / denominator).collect()
}

fn random_choice<R: Rng>(items: &[(usize, f32)], rng: &mut R) -> Result<usize, StreamChatError> {
  let dist = WeightedIndex::new(items.iter().map(|(_id, p)| *p))
    .map_err(|e| StreamChatError::SamplingError(e.to_string()))?;

  let (id, _p) = items[dist.sample(rng)];

  Ok(id)
}

fn sample_top_p(mut probabilities: Vec<(usize, f32)>, top_p: f32) -> Vec<(usize, f32)> {
  probabilities.sort_by(|(_id1, p1), (_id2, p2)| p2.partial_cmp(p1).unwrap_or(Ordering::Equal));

  let total: f32 = probabilities.iter().map(|(_id, p)| p).sum();
  let cutoff = top_p * total;

  let mut running_sum: f32 = 0.0;
  probabilities
    .into_iter()
    .take_while(|(_id, p)| {
      let take_more = running_sum < cutoff;
      running_sum += p;
      take_more
    })
    .collect()
}

fn adjust_temp(probabilities: &mut [(usize, f32)], temp: f32) {
  for (_, p) in probabilities {
    *p = p.powf(1.0 / temp);
  }
}

/// Divides the probability of every token seen in the last `repeat_len`
/// tokens by `repeat_penalty`, once per distinct token.
fn apply_repetition_penalty(
  probabilities: &mut [(usize, f32)],
  previous_tokens: &[u32],
  repeat_penalty: f32,
  repeat_len: usize,
) {
  if previous_tokens.is_empty() || repeat_len == 0 {
    return;
  }
  let recent = &previous_tokens[previous_tokens.len().saturating_sub(repeat_len)..];
  for (id, probability) in probabilities {
    if recent.contains(&(*id as u32)) {
      *probability /= repeat_penalty;
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
  pub temp: f32,
  pub top_p: f32,
  pub repeat_penalty: f32,
  pub repeat_len: usize,
}

impl Default for SampleOptions {
  fn default() -> Self {
    Self {
      temp: 0.7,
      top_p: 0.95,
      repeat_penalty: 1.0,
      repeat_len: 64,
    }
  }
}

pub fn sample_token<R: Rng>(
  logits: &[f32],
  previous_tokens: &[u32],
  opts: &SampleOptions,
  rng: &mut R,
) -> Result<u32, StreamChatError> {
  if opts.temp <= f32::EPSILON {
    let (id, _val) = logits
      .iter()
      .enumerate()
      .filter(|(_id, p)| p.is_finite())
      .max_by(|(_id1, p1), (_id2, p2)| p1.partial_cmp(p2).unwrap_or(Ordering::Equal))
      .ok_or_else(|| StreamChatError::SamplingError("no finite logits".to_string()))?;

    return Ok(id as u32);
  }

  log::trace!("Probabilities size before filtering {}", logits.len());

  let mut probabilities = softmax(logits)
    .into_iter()
    .enumerate()
    .filter(|(_id, p)| p.is_finite() && *p > 0.0)
    .collect::<Vec<_>>();

  log::trace!("Probabilities size after filtering {}", probabilities.len());

  if probabilities.is_empty() {
    return Err(StreamChatError::SamplingError(
      "no token has a usable probability".to_string(),
    ));
  }

  if (opts.temp - 1.0).abs() > f32::EPSILON {
    adjust_temp(&mut probabilities, opts.temp);
  }

  if opts.repeat_penalty > 1.0 + f32::EPSILON {
    apply_repetition_penalty(
      &mut probabilities,
      previous_tokens,
      opts.repeat_penalty,
      opts.repeat_len,
    );
  }

  if opts.top_p < 1.0 - f32::EPSILON {
    probabilities = sample_top_p(probabilities, opts.top_p);
  }

  log::trace!(
    "Probabilities size before random_choice {}",
    probabilities.len()
  );
  random_choice(&probabilities, rng).map(|id| id as u32)
}

#[cfg(test)]
mod tests {
  use rand::{rngs::StdRng, SeedableRng};

  use super::*;

  #[test]
  fn repetition_penalty_hits_recent_tokens_once() {
    let mut probs = vec![0.2, 0.3, 0.5, 0.1]
      .into_iter()
      .enumerate()
      .collect::<Vec<(usize, f32)>>();

    let used: Vec<u32> = vec![2, 3, 0, 1, 0];

    apply_repetition_penalty(&mut probs, &used, 2.0, 3);

    assert_eq!(probs, [(0, 0.1), (1, 0.15), (2, 0.5), (3, 0.1)]);
  }

  #[test]
  fn repetition_window_longer_than_history() {
    let mut probs = vec![(0, 0.5), (1, 0.5)];

    apply_repetition_penalty(&mut probs, &[1], 2.0, 64);

    assert_eq!(probs, [(0, 0.5), (1, 0.25)]);
  }

  #[test]
  fn top_p_keeps_the_head() {
    let probs = vec![(0, 0.1), (1, 0.6), (2, 0.3)];

    let kept = sample_top_p(probs, 0.5);

    assert_eq!(kept, [(1, 0.6)]);
  }

  #[test]
  fn zero_temperature_is_greedy() {
    let mut rng = StdRng::seed_from_u64(7);
    let opts = SampleOptions {
      temp: 0.0,
      ..Default::default()
    };

    let token = sample_token(&[0.1, f32::NAN, 3.0, 2.0], &[], &opts, &mut rng).unwrap();

    assert_eq!(token, 2);
  }

  #[test]
  fn sampling_stays_inside_nucleus() {
    let mut rng = StdRng::seed_from_u64(42);
    let opts = SampleOptions {
      temp: 1.0,
      top_p: 0.5,
      ..Default::default()
    };
    let logits = [0.0, 10.0, 0.0, 0.0];

    for _ in 0..32 {
      assert_eq!(sample_token(&logits, &[], &opts, &mut rng).unwrap(), 1);
    }
  }

  #[test]
  fn empty_logits_fail() {
    let mut rng = StdRng::seed_from_u64(1);

    let greedy = SampleOptions {
      temp: 0.0,
      ..Default::default()
    };
    assert!(matches!(
      sample_token(&[], &[], &greedy, &mut rng),
      Err(StreamChatError::SamplingError(_))
    ));
    assert!(matches!(
      sample_token(&[], &[], &SampleOptions::default(), &mut rng),
      Err(StreamChatError::SamplingError(_))
    ));
  }
}
