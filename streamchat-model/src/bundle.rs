use std::{
  fs,
  path::{Path, PathBuf},
};

use streamchat_model_interface::StreamChatError;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const CHAT_CONFIG_FILE: &str = "chat-config.json";

/// The files backing one model identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBundle {
  pub model: String,
  pub dir: PathBuf,
  pub weights: PathBuf,
  pub tokenizer: PathBuf,
  pub chat_config: Option<PathBuf>,
}

impl ModelBundle {
  /// Looks `model` up as a path first, then as a directory name under each
  /// of `roots`, in order.
  pub fn resolve(model: &str, roots: &[PathBuf]) -> Result<ModelBundle, StreamChatError> {
    let mut searched = vec![PathBuf::from(model)];
    searched.extend(roots.iter().map(|root| root.join(model)));

    for candidate in &searched {
      log::debug!("Looking for model `{}` at {:?}", model, candidate);

      if candidate.is_dir() {
        return ModelBundle::from_dir(model, candidate, None);
      }
      if candidate.is_file() && is_gguf(candidate) {
        let dir = match candidate.parent() {
          Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
          _ => PathBuf::from("."),
        };
        return ModelBundle::from_dir(model, &dir, Some(candidate.clone()));
      }
    }

    Err(StreamChatError::ModelNotFound {
      model: model.to_string(),
      searched,
    })
  }

  fn from_dir(
    model: &str,
    dir: &Path,
    weights: Option<PathBuf>,
  ) -> Result<ModelBundle, StreamChatError> {
    let weights = match weights {
      Some(weights) => weights,
      None => find_weights(model, dir)?,
    };

    let tokenizer = dir.join(TOKENIZER_FILE);
    if !tokenizer.is_file() {
      return Err(StreamChatError::initialization(
        model,
        format!("incomplete bundle {:?}: missing {}", dir, TOKENIZER_FILE),
      ));
    }

    let chat_config = Some(dir.join(CHAT_CONFIG_FILE)).filter(|path| path.is_file());

    log::info!("Resolved model `{}` to {:?}", model, weights);

    Ok(ModelBundle {
      model: model.to_string(),
      dir: dir.to_path_buf(),
      weights,
      tokenizer,
      chat_config,
    })
  }
}

fn is_gguf(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| ext.eq_ignore_ascii_case("gguf"))
    .unwrap_or(false)
}

fn find_weights(model: &str, dir: &Path) -> Result<PathBuf, StreamChatError> {
  let entries = fs::read_dir(dir).map_err(|e| StreamChatError::initialization(model, e))?;

  let mut candidates = vec![];
  for entry in entries {
    let path = entry
      .map_err(|e| StreamChatError::initialization(model, e))?
      .path();
    if path.is_file() && is_gguf(&path) {
      candidates.push(path);
    }
  }
  candidates.sort();

  if candidates.len() > 1 {
    log::warn!(
      "Bundle {:?} holds {} weight files, using {:?}",
      dir,
      candidates.len(),
      candidates[0]
    );
  }

  candidates.into_iter().next().ok_or_else(|| {
    StreamChatError::initialization(
      model,
      format!("incomplete bundle {:?}: no .gguf weights", dir),
    )
  })
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  fn bundle_dir(root: &Path, name: &str, files: &[&str]) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    for file in files {
      fs::write(dir.join(file), b"").unwrap();
    }
    dir
  }

  #[test]
  fn resolves_under_roots_in_order() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    bundle_dir(second.path(), "tiny", &["tiny.gguf", TOKENIZER_FILE]);

    let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
    let bundle = ModelBundle::resolve("tiny", &roots).unwrap();

    assert_eq!(bundle.dir, second.path().join("tiny"));
    assert_eq!(bundle.weights, second.path().join("tiny").join("tiny.gguf"));
    assert_eq!(bundle.chat_config, None);
  }

  #[test]
  fn accepts_a_direct_weights_path() {
    let root = tempfile::tempdir().unwrap();
    let dir = bundle_dir(root.path(), "m", &["a.gguf", TOKENIZER_FILE, CHAT_CONFIG_FILE]);
    let weights = dir.join("a.gguf");

    let bundle = ModelBundle::resolve(weights.to_str().unwrap(), &[]).unwrap();

    assert_eq!(bundle.weights, weights);
    assert_eq!(bundle.chat_config, Some(dir.join(CHAT_CONFIG_FILE)));
  }

  #[test]
  fn picks_first_weights_file() {
    let root = tempfile::tempdir().unwrap();
    bundle_dir(root.path(), "m", &["b.gguf", "a.gguf", TOKENIZER_FILE]);

    let bundle = ModelBundle::resolve("m", &[root.path().to_path_buf()]).unwrap();

    assert_eq!(bundle.weights.file_name().unwrap(), "a.gguf");
  }

  #[test]
  fn unknown_model_lists_every_candidate() {
    let root = tempfile::tempdir().unwrap();

    let err = ModelBundle::resolve("nonexistent-model", &[root.path().to_path_buf()]).unwrap_err();

    match err {
      StreamChatError::ModelNotFound { model, searched } => {
        assert_eq!(model, "nonexistent-model");
        assert_eq!(searched.len(), 2);
        assert_eq!(searched[1], root.path().join("nonexistent-model"));
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[test]
  fn bundle_without_tokenizer_is_incomplete() {
    let root = tempfile::tempdir().unwrap();
    bundle_dir(root.path(), "m", &["m.gguf"]);

    let err = ModelBundle::resolve("m", &[root.path().to_path_buf()]).unwrap_err();

    assert!(matches!(err, StreamChatError::EngineInitializationError { .. }));
  }

  #[test]
  fn bundle_without_weights_is_incomplete() {
    let root = tempfile::tempdir().unwrap();
    bundle_dir(root.path(), "m", &[TOKENIZER_FILE]);

    let err = ModelBundle::resolve("m", &[root.path().to_path_buf()]).unwrap_err();

    assert!(matches!(err, StreamChatError::EngineInitializationError { .. }));
  }
}
