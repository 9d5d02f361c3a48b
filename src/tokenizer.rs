use std::path::{Path, PathBuf};

use tokenizers::models::wordlevel::{WordLevel, WordLevelTrainerBuilder};
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{
    AddedToken, DecoderWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper,
    Tokenizer, TokenizerBuilder,
};

use crate::error::TradutorError;

pub const UNK: &str = "[UNK]";
pub const PAD: &str = "[PAD]";
pub const SOS: &str = "[SOS]";
pub const EOS: &str = "[EOS]";

/// Loads per-language tokenizers from a directory, training and saving one
/// when no cached file exists yet.
pub struct TokenizerStore {
    dir: PathBuf,
}

impl Default for TokenizerStore {
    fn default() -> Self {
        Self::new(".")
    }
}

impl TokenizerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn tokenizer_path(&self, lang: &str) -> PathBuf {
        self.dir.join(format!("tokenizer_{lang}.json"))
    }

    pub fn get(&self, lang: &str, sequences: &[String]) -> Result<Tokenizer, TradutorError> {
        let path = self.tokenizer_path(lang);
        if path.exists() {
            tracing::debug!("loading cached tokenizer {}", path.display());
            Tokenizer::from_file(&path).map_err(|e| TradutorError::Tokenizer(e.to_string()))
        } else if sequences.is_empty() {
            Err(TradutorError::Tokenizer(format!(
                "no sequences to train a {lang} tokenizer on"
            )))
        } else {
            self.train(&path, sequences)
        }
    }

    fn train(&self, path: &Path, sequences: &[String]) -> Result<Tokenizer, TradutorError> {
        tracing::info!("training {} tokenizer on {} sequences", path.display(), sequences.len());
        let mut trainer = WordLevelTrainerBuilder::default()
            .show_progress(false)
            .special_tokens(vec![
                AddedToken::from(UNK, true),
                AddedToken::from(PAD, true),
                AddedToken::from(SOS, true),
                AddedToken::from(EOS, true),
            ])
            .build()
            .map_err(|e| TradutorError::Tokenizer(e.to_string()))?;

        let mut tokenizer = TokenizerBuilder::<
            WordLevel,
            NormalizerWrapper,
            PreTokenizerWrapper,
            PostProcessorWrapper,
            DecoderWrapper,
        >::default()
        .with_model(
            WordLevel::builder()
                .unk_token(UNK.to_string())
                .build()
                .map_err(|e| TradutorError::Tokenizer(e.to_string()))?,
        )
        .with_pre_tokenizer(Some(PreTokenizerWrapper::Whitespace(Whitespace::default())))
        .build()
        .map_err(|e| TradutorError::Tokenizer(e.to_string()))?;

        tokenizer
            .train(&mut trainer, sequences.iter().cloned())
            .map_err(|e| TradutorError::Tokenizer(e.to_string()))?
            .save(path, true)
            .map_err(|e| TradutorError::Tokenizer(e.to_string()))?;

        Tokenizer::from_file(path).map_err(|e| TradutorError::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TokenizerStore {
        let dir = std::env::temp_dir().join(format!("tradutor-tok-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        TokenizerStore::new(dir)
    }

    fn sequences() -> Vec<String> {
        vec![
            "we can do better".to_string(),
            "america can do better".to_string(),
            "help is on the way".to_string(),
        ]
    }

    #[test]
    fn test_train_and_reload() {
        let store = store();
        let path = store.tokenizer_path("en_reload");
        let _ = std::fs::remove_file(&path);

        let tokenizer = store.get("en_reload", &sequences()).unwrap();
        assert!(path.exists());
        assert!(tokenizer.token_to_id(PAD).is_some());
        assert!(tokenizer.token_to_id(SOS).is_some());
        assert!(tokenizer.token_to_id(EOS).is_some());

        // Second call must hit the cached file.
        let reloaded = store.get("en_reload", &[]).unwrap();
        assert_eq!(reloaded.get_vocab_size(true), tokenizer.get_vocab_size(true));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let store = store();
        let _ = std::fs::remove_file(store.tokenizer_path("en_roundtrip"));
        let tokenizer = store.get("en_roundtrip", &sequences()).unwrap();

        for text in sequences() {
            let encoding = tokenizer.encode(text.as_str(), true).unwrap();
            let decoded = tokenizer.decode(encoding.get_ids(), true).unwrap();
            assert_eq!(decoded, text);
        }
    }

    #[test]
    fn test_empty_sequences_fail() {
        let store = store();
        let _ = std::fs::remove_file(store.tokenizer_path("en_empty"));
        assert!(store.get("en_empty", &[]).is_err());
    }
}
