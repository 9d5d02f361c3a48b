use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, optim, Optimizer, VarBuilder, VarMap};
use tokenizers::Tokenizer;

use crate::config::Config;
use crate::corpus::TranslationPair;
use crate::error::TradutorError;
use crate::model::{greedy_decode, translator, Translator};
use crate::tokenizer::{EOS, PAD, SOS};
use crate::utils::causal_mask;

/// The narrow seam between the control loop and the model: tokenize + forward
/// + backward + optimizer step, greedy generation, and checkpointing. The
/// trainer only ever talks to this trait, so it can run against a stub.
pub trait TranslationEngine {
    /// One optimizer step over a batch. Returns the batch loss.
    fn train_step(&mut self, batch: &[&TranslationPair]) -> Result<f32, TradutorError>;

    /// Greedy-decode a translation for each source sentence.
    fn translate(&self, sources: &[&str]) -> Result<Vec<String>, TradutorError>;

    /// Blocking write of the full parameter state, overwriting any prior file.
    fn save_checkpoint(&self, path: &Path) -> Result<(), TradutorError>;
}

pub struct CandleEngine {
    model: Translator,
    varmap: VarMap,
    optimizer: optim::AdamW,
    src_tokenizer: Tokenizer,
    tgt_tokenizer: Tokenizer,
    device: Device,
    max_len: usize,
    src_lang: String,
    tgt_lang: String,
    src_sos_id: u32,
    src_eos_id: u32,
    src_pad_id: u32,
    sos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

fn special_id(tokenizer: &Tokenizer, token: &str) -> Result<u32, TradutorError> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| TradutorError::Tokenizer(format!("{token} not found in vocabulary")))
}

impl CandleEngine {
    pub fn new(
        config: &Config,
        src_tokenizer: Tokenizer,
        tgt_tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self, TradutorError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = translator(
            src_tokenizer.get_vocab_size(true),
            tgt_tokenizer.get_vocab_size(true),
            config.max_len,
            config.d_model,
            config.num_blocks,
            config.num_heads,
            config.drop_p,
            config.d_ff,
            vb,
        )
        .map_err(|e| TradutorError::TrainingStep(e.to_string()))?;
        let optimizer = optim::AdamW::new_lr(varmap.all_vars(), config.lr)
            .map_err(|e| TradutorError::TrainingStep(e.to_string()))?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            src_sos_id: special_id(&src_tokenizer, SOS)?,
            src_eos_id: special_id(&src_tokenizer, EOS)?,
            src_pad_id: special_id(&src_tokenizer, PAD)?,
            sos_id: special_id(&tgt_tokenizer, SOS)?,
            eos_id: special_id(&tgt_tokenizer, EOS)?,
            pad_id: special_id(&tgt_tokenizer, PAD)?,
            src_tokenizer,
            tgt_tokenizer,
            device,
            max_len: config.max_len,
            src_lang: config.src_lang.clone(),
            tgt_lang: config.tgt_lang.clone(),
        })
    }

    /// Restore a previously saved parameter state.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), TradutorError> {
        self.varmap
            .load(path)
            .map_err(|e| TradutorError::checkpoint(path, e))
    }

    /// Write the model state and both tokenizers to their export directories.
    pub fn export(&self, model_dir: &str, tokenizer_dir: &str) -> Result<(), TradutorError> {
        fs::create_dir_all(model_dir).map_err(|e| TradutorError::checkpoint(model_dir, e))?;
        fs::create_dir_all(tokenizer_dir)
            .map_err(|e| TradutorError::checkpoint(tokenizer_dir, e))?;

        let model_path = Path::new(model_dir).join("model.safetensors");
        self.varmap
            .save(&model_path)
            .map_err(|e| TradutorError::checkpoint(&model_path, e))?;

        for (lang, tokenizer) in [
            (&self.src_lang, &self.src_tokenizer),
            (&self.tgt_lang, &self.tgt_tokenizer),
        ] {
            let path = Path::new(tokenizer_dir).join(format!("tokenizer_{lang}.json"));
            tokenizer
                .save(&path, true)
                .map_err(|e| TradutorError::checkpoint(&path, e))?;
        }
        tracing::info!("exported model to {model_dir} and tokenizers to {tokenizer_dir}");
        Ok(())
    }

    /// Token ids for one sentence, truncated so that the specials still fit
    /// under the length cutoff.
    fn encode_ids(
        tokenizer: &Tokenizer,
        text: &str,
        cutoff: usize,
    ) -> anyhow::Result<Vec<u32>> {
        let encoding = tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(cutoff);
        Ok(ids)
    }

    fn train_step_inner(&mut self, batch: &[&TranslationPair]) -> anyhow::Result<f32> {
        let src_ids = batch
            .iter()
            .map(|p| Self::encode_ids(&self.src_tokenizer, &p.source, self.max_len - 2))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let tgt_ids = batch
            .iter()
            .map(|p| Self::encode_ids(&self.tgt_tokenizer, &p.target, self.max_len - 1))
            .collect::<anyhow::Result<Vec<_>>>()?;

        // Pad to the longest sequence in the batch, not to the global cutoff.
        let src_len = src_ids.iter().map(Vec::len).max().unwrap_or(0) + 2;
        let tgt_len = tgt_ids.iter().map(Vec::len).max().unwrap_or(0) + 1;
        let batch_size = batch.len();

        let mut encoder_rows = Vec::with_capacity(batch_size * src_len);
        for ids in &src_ids {
            encoder_rows.push(self.src_sos_id);
            encoder_rows.extend_from_slice(ids);
            encoder_rows.push(self.src_eos_id);
            encoder_rows.extend(std::iter::repeat(self.src_pad_id).take(src_len - ids.len() - 2));
        }

        // Decoder input gets [SOS], the label gets [EOS]; both padded alike.
        let mut decoder_rows = Vec::with_capacity(batch_size * tgt_len);
        let mut label_rows = Vec::with_capacity(batch_size * tgt_len);
        for ids in &tgt_ids {
            let padding = tgt_len - ids.len() - 1;
            decoder_rows.push(self.sos_id);
            decoder_rows.extend_from_slice(ids);
            decoder_rows.extend(std::iter::repeat(self.pad_id).take(padding));
            label_rows.extend_from_slice(ids);
            label_rows.push(self.eos_id);
            label_rows.extend(std::iter::repeat(self.pad_id).take(padding));
        }

        let encoder_input = Tensor::from_vec(encoder_rows, (batch_size, src_len), &self.device)?;
        let decoder_input = Tensor::from_vec(decoder_rows, (batch_size, tgt_len), &self.device)?;
        let label = Tensor::from_vec(label_rows, (batch_size, tgt_len), &self.device)?;

        let encoder_mask = encoder_input
            .ne(self.src_pad_id)?
            .reshape((batch_size, 1, 1, src_len))?;
        let decoder_mask = decoder_input
            .ne(self.pad_id)?
            .reshape((batch_size, 1, 1, tgt_len))?
            .broadcast_mul(&causal_mask(tgt_len, &self.device)?.unsqueeze(0)?)?;

        let encoder_output = self.model.encode(&encoder_input, &encoder_mask, true)?;
        let decoder_output = self.model.decode(
            &encoder_output,
            &encoder_mask,
            &decoder_input,
            &decoder_mask,
            true,
        )?;
        let logits = self.model.project(&decoder_output)?; // (batch, tgt_len, vocab)

        let loss = loss::cross_entropy(&logits.flatten_to(1)?, &label.flatten_to(1)?)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_vec0::<f32>()?)
    }

    fn translate_inner(&self, sources: &[&str]) -> anyhow::Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(sources.len());
        for source in sources {
            let ids = Self::encode_ids(&self.src_tokenizer, source, self.max_len - 2)?;
            let src_len = ids.len() + 2;
            let mut row = Vec::with_capacity(src_len);
            row.push(self.src_sos_id);
            row.extend_from_slice(&ids);
            row.push(self.src_eos_id);

            let src = Tensor::from_vec(row, (1, src_len), &self.device)?;
            let src_mask = Tensor::ones((1, 1, 1, src_len), DType::U8, &self.device)?;
            let generated = greedy_decode(
                &self.model,
                &src,
                &src_mask,
                self.sos_id,
                self.eos_id,
                self.max_len,
                &self.device,
            )?;
            let generated_ids = generated.squeeze(0)?.to_vec1::<u32>()?;
            let text = self
                .tgt_tokenizer
                .decode(&generated_ids, true)
                .map_err(anyhow::Error::msg)?;
            outputs.push(text);
        }
        Ok(outputs)
    }
}

impl TranslationEngine for CandleEngine {
    fn train_step(&mut self, batch: &[&TranslationPair]) -> Result<f32, TradutorError> {
        self.train_step_inner(batch)
            .map_err(|e| TradutorError::TrainingStep(e.to_string()))
    }

    fn translate(&self, sources: &[&str]) -> Result<Vec<String>, TradutorError> {
        self.translate_inner(sources)
            .map_err(|e| TradutorError::Evaluation(e.to_string()))
    }

    fn save_checkpoint(&self, path: &Path) -> Result<(), TradutorError> {
        self.varmap
            .save(path)
            .map_err(|e| TradutorError::checkpoint(path, e))
    }
}
