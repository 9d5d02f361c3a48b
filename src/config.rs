#[derive(Debug, Clone)]
pub struct Config {
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Progress line every this many batches, in training and evaluation.
    pub batch_status: usize,
    /// Epochs without BLEU improvement before the run stops.
    pub early_stop: usize,
    pub lr: f64,
    /// Token cutoff applied to both sides before padding.
    pub max_len: usize,
    /// Fraction of the corpus held out for evaluation.
    pub eval_fraction: f32,
    pub train_cap: usize,
    pub eval_cap: usize,
    /// Seed for the split shuffle. `None` falls back to ambient randomness.
    pub split_seed: Option<u64>,
    pub src_lang: String,
    pub tgt_lang: String,
    /// Target-language tag prepended to every source sentence.
    pub prefix: String,
    pub corpus_path: String,
    pub checkpoint_path: String,
    pub model_export_dir: String,
    pub tokenizer_export_dir: String,
    pub d_model: usize,
    pub num_blocks: usize,
    pub num_heads: usize,
    pub drop_p: f32,
    pub d_ff: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            batch_size: 16,
            batch_status: 32,
            early_stop: 5,
            lr: 1e-5f64,
            max_len: 128,
            eval_fraction: 0.2,
            train_cap: 10_000,
            eval_cap: 1_000,
            split_seed: Some(42),
            src_lang: "en".to_string(),
            tgt_lang: "pt".to_string(),
            prefix: ">>pt_br<<".to_string(),
            corpus_path: "en-pt_br.tmx".to_string(),
            checkpoint_path: "model.safetensors".to_string(),
            model_export_dir: "tradutor_modelo_en_pt".to_string(),
            tokenizer_export_dir: "tradutor_tokenizer_en_pt".to_string(),
            d_model: 128,
            num_blocks: 4,
            num_heads: 4,
            drop_p: 0.1,
            d_ff: 512,
        }
    }
}
