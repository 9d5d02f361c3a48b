pub mod config;
pub mod corpus;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod model;
pub mod scorer;
pub mod tokenizer;
pub mod trainer;
pub mod utils;

use std::path::Path;

use anyhow::Result;

use config::Config;
use dataset::Dataset;
use engine::{CandleEngine, TranslationEngine};
use tokenizer::TokenizerStore;

// The illustrative post-training inference inputs.
const DEMO_SENTENCES: [&str; 3] = [
    "We can do better, America can do better, and help is on the way.",
    "Equal access to public education has been gained.",
    "We thought that these elections would bring the Iraqis together, and that as we trained Iraqi security forces we could accomplish our mission with fewer American troops.",
];

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = Config::default();
    let device = utils::device(false)?;

    let pairs = corpus::read_pairs(
        &config.corpus_path,
        &config.src_lang,
        &config.tgt_lang,
        &config.prefix,
    )?;
    let dataset = Dataset::split(
        pairs,
        config.eval_fraction,
        config.train_cap,
        config.eval_cap,
        config.split_seed,
    );
    tracing::info!(
        "corpus split: {} training pairs, {} evaluation pairs",
        dataset.training.len(),
        dataset.evaluation.len()
    );

    let store = TokenizerStore::default();
    let src_sequences = dataset
        .training
        .iter()
        .map(|p| p.source.clone())
        .collect::<Vec<_>>();
    let tgt_sequences = dataset
        .training
        .iter()
        .map(|p| p.target.clone())
        .collect::<Vec<_>>();
    let src_tokenizer = store.get(&config.src_lang, &src_sequences)?;
    let tgt_tokenizer = store.get(&config.tgt_lang, &tgt_sequences)?;

    let mut engine = CandleEngine::new(&config, src_tokenizer, tgt_tokenizer, device)?;
    let state = trainer::run(&mut engine, &dataset, &config)?;
    tracing::info!(
        "training finished: best BLEU {:.4} after {} epochs",
        state.best_score,
        state.current_epoch + 1
    );

    // Illustrative translations for a fixed set of sentences.
    let prefixed = DEMO_SENTENCES
        .iter()
        .map(|s| format!("{} {s}", config.prefix))
        .collect::<Vec<_>>();
    let sources = prefixed.iter().map(String::as_str).collect::<Vec<_>>();
    for (input, output) in DEMO_SENTENCES.iter().zip(engine.translate(&sources)?) {
        tracing::info!("{input} -> {output}");
    }

    // Export the final artifacts from the best tracked state, not whatever
    // the last epoch happened to leave behind.
    let checkpoint = Path::new(&config.checkpoint_path);
    if checkpoint.exists() {
        engine.load_checkpoint(checkpoint)?;
    }
    engine.export(&config.model_export_dir, &config.tokenizer_export_dir)?;

    Ok(())
}
