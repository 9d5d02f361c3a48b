use std::collections::HashMap;

use crate::corpus::TranslationPair;
use crate::dataset::PairBatcher;
use crate::engine::TranslationEngine;
use crate::error::TradutorError;

const MAX_NGRAM: usize = 4;

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for ngram in tokens.windows(n) {
        *counts.entry(ngram).or_insert(0) += 1;
    }
    counts
}

/// Corpus-level BLEU with uniform 4-gram weights, clipped counts and a
/// brevity penalty. One reference per hypothesis. Returns 0.0 when any
/// n-gram precision is zero. Always in [0, 1].
pub fn corpus_bleu(references: &[Vec<String>], hypotheses: &[Vec<String>]) -> f64 {
    debug_assert_eq!(references.len(), hypotheses.len());
    if hypotheses.is_empty() {
        return 0.0;
    }

    let mut matches = [0usize; MAX_NGRAM];
    let mut totals = [0usize; MAX_NGRAM];
    let mut hyp_len = 0usize;
    let mut ref_len = 0usize;

    for (reference, hypothesis) in references.iter().zip(hypotheses) {
        hyp_len += hypothesis.len();
        ref_len += reference.len();
        for n in 1..=MAX_NGRAM {
            let ref_counts = ngram_counts(reference, n);
            for (ngram, count) in ngram_counts(hypothesis, n) {
                let clip = ref_counts.get(ngram).copied().unwrap_or(0);
                matches[n - 1] += count.min(clip);
            }
            totals[n - 1] += hypothesis.len().saturating_sub(n - 1);
        }
    }

    if hyp_len == 0 || matches.iter().any(|&m| m == 0) {
        return 0.0;
    }

    let log_precision = matches
        .iter()
        .zip(&totals)
        .map(|(&m, &t)| (m as f64 / t as f64).ln() / MAX_NGRAM as f64)
        .sum::<f64>();
    let brevity_penalty = if hyp_len < ref_len {
        (1.0 - ref_len as f64 / hyp_len as f64).exp()
    } else {
        1.0
    };

    brevity_penalty * log_precision.exp()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Translate every evaluation example greedily and score the whole corpus
/// with BLEU. Progress line every `batch_status` batches; any engine failure
/// propagates and aborts the run.
pub fn evaluate<E: TranslationEngine>(
    engine: &E,
    eval_set: &[TranslationPair],
    batch_size: usize,
    batch_status: usize,
) -> Result<f64, TradutorError> {
    let batcher = PairBatcher::new(eval_set, batch_size, false);
    let num_batches = batcher.num_batches();

    let mut references = Vec::with_capacity(eval_set.len());
    let mut hypotheses = Vec::with_capacity(eval_set.len());
    for (batch_idx, batch) in batcher.enumerate() {
        references.extend(batch.iter().map(|p| tokenize(&p.target)));
        let sources = batch.iter().map(|p| p.source.as_str()).collect::<Vec<_>>();
        hypotheses.extend(engine.translate(&sources)?.iter().map(|t| tokenize(t)));

        if (batch_idx + 1) % batch_status == 0 {
            tracing::info!(
                "evaluation: [{}/{} ({:.0}%)]",
                batch_idx + 1,
                num_batches,
                100. * batch_idx as f64 / num_batches as f64
            );
        }
    }

    Ok(corpus_bleu(&references, &hypotheses))
}
