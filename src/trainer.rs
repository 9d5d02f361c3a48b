use std::path::Path;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::engine::TranslationEngine;
use crate::error::TradutorError;
use crate::scorer::evaluate;

/// Explicit per-run bookkeeping, so the stopping logic is testable without
/// any model behind it.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub best_score: f64,
    pub epochs_since_improvement: usize,
    pub current_epoch: usize,
}

impl TrainingState {
    pub fn new(baseline: f64) -> Self {
        Self {
            best_score: baseline,
            epochs_since_improvement: 0,
            current_epoch: 0,
        }
    }

    /// Record one epoch's score. Returns true on strict improvement, which is
    /// the one and only condition for a checkpoint write.
    pub fn observe(&mut self, score: f64) -> bool {
        if score > self.best_score {
            self.best_score = score;
            self.epochs_since_improvement = 0;
            true
        } else {
            self.epochs_since_improvement += 1;
            false
        }
    }

    pub fn should_stop(&self, patience: usize) -> bool {
        self.epochs_since_improvement >= patience
    }
}

/// The core control loop: baseline evaluation, then per epoch a full pass
/// over the training batches followed by re-evaluation, best-checkpoint
/// tracking and early stopping. Any engine failure aborts the whole run.
pub fn run<E: TranslationEngine>(
    engine: &mut E,
    dataset: &Dataset,
    config: &Config,
) -> Result<TrainingState, TradutorError> {
    let baseline = evaluate(
        engine,
        &dataset.evaluation,
        config.batch_size,
        config.batch_status,
    )?;
    tracing::info!("initial BLEU: {baseline:.4}");
    let mut state = TrainingState::new(baseline);

    for epoch in 0..config.num_epochs {
        state.current_epoch = epoch;

        let batcher = dataset.train_batcher(config.batch_size, true);
        let num_batches = batcher.num_batches();
        let mut losses = Vec::with_capacity(num_batches);
        for (batch_idx, batch) in batcher.enumerate() {
            let loss = engine.train_step(&batch)?;
            losses.push(loss);

            if (batch_idx + 1) % config.batch_status == 0 {
                let running_avg = losses.iter().sum::<f32>() / losses.len() as f32;
                tracing::info!(
                    "train epoch: {epoch} [{}/{num_batches} ({:.0}%)] loss: {loss:.6} total loss: {running_avg:.6}",
                    batch_idx + 1,
                    100. * batch_idx as f64 / num_batches as f64
                );
            }
        }

        let score = evaluate(
            engine,
            &dataset.evaluation,
            config.batch_size,
            config.batch_status,
        )?;
        tracing::info!("BLEU: {score:.4}");

        if state.observe(score) {
            tracing::info!("saving best model...");
            engine.save_checkpoint(Path::new(&config.checkpoint_path))?;
        }
        if state.should_stop(config.early_stop) {
            tracing::info!(
                "no improvement for {} epochs, stopping early",
                state.epochs_since_improvement
            );
            break;
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::TranslationPair;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    #[test]
    fn test_observe_tracks_strict_improvement() {
        let mut state = TrainingState::new(0.10);
        assert!(state.observe(0.15));
        assert!(!state.observe(0.15)); // equal is not an improvement
        assert!(!state.observe(0.12));
        assert_eq!(state.best_score, 0.15);
        assert_eq!(state.epochs_since_improvement, 2);
    }

    #[test]
    fn test_best_score_is_monotonic() {
        let mut state = TrainingState::new(0.0);
        let mut previous = state.best_score;
        for score in [0.1, 0.05, 0.2, 0.15, 0.15, 0.3] {
            state.observe(score);
            assert!(state.best_score >= previous);
            previous = state.best_score;
        }
    }

    #[test]
    fn test_early_stop_example() {
        // Baseline 0.10, epoch scores [0.15, 0.12, 0.11, 0.09], patience 3:
        // improvement at epoch 1, then three consecutive non-improvements.
        let mut state = TrainingState::new(0.10);
        let scores = [0.15, 0.12, 0.11, 0.09];
        let mut stopped_after = None;
        for (epoch, score) in scores.iter().enumerate() {
            state.observe(*score);
            if state.should_stop(3) {
                stopped_after = Some(epoch + 1);
                break;
            }
        }
        assert_eq!(stopped_after, Some(4));
        assert_eq!(state.best_score, 0.15);
    }

    /// Scripted engine: each evaluation pass consumes the next set of
    /// translations; checkpoint writes are counted.
    struct StubEngine {
        outputs: RefCell<VecDeque<Vec<String>>>,
        saves: Cell<usize>,
        train_steps: Cell<usize>,
    }

    impl StubEngine {
        fn new(outputs: Vec<Vec<&str>>) -> Self {
            Self {
                outputs: RefCell::new(
                    outputs
                        .into_iter()
                        .map(|o| o.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                saves: Cell::new(0),
                train_steps: Cell::new(0),
            }
        }
    }

    impl TranslationEngine for StubEngine {
        fn train_step(&mut self, _batch: &[&TranslationPair]) -> Result<f32, TradutorError> {
            self.train_steps.set(self.train_steps.get() + 1);
            Ok(0.5)
        }

        fn translate(&self, sources: &[&str]) -> Result<Vec<String>, TradutorError> {
            let outputs = self
                .outputs
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| TradutorError::Evaluation("stub exhausted".to_string()))?;
            assert_eq!(outputs.len(), sources.len());
            Ok(outputs)
        }

        fn save_checkpoint(&self, _path: &Path) -> Result<(), TradutorError> {
            self.saves.set(self.saves.get() + 1);
            Ok(())
        }
    }

    fn stub_dataset() -> Dataset {
        let pair = |s: &str, t: &str| TranslationPair {
            source: s.to_string(),
            target: t.to_string(),
        };
        Dataset {
            training: vec![
                pair(">>pt_br<< one", "um"),
                pair(">>pt_br<< two", "dois"),
                pair(">>pt_br<< three", "tres"),
                pair(">>pt_br<< four", "quatro"),
            ],
            evaluation: vec![
                pair(">>pt_br<< we can do better", "a b c d"),
                pair(">>pt_br<< help is on the way", "e f g h"),
            ],
        }
    }

    fn stub_config() -> Config {
        Config {
            num_epochs: 10,
            early_stop: 3,
            batch_size: 16,
            batch_status: 1000,
            ..Config::default()
        }
    }

    #[test]
    fn test_run_saves_once_per_improvement_and_stops_early() {
        let exact = vec!["a b c d", "e f g h"];
        let garbage = vec!["w x y z", "q r s t"];
        // Baseline, then four epoch evaluations: one improvement followed by
        // three misses.
        let mut engine = StubEngine::new(vec![
            garbage.clone(),
            exact,
            garbage.clone(),
            garbage.clone(),
            garbage,
        ]);

        let state = run(&mut engine, &stub_dataset(), &stub_config()).unwrap();

        assert_eq!(engine.saves.get(), 1);
        assert!((state.best_score - 1.0).abs() < 1e-9);
        assert_eq!(state.current_epoch, 3); // stopped after the 4th epoch
        assert_eq!(state.epochs_since_improvement, 3);
        // One training batch per epoch, four epochs run.
        assert_eq!(engine.train_steps.get(), 4);
    }

    #[test]
    fn test_run_exhausts_epochs_without_improvement() {
        let garbage = vec!["w x y z", "q r s t"];
        let mut engine = StubEngine::new(vec![garbage; 3]);
        let config = Config {
            num_epochs: 2,
            early_stop: 5,
            ..stub_config()
        };

        let state = run(&mut engine, &stub_dataset(), &config).unwrap();
        assert_eq!(engine.saves.get(), 0);
        assert_eq!(state.epochs_since_improvement, 2);
    }

    #[test]
    fn test_engine_failure_aborts_run() {
        // Only the baseline evaluation is scripted; the first post-epoch
        // evaluation fails.
        let mut engine = StubEngine::new(vec![vec!["w x y z", "q r s t"]]);
        let err = run(&mut engine, &stub_dataset(), &stub_config()).unwrap_err();
        assert!(matches!(err, TradutorError::Evaluation(_)));
    }
}
