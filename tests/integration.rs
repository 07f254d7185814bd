//! Integration tests for chain-reasoning
//!
//! Models here are tiny (2 layers, 16 hidden) and run on CPU.

use std::io::Write;

use candle_core::Device;
use chain_reasoning::{
    evaluate, sweep, train, BatchMode, ChainError, ChainProcess, ChainTokenizer,
    ConditionalTable, CriterionModel, EvaluationOutcome, ExperimentConfig, ModelConfig,
    OptimizerConfig, ReasoningModel, ScheduleConfig, SequenceModel,
};
use tempfile::NamedTempFile;

fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        n_positions: 32,
        n_embd: 16,
        n_layer: 2,
        n_head: 2,
        ..ModelConfig::default()
    }
}

/// Exact conditionals survive a save/load round trip
#[test]
fn test_chain_file_round_trip() {
    let chain = ChainProcess::new(
        ["X", "Y", "Z", "W"].map(String::from).to_vec(),
        [0.3, 0.7],
        vec![
            ConditionalTable::noisy(0.2),
            ConditionalTable::new([[0.6, 0.4], [0.05, 0.95]]),
            ConditionalTable::MISMATCH,
        ],
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chains").join("custom.json");
    chain.save(&path).unwrap();
    let reloaded = ChainProcess::load(&path).unwrap();

    for query in chain.all_queries() {
        let before = chain
            .exact_conditional(&query.observed, query.value, &query.target)
            .unwrap();
        let after = reloaded
            .exact_conditional(&query.observed, query.value, &query.target)
            .unwrap();
        assert!((before - after).abs() < 1e-9, "{query:?}");
    }
}

#[test]
fn test_missing_chain_file_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ChainProcess::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ChainError::Load { .. }));
}

#[test]
fn test_malformed_table_is_validation_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "variables": ["A", "B"],
        "prior": [0.5, 0.5],
        "tables": [[[0.7, 0.7], [0.0, 1.0]]]
    }}"#
    )
    .unwrap();

    let err = ChainProcess::load(file.path()).unwrap_err();
    assert!(matches!(err, ChainError::Validation(_)), "{err}");
}

/// A constant child would leave `B=1` as evidence no sample ever shows
#[test]
fn test_unreachable_value_is_rejected_on_load() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "variables": ["A", "B"],
        "prior": [0.5, 0.5],
        "tables": [[[1.0, 0.0], [1.0, 0.0]]]
    }}"#
    )
    .unwrap();

    let err = ChainProcess::load(file.path()).unwrap_err();
    assert!(matches!(err, ChainError::Validation(_)), "{err}");
    assert!(err.to_string().contains("'B'=1"), "{err}");
}

#[test]
fn test_sweep_covers_every_chain_and_seed() {
    let grid = sweep::grid();
    assert_eq!(grid.len(), 20);
    for seed in 2024..=2028 {
        for chain in 0..4 {
            assert!(grid.iter().any(|e| e.seed == seed && e.chain_index == chain));
        }
    }
}

#[test]
fn test_evaluate_skips_missing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        models_root: dir.path().join("models"),
        results_dir: dir.path().join("results"),
        force_cpu: true,
        ..ExperimentConfig::default()
    };

    match evaluate(&config).unwrap() {
        EvaluationOutcome::Skipped { model_name, path } => {
            assert!(model_name.ends_with("_criterion"));
            assert_eq!(path, config.checkpoint_dir());
        }
        EvaluationOutcome::Completed { .. } => panic!("expected a skip"),
    }
    assert!(!config.results_dir.exists());
}

#[test]
fn test_checkpoint_round_trip_preserves_readouts() {
    let tokenizer = ChainTokenizer::for_variables(&["A", "B", "C"]);
    let mut model = ReasoningModel::new(
        tiny_model_config(),
        tokenizer,
        BatchMode::BatchWithSeparator,
        &Device::Cpu,
    )
    .unwrap()
    .with_training(&OptimizerConfig::Sgd { lr: 0.05 }, &ScheduleConfig::Constant);

    model
        .train_step(&["#\nA=1\nB=1".to_string(), "#\nB=0\nC=0".to_string()])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    model.save(dir.path()).unwrap();
    let loaded = ReasoningModel::load(dir.path(), &Device::Cpu).unwrap();

    assert_eq!(loaded.batch_mode(), BatchMode::BatchWithSeparator);
    assert_eq!(loaded.tokenizer(), model.tokenizer());
    for layer in 0..=model.n_layers() {
        let a = model.layer_readout("#\nA=1\nB=", layer).unwrap();
        let b = loaded.layer_readout("#\nA=1\nB=", layer).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6, "layer {layer}");
        }
    }
}

/// Define chains, train with a trivial criterion, evaluate, read the CSV
#[test]
fn test_train_then_evaluate_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("data");
    sweep::define_chains(&data_root).unwrap();

    let entry = sweep::select(0).unwrap();
    let config = ExperimentConfig {
        model: tiny_model_config(),
        batch_size: 2,
        sample_length: 2,
        criterion_threshold: 0.01,
        max_iterations: Some(50),
        n_samples: 2,
        force_cpu: true,
        ..ExperimentConfig::from_sweep(
            &entry,
            &data_root,
            &dir.path().join("models"),
            &dir.path().join("results"),
        )
    };

    let report = train(&config).unwrap();
    // every label gets more than 1% probability, so the second measurement converges
    assert!(report.converged);
    assert_eq!(report.iterations, 2);
    assert!(config.checkpoint_dir().join("model.safetensors").exists());

    let EvaluationOutcome::Completed { table, path } = evaluate(&config).unwrap() else {
        panic!("checkpoint should exist");
    };
    assert_eq!(table.len(), 5 * 4 * 2);
    assert_eq!(path, config.results_path());

    let csv = std::fs::read_to_string(&path).unwrap();
    let header = csv.lines().next().unwrap();
    assert!(header.ends_with("markovian_scaff_gen_layer_2"));
    assert_eq!(csv.lines().count(), 41);
    for row in &table.rows {
        assert!(row.layer_estimates.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
