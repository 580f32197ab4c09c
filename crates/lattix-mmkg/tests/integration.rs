//! End-to-end tests: benchmark files -> features -> adversarial training ->
//! evaluation -> checkpoints.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use lattix_mmkg::data::benchmark::write_benchmark;
use lattix_mmkg::{
    AdversarialTrainer, Benchmark, CorruptionStrategy, IdTriple, Modality, ModalityFeatures,
    MultimodalScorer, Tester, TrainingConfig, Vocab,
};

/// Small social graph with names.
fn synthetic_social() -> Benchmark {
    let facts = [
        ("alice", "friendOf", "bob"),
        ("bob", "friendOf", "alice"),
        ("bob", "friendOf", "carol"),
        ("carol", "friendOf", "bob"),
        ("carol", "friendOf", "dave"),
        ("dave", "friendOf", "carol"),
        ("alice", "worksAt", "acme"),
        ("bob", "worksAt", "acme"),
        ("carol", "worksAt", "globex"),
        ("dave", "worksAt", "globex"),
        ("acme", "locatedIn", "nyc"),
        ("globex", "locatedIn", "sf"),
        ("nyc", "isA", "city"),
        ("sf", "isA", "city"),
    ];

    let mut entities = Vocab::new();
    let mut relations = Vocab::new();
    let mut triples: Vec<IdTriple> = facts
        .iter()
        .map(|(h, r, t)| {
            let h = entities.insert(*h);
            let r = relations.insert(*r);
            let t = entities.insert(*t);
            IdTriple::new(h, r, t)
        })
        .collect();

    let test = vec![triples.remove(3), triples.remove(8)];
    Benchmark {
        entities,
        relations,
        train: triples,
        valid: Vec::new(),
        test,
    }
}

/// Deterministic pseudo-features, different per entity.
fn feature_table(rows: usize, cols: usize, salt: usize) -> Tensor {
    let values: Vec<f32> = (0..rows * cols)
        .map(|i| (((i * 31 + salt * 17) % 23) as f32 / 23.0) - 0.5)
        .collect();
    Tensor::from_vec(values, (rows, cols), &Device::Cpu).unwrap()
}

fn write_features(dir: &Path, num_entities: usize) -> (std::path::PathBuf, std::path::PathBuf) {
    let visual = dir.join("visual.safetensors");
    let textual = dir.join("textual.npy");
    let tensors = HashMap::from([("embeddings".to_string(), feature_table(num_entities, 16, 1))]);
    candle_core::safetensors::save(&tensors, &visual).unwrap();
    feature_table(num_entities, 12, 2).write_npy(&textual).unwrap();
    (visual, textual)
}

fn small_config() -> TrainingConfig {
    TrainingConfig::default()
        .with_embedding_dim(8)
        .with_margin(6.0)
        .with_epochs(60)
        .with_batch_size(8)
        .with_negative_samples(4)
        .with_corruption(CorruptionStrategy::Bernoulli)
        .with_learning_rate(0.05)
        .with_generator_learning_rate(0.01)
        .with_eval_every(Some(20))
        .with_seed(7)
}

fn load_features(dir: &Path, num_entities: usize) -> Vec<ModalityFeatures> {
    let (visual, textual) = write_features(dir, num_entities);
    vec![
        ModalityFeatures::load(Modality::Visual, &visual, &Device::Cpu)
            .unwrap()
            .pooled_default()
            .unwrap(),
        ModalityFeatures::load(Modality::Textual, &textual, &Device::Cpu).unwrap(),
    ]
}

#[test]
fn test_full_pipeline_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let bench_dir = dir.path().join("social");
    write_benchmark(&bench_dir, &synthetic_social()).unwrap();

    let benchmark = Benchmark::load(&bench_dir).unwrap();
    assert_eq!(benchmark.num_entities(), 9);
    assert_eq!(benchmark.num_relations(), 4);
    assert_eq!(benchmark.entities.name(0), Some("alice"));

    let features = load_features(dir.path(), benchmark.num_entities());
    let mut trainer = AdversarialTrainer::new(small_config(), &benchmark, features, &Device::Cpu)
        .unwrap()
        .with_tester(Tester::new(&benchmark));
    let report = trainer.run().unwrap();

    assert_eq!(report.discriminator_losses.len(), 60);
    assert!(report.discriminator_losses.iter().all(|l| l.is_finite()));
    assert!(report.generator_losses.iter().all(|l| l.is_finite()));

    let early: f64 = report.discriminator_losses[..5].iter().sum();
    let late: f64 = report.discriminator_losses[55..].iter().sum();
    assert!(late < early, "loss did not decrease: {early} -> {late}");

    assert_eq!(report.evaluations.len(), 3);
    let overall = &report.final_evaluation().unwrap().overall;
    assert_eq!(overall.num_triples, 4);
    assert!(overall.mrr > 0.0 && overall.mrr <= 1.0);
    assert!(overall.mr >= 1.0 && overall.mr <= benchmark.num_entities() as f64);
}

#[test]
fn test_training_separates_facts_from_corruptions() {
    let dir = tempfile::tempdir().unwrap();
    let benchmark = synthetic_social();
    let features = load_features(dir.path(), benchmark.num_entities());
    let mut trainer = AdversarialTrainer::new(small_config().with_eval_every(None), &benchmark, features, &Device::Cpu)
        .unwrap();
    trainer.run().unwrap();

    let scorer = trainer.scorer();
    let known = benchmark.known_triples();
    let (mut pos, mut neg) = (Vec::new(), Vec::new());
    for t in &benchmark.train {
        pos.push(scorer.score(&[t.head], &[t.relation], &[t.tail]).unwrap().to_vec1::<f32>().unwrap()[0]);
        for e in 0..benchmark.num_entities() as u32 {
            let corrupted = t.with_tail(e);
            if !known.contains(&corrupted) {
                neg.push(scorer.score(&[t.head], &[t.relation], &[e]).unwrap().to_vec1::<f32>().unwrap()[0]);
            }
        }
    }
    let mean = |v: &[f32]| v.iter().sum::<f32>() / v.len() as f32;
    assert!(mean(&pos) > mean(&neg), "facts {} vs corruptions {}", mean(&pos), mean(&neg));
}

#[test]
fn test_checkpoints_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let benchmark = synthetic_social();
    let config = small_config().with_epochs(3).with_eval_every(None);

    let features = load_features(dir.path(), benchmark.num_entities());
    let mut trainer = AdversarialTrainer::new(config, &benchmark, features.clone(), &Device::Cpu).unwrap();
    trainer.run().unwrap();

    let scorer_path = dir.path().join("ckpt").join("scorer.safetensors");
    let generator_path = dir.path().join("ckpt").join("scorer.generator.safetensors");
    std::fs::create_dir_all(scorer_path.parent().unwrap()).unwrap();
    trainer.scorer().save_checkpoint(&scorer_path).unwrap();
    trainer.generator().save_checkpoint(&generator_path).unwrap();

    let restored = MultimodalScorer::from_checkpoint(&scorer_path, features, &Device::Cpu).unwrap();
    let tester = Tester::new(&benchmark);
    let original = tester.run_link_prediction(trainer.scorer()).unwrap();
    let reloaded = tester.run_link_prediction(&restored).unwrap();
    assert!((original.overall.mrr - reloaded.overall.mrr).abs() < 1e-9);
    assert_eq!(original.overall.num_triples, reloaded.overall.num_triples);

    let (_, mut generator) = trainer.into_parts();
    generator.load_checkpoint(&generator_path).unwrap();
}

#[test]
fn test_attention_rows_cover_every_modality() {
    let dir = tempfile::tempdir().unwrap();
    let benchmark = synthetic_social();
    let features = load_features(dir.path(), benchmark.num_entities());
    let trainer = AdversarialTrainer::new(small_config(), &benchmark, features, &Device::Cpu).unwrap();

    let weights = trainer.scorer().attention_weights(&[0, 1, 2], &[0, 1, 2]).unwrap();
    assert_eq!(weights.len(), 3);
    for row in weights {
        // structure + visual + textual
        assert_eq!(row.len(), 3);
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
