//! End-to-end tests: corpus -> dataset -> training -> checkpoint -> sampling.

use charnn::checkpoint::{checkpoint_exists, load_model, read_config_record, save_checkpoint};
use charnn::data::{load_corpus, save_replies};
use charnn::events::Level;
use charnn::{
    make_dataset, train, CheckpointStats, ConfigRecord, MemorySink, NullSink, OptimizerSpec,
    RnnError, SequenceModel, TextSampler, Vocabulary,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn record() -> ConfigRecord {
    ConfigRecord {
        seq_length: 8,
        batch_size: 4,
        embedding_dim: 8,
        rnn_hidden_units: 16,
        epochs: 25,
        val_frac: 0.1,
        es_patience: 5,
        ..ConfigRecord::default()
    }
}

/// Fraction of adjacent pairs in `text` that follow the cycle a->b->c->d->a.
fn cycle_fraction(text: &str) -> f32 {
    let chars: Vec<char> = text.chars().collect();
    let next = |c: char| match c {
        'a' => 'b',
        'b' => 'c',
        'c' => 'd',
        _ => 'a',
    };
    let hits = chars.windows(2).filter(|w| next(w[0]) == w[1]).count();
    hits as f32 / (chars.len() - 1) as f32
}

#[test]
fn test_train_save_load_sample() {
    let dir = tempfile::tempdir().unwrap();
    let replies_dir = dir.path().join("replies");
    let model_dir = dir.path().join("saved_models");

    let replies: Vec<String> = (0..20).map(|_| "abcd".repeat(10)).collect();
    save_replies(&replies_dir, "cyclist", &replies).unwrap();
    let text = load_corpus(&replies_dir, "cyclist").unwrap();
    let vocab = Vocabulary::from_text(&text);
    assert_eq!(vocab.chars(), &['a', 'b', 'c', 'd', '\n']);

    let record = record();
    let mut rng = StdRng::seed_from_u64(42);
    let dataset = make_dataset(&text, &vocab, &record.dataset_config(), &mut rng).unwrap();
    let mut model = SequenceModel::new(record.model_config(vocab.size()), &mut rng).unwrap();
    let mut train_config = record.train_config().unwrap();
    train_config.optimizer = OptimizerSpec::adam().with_learning_rate(0.02);

    let report = train(
        &mut model,
        &dataset.train,
        dataset.validation(),
        &train_config,
        &mut rng,
        &NullSink,
    )
    .unwrap();
    let first = report.history.first().unwrap().train_loss;
    let last = report.final_train_loss().unwrap();
    assert!(last < first, "train loss {first} -> {last}");

    save_checkpoint(
        &model_dir,
        "cyclist",
        &record,
        &vocab,
        &model,
        CheckpointStats::from_report(&report),
    )
    .unwrap();
    assert!(checkpoint_exists(&model_dir, "cyclist"));
    assert!(read_config_record(&model_dir, "cyclist")
        .unwrap()
        .is_compatible(&record));

    let loaded = load_model(&model_dir, "cyclist", Some(&record)).unwrap();
    assert_eq!(loaded.vocab, vocab);

    let sink = MemorySink::new();
    let sampler = TextSampler::new(&loaded.model, &loaded.vocab, 0.05, &sink).unwrap();
    let out = sampler
        .generate("ab", 40, &mut StdRng::seed_from_u64(1))
        .unwrap();
    assert_eq!(out.chars().count(), 42);
    assert!(out.starts_with("ab"));
    assert!(loaded.vocab.contains_all(&out));
    let cyclic: String = out.chars().filter(|c| *c != '\n').collect();
    assert!(cycle_fraction(&cyclic) > 0.8, "output {out:?} does not follow the cycle");
    assert!(sink.at_level(Level::Warn).is_empty());
}

#[test]
fn test_sampling_requires_trained_model() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_model(dir.path(), "nobody", None).unwrap_err();
    assert!(matches!(err, RnnError::MissingCheckpoint { .. }));
    assert!(err.to_string().contains("train before sampling"));
}

#[test]
fn test_short_corpus_is_empty_dataset() {
    let dir = tempfile::tempdir().unwrap();
    save_replies(dir.path(), "terse", ["ok"]).unwrap();
    let text = load_corpus(dir.path(), "terse").unwrap();
    let vocab = Vocabulary::from_text(&text);
    let result = make_dataset(
        &text,
        &vocab,
        &record().dataset_config(),
        &mut StdRng::seed_from_u64(0),
    );
    assert!(matches!(result, Err(RnnError::EmptyDataset(_))));
}

#[test]
fn test_reload_with_different_architecture_fails() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = Vocabulary::from_text("some text here");
    let stored = record();
    let model = SequenceModel::new(
        stored.model_config(vocab.size()),
        &mut StdRng::seed_from_u64(3),
    )
    .unwrap();
    save_checkpoint(
        dir.path(),
        "user",
        &stored,
        &vocab,
        &model,
        CheckpointStats::default(),
    )
    .unwrap();

    let requested = ConfigRecord {
        rnn_hidden_units: 32,
        ..stored.clone()
    };
    assert!(!stored.is_compatible(&requested));
    assert!(matches!(
        load_model(dir.path(), "user", Some(&requested)),
        Err(RnnError::ConfigMismatch(_))
    ));
    assert!(load_model(dir.path(), "user", None).is_ok());
}

#[test]
fn test_training_without_validation_warns() {
    let text = "lorem ipsum dolor sit amet ".repeat(20);
    let vocab = Vocabulary::from_text(&text);
    let record = ConfigRecord {
        val_frac: 0.0,
        epochs: 2,
        ..record()
    };
    let mut rng = StdRng::seed_from_u64(8);
    let dataset = make_dataset(&text, &vocab, &record.dataset_config(), &mut rng).unwrap();
    assert!(dataset.validation().is_none());
    let mut model = SequenceModel::new(record.model_config(vocab.size()), &mut rng).unwrap();
    let sink = MemorySink::new();
    let report = train(
        &mut model,
        &dataset.train,
        dataset.validation(),
        &record.train_config().unwrap(),
        &mut rng,
        &sink,
    )
    .unwrap();
    assert_eq!(report.epochs_run(), 2);
    assert!(!report.stopped_early);
    assert_eq!(sink.at_level(Level::Warn).len(), 1);
}
