use ndarray::Array2;
use rkg::prelude::*;

fn two_dense() -> Model {
    Model::sequential(vec![
        Layer::input("input_1", &[4]),
        Layer::dense("dense_1", 3, Activation::Tanh),
        Layer::dense("dense_2", 2, Activation::Softmax),
    ])
    .unwrap()
}

fn dataset(rows: usize) -> TensorDataset {
    let x = Array2::from_shape_fn((rows, 4), |(i, j)| ((i * 5 + j) % 7) as f64 / 7.0);
    let labels: Vec<usize> = (0..rows).map(|i| i % 2).collect();
    TensorDataset::new(x, one_hot(&labels, 2)).unwrap()
}

fn compile(model: &mut Model) {
    model
        .compile(Optimizer::adam(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
}

#[test]
fn weight_round_trip_reproduces_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    let mut source = two_dense();
    compile(&mut source);
    source.init().unwrap();
    let input = [0.1, 0.2, 0.3, 0.4];
    let expected = source.predict_softly(&input).unwrap();
    source
        .save(&path, SaveFormat::JsonConfigCustomVariables, false, WritingMode::FailIfExists)
        .unwrap();

    let mut restored = two_dense();
    compile(&mut restored);
    restored.load_weights(&path, false).unwrap();
    let actual = restored.predict_softly(&input).unwrap();
    assert_eq!(expected, actual);
    assert_eq!(
        source.predict(&input).unwrap(),
        restored.predict(&input).unwrap()
    );
}

#[test]
fn missing_manifest_names_the_exact_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = two_dense();
    compile(&mut model);
    let err = model.load_weights(dir.path(), false).unwrap_err();
    match err {
        ModelError::Persistence { path, .. } => {
            assert_eq!(path, dir.path().join("variableNames.txt"));
        }
        other => panic!("expected Persistence, got {:?}", other),
    }
}

#[test]
fn fail_if_exists_rejects_collisions_and_override_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    let mut model = two_dense();
    compile(&mut model);
    model.init().unwrap();
    model
        .save(&path, SaveFormat::GraphDefCustomVariables, false, WritingMode::FailIfExists)
        .unwrap();
    let err = model
        .save(&path, SaveFormat::GraphDefCustomVariables, false, WritingMode::FailIfExists)
        .unwrap_err();
    assert!(matches!(err, ModelError::Persistence { .. }));
    model
        .save(&path, SaveFormat::GraphDefCustomVariables, false, WritingMode::Override)
        .unwrap();
    assert!(path.join("graph.def").exists());
    assert!(path.join("variableNames.txt").exists());
}

#[test]
fn graph_def_format_writes_no_variables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");
    let mut model = two_dense();
    compile(&mut model);
    model.init().unwrap();
    model
        .save(&path, SaveFormat::GraphDef, false, WritingMode::FailIfExists)
        .unwrap();
    assert!(path.join("graph.def").exists());
    assert!(!path.join("variableNames.txt").exists());
}

#[test]
fn optimizer_state_is_saved_and_skippable_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    let mut model = two_dense();
    compile(&mut model);
    let data = dataset(8);
    model.fit(&data, 1, 4, None).unwrap();
    model
        .save(&path, SaveFormat::JsonConfigCustomVariables, true, WritingMode::FailIfExists)
        .unwrap();
    let manifest = std::fs::read_to_string(path.join("variableNames.txt")).unwrap();
    assert!(manifest.lines().any(|l| l.starts_with("optimizer_adam_m_")));

    let mut restored = two_dense();
    compile(&mut restored);
    restored.load_weights(&path, false).unwrap();
    assert_eq!(restored.state(), ModelState::Initialized);

    let mut with_state = two_dense();
    compile(&mut with_state);
    with_state.load_weights(&path, true).unwrap();
    assert_eq!(with_state.state(), ModelState::OptimizerInitialized);
}

#[test]
fn saving_optimizer_state_before_training_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = two_dense();
    compile(&mut model);
    model.init().unwrap();
    let err = model
        .save(
            &dir.path().join("model"),
            SaveFormat::JsonConfigCustomVariables,
            true,
            WritingMode::FailIfExists,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::Lifecycle { .. }));
}

#[test]
fn architecture_mismatch_is_a_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    let mut source = two_dense();
    compile(&mut source);
    source.init().unwrap();
    source
        .save(&path, SaveFormat::JsonConfigCustomVariables, false, WritingMode::FailIfExists)
        .unwrap();

    // same layer names, different extents
    let mut other = Model::sequential(vec![
        Layer::input("input_1", &[4]),
        Layer::dense("dense_1", 5, Activation::Tanh),
        Layer::dense("dense_2", 2, Activation::Softmax),
    ])
    .unwrap();
    compile(&mut other);
    assert!(matches!(
        other.load_weights(&path, false),
        Err(ModelError::Persistence { .. })
    ));
}

#[test]
fn saved_json_config_reloads_as_the_same_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    let mut model = two_dense();
    compile(&mut model);
    model.init().unwrap();
    model
        .save(&path, SaveFormat::JsonConfigCustomVariables, false, WritingMode::FailIfExists)
        .unwrap();

    let reloaded = load_functional_config(&path.join("modelConfig.json")).unwrap();
    let names = |m: &Model| {
        m.layers()
            .iter()
            .map(|l| (l.name.clone(), l.kind_tag()))
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&model), names(&reloaded));
}
