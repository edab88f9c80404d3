use ndarray::Array2;
use rkg::prelude::*;
use std::sync::atomic::Ordering;

fn classifier() -> Model {
    Model::sequential(vec![
        Layer::input("input_1", &[4]),
        Layer::dense("dense_1", 8, Activation::Tanh),
        Layer::dense("dense_2", 2, Activation::Softmax),
    ])
    .unwrap()
}

fn linear_model() -> Model {
    Model::sequential(vec![
        Layer::input("input_1", &[4]),
        Layer::dense("dense_1", 2, Activation::Linear),
    ])
    .unwrap()
}

fn dataset(rows: usize) -> TensorDataset {
    let x = Array2::from_shape_fn((rows, 4), |(i, j)| {
        ((i * 7 + j * 3) % 11) as f64 / 11.0 - 0.5
    });
    let labels: Vec<usize> = (0..rows).map(|i| i % 2).collect();
    TensorDataset::new(x, one_hot(&labels, 2)).unwrap()
}

#[test]
fn fit_processes_floor_n_over_b_batches_per_epoch() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut model = classifier();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let data = dataset(10);
    let history = model.fit(&data, 2, 3, None).unwrap();
    assert_eq!(history.batch_events().len(), 6);
    for epoch in 1..=2 {
        let per_epoch = history
            .batch_events()
            .iter()
            .filter(|b| b.epoch == epoch)
            .count();
        assert_eq!(per_epoch, 3);
    }
    assert_eq!(history.epoch_events().len(), 2);
}

#[test]
fn gradient_descent_reduces_convex_loss() {
    let mut model = linear_model();
    model
        .compile(Optimizer::sgd(0.05), Loss::Mse, Metric::Mse)
        .unwrap();
    let data = dataset(16);
    let history = model.fit(&data, 20, 8, None).unwrap();
    let first = history.epoch_events().first().unwrap().loss;
    let last = history.epoch_events().last().unwrap().loss;
    assert!(
        last < first,
        "loss should decrease, went {} -> {}",
        first,
        last
    );
}

#[test]
fn non_finite_loss_is_soft_and_training_continues() {
    let mut model = linear_model();
    // an absurd learning rate blows the weights up within a few batches
    model
        .compile(Optimizer::sgd(1e30), Loss::Mse, Metric::Mse)
        .unwrap();
    let data = dataset(16);
    let history = model.fit(&data, 3, 4, None).unwrap();
    // every scheduled batch still ran
    assert_eq!(history.batch_events().len(), 12);
    assert!(history.anomaly_count() > 0);
    assert_eq!(history.epoch_events().len(), 3);
}

#[test]
fn stop_flag_halts_before_the_first_epoch() {
    let mut model = classifier();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let stop = model.stop_handle();
    stop.store(true, Ordering::Relaxed);
    let data = dataset(8);
    let history = model.fit(&data, 5, 4, None).unwrap();
    assert!(history.epoch_events().is_empty());
    // the flag is consumed; a later fit trains normally
    let history = model.fit(&data, 1, 4, None).unwrap();
    assert_eq!(history.epoch_events().len(), 1);
}

#[test]
fn validation_pass_is_recorded_per_epoch() {
    let mut model = classifier();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let train = dataset(12);
    let val = dataset(6);
    let history = model.fit(&train, 2, 4, Some((&val, 3))).unwrap();
    for epoch in history.epoch_events() {
        assert!(epoch.val_loss.is_some());
        assert!(epoch.val_metric.is_some());
    }
}

#[test]
fn evaluate_reports_metric_and_loss() {
    let mut model = classifier();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let data = dataset(12);
    model.fit(&data, 1, 4, None).unwrap();
    let result = model.evaluate(&data, 4).unwrap();
    assert!(result.loss.is_finite());
    assert_eq!(result.metric_name, "accuracy");
    assert!((0.0..=1.0).contains(&result.metric));
}

#[test]
fn frozen_layer_is_excluded_from_updates() {
    let mut hidden = Layer::dense("dense_1", 8, Activation::Tanh);
    hidden.trainable = false;
    let mut model = Model::sequential(vec![
        Layer::input("input_1", &[4]),
        hidden,
        Layer::dense("dense_2", 2, Activation::Softmax),
    ])
    .unwrap();
    model
        .compile(Optimizer::sgd(0.1), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    model.init().unwrap();
    let before = model.variable_data("dense_1_kernel").unwrap().clone();
    let head_before = model.variable_data("dense_2_kernel").unwrap().clone();
    let data = dataset(12);
    model.fit(&data, 2, 4, None).unwrap();
    assert_eq!(model.variable_data("dense_1_kernel").unwrap(), &before);
    assert_ne!(model.variable_data("dense_2_kernel").unwrap(), &head_before);
}

#[test]
fn history_exports_csv() {
    let mut model = classifier();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let data = dataset(8);
    let history = model.fit(&data, 2, 4, None).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.csv");
    history.export_csv(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("epoch,loss,metric"));
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn conv_model_predicts_through_the_graph() {
    let mut model = Model::sequential(vec![
        Layer::input("input_1", &[6, 6, 1]),
        Layer::new(
            "conv_1",
            LayerKind::Conv2D(rkg::core::layers::Conv2D::new(
                2,
                (3, 3),
                Activation::Relu,
            )),
        ),
        Layer::new(
            "pool_1",
            LayerKind::MaxPool2D(rkg::core::layers::Pool2D::new((2, 2), (2, 2))),
        ),
        Layer::flatten("flatten_1"),
        Layer::dense("dense_1", 2, Activation::Softmax),
    ])
    .unwrap();
    model
        .compile(Optimizer::adam(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    model.init().unwrap();
    assert_eq!(
        model.built_output_shape("pool_1").unwrap().to_string(),
        "(None, 2, 2, 2)"
    );
    let image = vec![0.5; 36];
    let scores = model.predict_softly(&image).unwrap();
    assert_eq!(scores.len(), 2);
    assert!((scores.iter().sum::<f64>() - 1.0).abs() < 1e-5);
}

#[test]
fn conv_model_trains_on_batches() {
    let mut model = Model::sequential(vec![
        Layer::input("input_1", &[4, 4, 1]),
        Layer::new(
            "conv_1",
            LayerKind::Conv2D(rkg::core::layers::Conv2D::new(
                2,
                (3, 3),
                Activation::Relu,
            )),
        ),
        Layer::flatten("flatten_1"),
        Layer::dense("dense_1", 2, Activation::Softmax),
    ])
    .unwrap();
    model
        .compile(Optimizer::sgd(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let x = Array2::from_shape_fn((8, 16), |(i, j)| ((i + j) % 4) as f64 / 4.0);
    let labels: Vec<usize> = (0..8).map(|i| i % 2).collect();
    let data = TensorDataset::new(x, one_hot(&labels, 2)).unwrap();
    let history = model.fit(&data, 2, 4, None).unwrap();
    assert_eq!(history.batch_events().len(), 4);
    assert!(history.batch_events().iter().all(|b| b.loss.is_finite()));
}

#[test]
fn batchnorm_and_dropout_train_and_infer_deterministically() {
    let mut model = Model::sequential(vec![
        Layer::input("input_1", &[4]),
        Layer::dense("dense_1", 8, Activation::Relu),
        Layer::new(
            "bn_1",
            LayerKind::BatchNorm(rkg::core::layers::BatchNorm::default()),
        ),
        Layer::dropout("drop_1", 0.25),
        Layer::dense("dense_2", 2, Activation::Softmax),
    ])
    .unwrap();
    model
        .compile(Optimizer::adam(0.01), Loss::CategoricalCrossentropy, Metric::Accuracy)
        .unwrap();
    let data = dataset(16);
    let history = model.fit(&data, 2, 4, None).unwrap();
    assert!(history.batch_events().iter().all(|b| b.loss.is_finite()));
    // moving statistics moved off their fresh values during training
    let moving_mean = model.variable_data("bn_1_moving_mean").unwrap();
    assert!(moving_mean.iter().any(|&v| v != 0.0));
    // inference path is deterministic: dropout off, moving stats fixed
    let input = [0.3, -0.1, 0.4, 0.2];
    assert_eq!(
        model.predict_softly(&input).unwrap(),
        model.predict_softly(&input).unwrap()
    );
}
