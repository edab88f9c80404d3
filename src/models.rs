use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{Array2, ArrayD, Ix2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::core::graph::{BuiltLayer, GraphContainer, OPTIMIZER_PREFIX};
use crate::core::initializers::DEFAULT_SEED;
use crate::core::layers::{reshape, Layer, LayerCache, LayerKind, Mode};
use crate::core::losses::{criteria, Loss};
use crate::core::metrics::Metric;
use crate::core::optimizers::Optimizer;
use crate::core::shape::Shape;
use crate::dataset::{Batch, Batches, Dataset};
use crate::error::{ModelError, Result};
use crate::history::{BatchEvent, EpochEvent, EvaluationResult, TrainingHistory};
use crate::utils::argmax;

/// Lifecycle of a model; transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelState {
    Uncompiled,
    Compiled,
    Initialized,
    OptimizerInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// Only the binary graph definition.
    GraphDef,
    /// Graph definition plus named variable tensors.
    GraphDefCustomVariables,
    /// Declarative JSON architecture plus named variable tensors.
    JsonConfigCustomVariables,
}

/// Directory-collision policy for [`Model::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritingMode {
    FailIfExists,
    Override,
    Append,
}

pub const VARIABLE_MANIFEST: &str = "variableNames.txt";
pub const GRAPH_DEF_FILE: &str = "graph.def";
pub const MODEL_CONFIG_FILE: &str = "modelConfig.json";

/// Serialized form of the compiled topology, opaque to loaders.
#[derive(Serialize, Deserialize)]
struct GraphDef {
    layers: Vec<Layer>,
    edges: Vec<(String, Vec<String>)>,
}

/// A DAG of layers rooted at one Input, compiled against an
/// optimizer/loss/metric triple and driven over mini-batches.
#[derive(Debug)]
pub struct Model {
    layers: Vec<Layer>,
    wiring: Vec<Vec<usize>>,
    graph: GraphContainer,
    state: ModelState,
    optimizer: Option<Optimizer>,
    loss: Option<Loss>,
    metric: Option<Metric>,
    step: usize,
    stop: Arc<AtomicBool>,
    rng: StdRng,
}

impl Model {
    /// Chains `layers` implicitly in order; the first layer must be the
    /// Input.
    pub fn sequential(layers: Vec<Layer>) -> Result<Model> {
        let wiring = (0..layers.len())
            .map(|i| if i == 0 { Vec::new() } else { vec![i - 1] })
            .collect();
        Self::build(layers, wiring)
    }

    /// Wires `layers` by the declared inbound relations. Every non-input
    /// layer must list at least one previously declared predecessor.
    pub fn graph(layers: Vec<Layer>, inbound: HashMap<String, Vec<String>>) -> Result<Model> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut wiring: Vec<Vec<usize>> = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let declared = inbound.get(&layer.name).map(Vec::as_slice).unwrap_or(&[]);
            if matches!(layer.kind, LayerKind::Input(_)) {
                if !declared.is_empty() {
                    return Err(ModelError::Config(format!(
                        "input layer {} cannot have inbound layers",
                        layer.name
                    )));
                }
                wiring.push(Vec::new());
            } else {
                if declared.is_empty() {
                    return Err(ModelError::Config(format!(
                        "layer {} declares no inbound layers",
                        layer.name
                    )));
                }
                let mut edges = Vec::with_capacity(declared.len());
                for wanted in declared {
                    match index.get(wanted.as_str()) {
                        Some(&j) => edges.push(j),
                        None => {
                            return Err(ModelError::UnresolvedInbound {
                                layer: layer.name.clone(),
                                wanted: wanted.clone(),
                            })
                        }
                    }
                }
                wiring.push(edges);
            }
            index.insert(layer.name.as_str(), i);
        }
        Self::build(layers, wiring)
    }

    fn build(layers: Vec<Layer>, wiring: Vec<Vec<usize>>) -> Result<Model> {
        if layers.is_empty() {
            return Err(ModelError::Config("model needs at least one layer".into()));
        }
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for layer in &layers {
            if seen.insert(layer.name.as_str(), ()).is_some() {
                return Err(ModelError::NameConflict(layer.name.clone()));
            }
        }
        let inputs = layers
            .iter()
            .filter(|l| matches!(l.kind, LayerKind::Input(_)))
            .count();
        if inputs != 1 {
            return Err(ModelError::Config(format!(
                "model needs exactly one input layer, found {}",
                inputs
            )));
        }
        if !matches!(layers[0].kind, LayerKind::Input(_)) {
            return Err(ModelError::Config(
                "the input layer must be declared first".into(),
            ));
        }
        let mut graph = GraphContainer::new();
        for (i, layer) in layers.iter().enumerate() {
            let names: Vec<String> = wiring[i].iter().map(|&j| layers[j].name.clone()).collect();
            graph.set_inbound(&layer.name, names);
        }
        Ok(Model {
            layers,
            wiring,
            graph,
            state: ModelState::Uncompiled,
            optimizer: None,
            loss: None,
            metric: None,
            step: 0,
            stop: Arc::new(AtomicBool::new(false)),
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
        })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn inbound_names(&self, layer: &str) -> &[String] {
        self.graph.inbound_of(layer)
    }

    /// Output shape of a built layer; `None` before compile.
    pub fn built_output_shape(&self, layer: &str) -> Option<Shape> {
        self.graph.built(layer).map(|b| b.output_shape.clone())
    }

    /// Layer variable names in registration order; empty before compile.
    pub fn variable_names(&self) -> Vec<String> {
        self.graph.layer_variables().map(|v| v.name.clone()).collect()
    }

    /// Cooperative stop flag, observed at epoch boundaries only.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Materialized tensor of a named variable; fails before initialization.
    pub fn variable_data(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.graph.data(name)
    }

    /// Shape-infers every layer, registers its variables and the optimizer's
    /// state slots. Fails fast when the model is already compiled.
    pub fn compile(&mut self, optimizer: Optimizer, loss: Loss, metric: Metric) -> Result<()> {
        if self.state != ModelState::Uncompiled {
            return Err(ModelError::Lifecycle {
                expected: ModelState::Uncompiled,
                actual: self.state,
                op: "compile",
            });
        }
        let mut shapes: Vec<Shape> = Vec::with_capacity(self.layers.len());
        for i in 0..self.layers.len() {
            let layer = &self.layers[i];
            let input_shapes: Vec<Shape> =
                self.wiring[i].iter().map(|&j| shapes[j].clone()).collect();
            let specs = layer.variable_specs(&input_shapes)?;
            let output_shape = layer.compute_output_shape(&input_shapes)?;
            let mut variables = Vec::with_capacity(specs.len());
            let mut param_count = 0usize;
            for mut spec in specs {
                spec.trainable = spec.trainable && layer.trainable;
                param_count += spec.shape.iter().product::<usize>();
                variables.push(spec.name.clone());
                self.graph.add_variable(spec, &layer.name)?;
            }
            self.graph.register_built(BuiltLayer {
                name: layer.name.clone(),
                output_shape: output_shape.clone(),
                variables,
                param_count,
                trainable: layer.trainable,
            })?;
            shapes.push(output_shape);
        }
        let update_targets: Vec<String> = self
            .graph
            .layer_variables()
            .filter(|v| v.trainable && !self.graph.is_frozen(&v.name))
            .map(|v| v.name.clone())
            .collect();
        for var in update_targets {
            for slot in optimizer.state_slots(&var) {
                self.graph.add_optimizer_variable(slot, &var)?;
            }
        }
        self.optimizer = Some(optimizer);
        self.loss = Some(loss);
        self.metric = Some(metric);
        self.state = ModelState::Compiled;
        Ok(())
    }

    /// Materializes every layer variable with initializer-sampled values.
    /// Fails fast when already initialized (including after `load_weights`).
    pub fn init(&mut self) -> Result<()> {
        match self.state {
            ModelState::Uncompiled => Err(ModelError::Lifecycle {
                expected: ModelState::Compiled,
                actual: self.state,
                op: "init",
            }),
            ModelState::Compiled => {
                self.graph.initialize_variables();
                self.state = ModelState::Initialized;
                Ok(())
            }
            _ => Err(ModelError::Lifecycle {
                expected: ModelState::Compiled,
                actual: self.state,
                op: "init",
            }),
        }
    }

    fn init_optimizer_state(&mut self) {
        self.graph.initialize_optimizer_variables();
        self.state = ModelState::OptimizerInitialized;
    }

    fn input_layer(&self) -> &Layer {
        &self.layers[0]
    }

    fn input_dims(&self) -> Result<Vec<usize>> {
        match &self.input_layer().kind {
            LayerKind::Input(i) => Ok(i.dims.clone()),
            _ => Err(ModelError::Internal("first layer is not the input")),
        }
    }

    fn io_elements(&self) -> Result<(usize, usize)> {
        let input = self
            .graph
            .built(&self.input_layer().name)
            .ok_or(ModelError::Internal("input layer not built"))?
            .output_shape
            .elements();
        let last = &self.layers[self.layers.len() - 1];
        let output = self
            .graph
            .built(&last.name)
            .ok_or(ModelError::Internal("output layer not built"))?
            .output_shape
            .elements();
        Ok((input, output))
    }

    fn require_at_least(&self, expected: ModelState, op: &'static str) -> Result<()> {
        if self.state < expected {
            return Err(ModelError::Lifecycle {
                expected,
                actual: self.state,
                op,
            });
        }
        Ok(())
    }

    fn run_forward(
        layers: &[Layer],
        wiring: &[Vec<usize>],
        graph: &GraphContainer,
        x: &ArrayD<f64>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(Vec<ArrayD<f64>>, Vec<Option<LayerCache>>)> {
        let mut outputs: Vec<ArrayD<f64>> = Vec::with_capacity(layers.len());
        let mut caches: Vec<Option<LayerCache>> = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let (out, cache) = if matches!(layer.kind, LayerKind::Input(_)) {
                layer.forward(graph, &[x], mode, rng)?
            } else {
                let inputs: Vec<&ArrayD<f64>> =
                    wiring[i].iter().map(|&j| &outputs[j]).collect();
                layer.forward(graph, &inputs, mode, rng)?
            };
            outputs.push(out);
            caches.push(cache);
        }
        Ok((outputs, caches))
    }

    fn run_backward(
        layers: &[Layer],
        wiring: &[Vec<usize>],
        graph: &GraphContainer,
        outputs: &[ArrayD<f64>],
        caches: &[Option<LayerCache>],
        loss_grad: ArrayD<f64>,
    ) -> Result<HashMap<String, ArrayD<f64>>> {
        let n = layers.len();
        let mut grads_out: Vec<Option<ArrayD<f64>>> = vec![None; n];
        grads_out[n - 1] = Some(loss_grad);
        let mut param_grads: HashMap<String, ArrayD<f64>> = HashMap::new();
        for i in (0..n).rev() {
            let Some(g) = grads_out[i].take() else { continue };
            let layer = &layers[i];
            if matches!(layer.kind, LayerKind::Input(_)) {
                continue;
            }
            let (pgrads, igrads) = {
                let inputs: Vec<&ArrayD<f64>> =
                    wiring[i].iter().map(|&j| &outputs[j]).collect();
                layer.backward(graph, &inputs, &outputs[i], caches[i].as_ref(), &g)?
            };
            for (name, pg) in pgrads {
                match param_grads.entry(name) {
                    Entry::Occupied(mut e) => *e.get_mut() += &pg,
                    Entry::Vacant(e) => {
                        e.insert(pg);
                    }
                }
            }
            if igrads.len() != wiring[i].len() {
                return Err(ModelError::Internal("inbound gradient count mismatch"));
            }
            for (k, ig) in igrads.into_iter().enumerate() {
                let j = wiring[i][k];
                match &mut grads_out[j] {
                    Some(acc) => *acc += &ig,
                    None => grads_out[j] = Some(ig),
                }
            }
        }
        Ok(param_grads)
    }

    fn output_as_2d(outputs: &[ArrayD<f64>]) -> Result<Array2<f64>> {
        let last = outputs.last().ok_or(ModelError::Internal("empty graph"))?;
        last.view()
            .into_dimensionality::<Ix2>()
            .map(|v| v.to_owned())
            .map_err(|e| ModelError::Shape(e.to_string()))
    }

    fn batch_input(&self, batch: &Batch, input_dims: &[usize]) -> Result<ArrayD<f64>> {
        let mut dims = Vec::with_capacity(input_dims.len() + 1);
        dims.push(batch.size);
        dims.extend_from_slice(input_dims);
        reshape(&batch.x.clone().into_dyn(), &dims)
    }

    /// Runs batched gradient training.
    ///
    /// Per epoch, exactly `floor(size / batch_size)` batches are fed; a
    /// trailing partial batch is dropped. A non-finite batch loss is a soft
    /// event: it is logged and recorded but no parameters are updated for
    /// that batch. The cooperative stop flag is observed at epoch start.
    pub fn fit(
        &mut self,
        dataset: &dyn Dataset,
        epochs: usize,
        batch_size: usize,
        validation: Option<(&dyn Dataset, usize)>,
    ) -> Result<TrainingHistory> {
        match self.state {
            ModelState::Uncompiled => {
                return Err(ModelError::Lifecycle {
                    expected: ModelState::Compiled,
                    actual: self.state,
                    op: "fit",
                })
            }
            ModelState::Compiled => self.init()?,
            _ => {}
        }
        if self.state == ModelState::Initialized {
            self.init_optimizer_state();
        }
        if batch_size == 0 {
            return Err(ModelError::Config("batch size must be positive".into()));
        }
        let optimizer = self
            .optimizer
            .clone()
            .ok_or(ModelError::Internal("optimizer missing after compile"))?;
        let loss = self.loss.ok_or(ModelError::Internal("loss missing after compile"))?;
        let metric = self
            .metric
            .ok_or(ModelError::Internal("metric missing after compile"))?;
        let (input_elements, label_elements) = self.io_elements()?;
        let input_dims = self.input_dims()?;

        let mut history = TrainingHistory::new();
        for epoch in 1..=epochs {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, halting before epoch {}", epoch);
                break;
            }
            let mut loss_sum = 0.0;
            let mut metric_sum = 0.0;
            let mut completed = 0usize;
            for (index, batch) in Batches::new(dataset, batch_size).enumerate() {
                batch.check(input_elements, label_elements)?;
                let (batch_loss, batch_metric, applied) =
                    self.train_batch(&batch, &input_dims, loss, metric, &optimizer)?;
                if !applied {
                    warn!(
                        "non-finite loss {} on epoch {} batch {}, update skipped",
                        batch_loss, epoch, index
                    );
                }
                history.record_batch(BatchEvent {
                    epoch,
                    batch: index,
                    loss: batch_loss,
                    metric: batch_metric,
                    anomaly: !applied,
                });
                if applied {
                    loss_sum += batch_loss;
                    metric_sum += batch_metric;
                    completed += 1;
                }
            }
            let (epoch_loss, epoch_metric) = if completed > 0 {
                (loss_sum / completed as f64, metric_sum / completed as f64)
            } else {
                (0.0, 0.0)
            };
            let (val_loss, val_metric) = match validation {
                Some((val_data, val_batch)) => {
                    let result = self.evaluate(val_data, val_batch)?;
                    (Some(result.loss), Some(result.metric))
                }
                None => (None, None),
            };
            debug!(
                "epoch {}: loss {:.6}, {} {:.6}",
                epoch,
                epoch_loss,
                metric.name(),
                epoch_metric
            );
            history.record_epoch(EpochEvent {
                epoch,
                loss: epoch_loss,
                metric: epoch_metric,
                val_loss,
                val_metric,
            });
        }
        self.stop.store(false, Ordering::Relaxed);
        Ok(history)
    }

    /// One atomic training step: forward, loss, backward, update. Returns
    /// `(loss, metric, applied)`; on a numeric anomaly nothing is applied.
    fn train_batch(
        &mut self,
        batch: &Batch,
        input_dims: &[usize],
        loss: Loss,
        metric: Metric,
        optimizer: &Optimizer,
    ) -> Result<(f64, f64, bool)> {
        let x = self.batch_input(batch, input_dims)?;
        let (outputs, caches) = Self::run_forward(
            &self.layers,
            &self.wiring,
            &self.graph,
            &x,
            Mode::Train,
            &mut self.rng,
        )?;
        let y_hat = Self::output_as_2d(&outputs)?;
        let (data_loss, da) = criteria(&y_hat, &batch.y, loss)?;
        let mut penalty = 0.0;
        for layer in &self.layers {
            penalty += layer.regularization_penalty(&self.graph)?;
        }
        let total_loss = data_loss + penalty;
        let metric_value = metric.evaluate(&y_hat, &batch.y);
        if !total_loss.is_finite() {
            return Ok((total_loss, metric_value, false));
        }

        let mut grads = Self::run_backward(
            &self.layers,
            &self.wiring,
            &self.graph,
            &outputs,
            &caches,
            da.into_dyn(),
        )?;
        for layer in &self.layers {
            for (var, reg) in layer.regularized_variables() {
                let reg_grad = reg.grad(self.graph.data(&var)?);
                match grads.entry(var) {
                    Entry::Occupied(mut e) => *e.get_mut() += &reg_grad,
                    Entry::Vacant(e) => {
                        e.insert(reg_grad);
                    }
                }
            }
        }
        for (layer, cache) in self.layers.iter().zip(&caches) {
            if let Some(cache) = cache {
                layer.fold_batch_stats(&mut self.graph, cache)?;
            }
        }

        self.step += 1;
        let step = self.step;
        let targets: Vec<String> = self
            .graph
            .layer_variables()
            .filter(|v| v.trainable && !self.graph.is_frozen(&v.name))
            .map(|v| v.name.clone())
            .collect();
        for name in targets {
            if let Some(grad) = grads.remove(&name) {
                optimizer.apply(step, &mut self.graph, &name, grad)?;
            }
        }
        Ok((total_loss, metric_value, true))
    }

    /// Forward-only mean loss and metric over all full batches.
    pub fn evaluate(&self, dataset: &dyn Dataset, batch_size: usize) -> Result<EvaluationResult> {
        self.require_at_least(ModelState::Initialized, "evaluate")?;
        if batch_size == 0 {
            return Err(ModelError::Config("batch size must be positive".into()));
        }
        let loss = self.loss.ok_or(ModelError::Internal("loss missing after compile"))?;
        let metric = self
            .metric
            .ok_or(ModelError::Internal("metric missing after compile"))?;
        let (input_elements, label_elements) = self.io_elements()?;
        let input_dims = self.input_dims()?;
        let mut penalty = 0.0;
        for layer in &self.layers {
            penalty += layer.regularization_penalty(&self.graph)?;
        }

        let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
        let mut loss_sum = 0.0;
        let mut metric_sum = 0.0;
        let mut batches = 0usize;
        for batch in Batches::new(dataset, batch_size) {
            batch.check(input_elements, label_elements)?;
            let x = self.batch_input(&batch, &input_dims)?;
            let (outputs, _) = Self::run_forward(
                &self.layers,
                &self.wiring,
                &self.graph,
                &x,
                Mode::Infer,
                &mut rng,
            )?;
            let y_hat = Self::output_as_2d(&outputs)?;
            let (data_loss, _) = criteria(&y_hat, &batch.y, loss)?;
            loss_sum += data_loss + penalty;
            metric_sum += metric.evaluate(&y_hat, &batch.y);
            batches += 1;
        }
        let divisor = batches.max(1) as f64;
        Ok(EvaluationResult {
            loss: loss_sum / divisor,
            metric_name: metric.name(),
            metric: metric_sum / divisor,
        })
    }

    fn forward_single(&self, input: &[f64]) -> Result<Vec<ArrayD<f64>>> {
        self.require_at_least(ModelState::Initialized, "predict")?;
        let (input_elements, _) = self.io_elements()?;
        if input.len() != input_elements {
            return Err(ModelError::Shape(format!(
                "input holds {} values, the model expects {}",
                input.len(),
                input_elements
            )));
        }
        let input_dims = self.input_dims()?;
        let mut dims = Vec::with_capacity(input_dims.len() + 1);
        dims.push(1);
        dims.extend_from_slice(&input_dims);
        let x = Array2::from_shape_vec((1, input.len()), input.to_vec())
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let x = reshape(&x.into_dyn(), &dims)?;
        let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
        let (outputs, _) = Self::run_forward(
            &self.layers,
            &self.wiring,
            &self.graph,
            &x,
            Mode::Infer,
            &mut rng,
        )?;
        Ok(outputs)
    }

    /// Raw per-class scores for a single example.
    pub fn predict_softly(&self, input: &[f64]) -> Result<Vec<f64>> {
        let outputs = self.forward_single(input)?;
        let y_hat = Self::output_as_2d(&outputs)?;
        Ok(y_hat.row(0).to_vec())
    }

    /// Arg-max class index for a single example.
    pub fn predict(&self, input: &[f64]) -> Result<usize> {
        let scores = self.predict_softly(input)?;
        Ok(argmax(&scores))
    }

    /// Prediction plus every intermediate layer's activation (the final
    /// layer is skipped), for external introspection.
    pub fn predict_and_get_activations(
        &self,
        input: &[f64],
    ) -> Result<(usize, Vec<(String, ArrayD<f64>)>)> {
        let outputs = self.forward_single(input)?;
        let y_hat = Self::output_as_2d(&outputs)?;
        let prediction = argmax(y_hat.row(0).as_slice().unwrap_or(&[]));
        let activations = self
            .layers
            .iter()
            .zip(outputs.iter())
            .take(self.layers.len().saturating_sub(1))
            .map(|(layer, out)| (layer.name.clone(), out.clone()))
            .collect();
        Ok((prediction, activations))
    }

    /// Formatted architecture table with per-layer output shapes and
    /// parameter counts.
    pub fn summary(&self) -> Result<String> {
        self.require_at_least(ModelState::Compiled, "summarize")?;
        let mut total = 0usize;
        let mut frozen = 0usize;
        let mut out = String::from("\nModel\n");
        out.push_str("-------------------------------------------------------------\n");
        out.push_str("Layer (Type)\t\t Output shape\t\t No.of params\n");
        for layer in &self.layers {
            let built = self
                .graph
                .built(&layer.name)
                .ok_or(ModelError::Internal("layer not built after compile"))?;
            total += built.param_count;
            if !layer.trainable {
                frozen += built.param_count;
            }
            out.push_str(&format!(
                "{} ({})\t\t {}\t\t {}\n",
                layer.name,
                layer.kind_tag(),
                built.output_shape,
                built.param_count
            ));
        }
        out.push_str("-------------------------------------------------------------\n");
        out.push_str(&format!("Total params: {}\n", total));
        out.push_str(&format!("Trainable params: {}\n", total - frozen));
        out.push_str(&format!("Frozen params: {}\n", frozen));
        Ok(out)
    }

    fn prepare_directory(&self, directory: &Path, mode: WritingMode) -> Result<()> {
        if directory.exists() {
            match mode {
                WritingMode::FailIfExists => {
                    return Err(ModelError::Persistence {
                        path: directory.to_path_buf(),
                        detail: "directory already exists".into(),
                    })
                }
                WritingMode::Override => {
                    fs::remove_dir_all(directory)?;
                    fs::create_dir_all(directory)?;
                }
                WritingMode::Append => {}
            }
        } else {
            fs::create_dir_all(directory)?;
        }
        Ok(())
    }

    /// Persists the graph definition and/or named variables under
    /// `directory`, honoring the collision policy.
    pub fn save(
        &self,
        directory: &Path,
        format: SaveFormat,
        save_optimizer_state: bool,
        mode: WritingMode,
    ) -> Result<()> {
        self.require_at_least(ModelState::Initialized, "save")?;
        if save_optimizer_state {
            self.require_at_least(ModelState::OptimizerInitialized, "save optimizer state")?;
        }
        self.prepare_directory(directory, mode)?;

        match format {
            SaveFormat::GraphDef | SaveFormat::GraphDefCustomVariables => {
                let def = GraphDef {
                    layers: self.layers.clone(),
                    edges: self
                        .layers
                        .iter()
                        .map(|l| (l.name.clone(), self.graph.inbound_of(&l.name).to_vec()))
                        .collect(),
                };
                let encoded = bincode::serialize(&def)?;
                fs::write(directory.join(GRAPH_DEF_FILE), encoded)?;
            }
            SaveFormat::JsonConfigCustomVariables => {
                let json = config::model_to_json(self)?;
                fs::write(directory.join(MODEL_CONFIG_FILE), json)?;
            }
        }

        if format == SaveFormat::GraphDef {
            return Ok(());
        }
        let mut names: Vec<String> = self.variable_names();
        if save_optimizer_state {
            names.extend(
                self.graph
                    .optimizer_variables()
                    .filter(|v| !self.graph.is_frozen(&v.name))
                    .map(|v| v.name.clone()),
            );
        }
        let manifest = File::create(directory.join(VARIABLE_MANIFEST))?;
        let mut manifest = BufWriter::new(manifest);
        for name in &names {
            writeln!(manifest, "{}", name)?;
        }
        manifest.flush()?;
        for name in &names {
            let data = self.graph.data(name)?;
            let file = File::create(directory.join(format!("{}.txt", name)))?;
            let mut writer = BufWriter::new(file);
            for value in data.iter() {
                write!(writer, "{} ", value)?;
            }
            writer.flush()?;
        }
        info!(
            "saved {} variables to {}",
            names.len(),
            directory.display()
        );
        Ok(())
    }

    /// Restores named variables from a save directory onto a compiled,
    /// still-uninitialized model.
    pub fn load_weights(&mut self, directory: &Path, load_optimizer_state: bool) -> Result<()> {
        match self.state {
            ModelState::Uncompiled => {
                return Err(ModelError::Lifecycle {
                    expected: ModelState::Compiled,
                    actual: self.state,
                    op: "load weights",
                })
            }
            ModelState::Compiled => {}
            _ => {
                return Err(ModelError::Lifecycle {
                    expected: ModelState::Compiled,
                    actual: self.state,
                    op: "load weights",
                })
            }
        }
        let manifest_path = directory.join(VARIABLE_MANIFEST);
        if !manifest_path.exists() {
            return Err(ModelError::Persistence {
                path: manifest_path,
                detail: "variable names manifest not found".into(),
            });
        }
        let manifest = BufReader::new(File::open(&manifest_path)?);
        for line in manifest.lines() {
            let name = line?;
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if name.starts_with(OPTIMIZER_PREFIX) {
                if !load_optimizer_state {
                    continue;
                }
                // slots for frozen layers (or slots this optimizer doesn't
                // keep) are skipped, never loaded
                if self.graph.var(name).is_none() || self.graph.is_frozen(name) {
                    debug!("skipping optimizer state {}", name);
                    continue;
                }
            } else if self.graph.var(name).is_none() {
                return Err(ModelError::Persistence {
                    path: directory.to_path_buf(),
                    detail: format!("variable {} is not expected by the compiled model", name),
                });
            }
            let data = self.read_variable(directory, name)?;
            self.graph.set_data(name, data)?;
        }
        for v in self.graph.layer_variables() {
            if !v.has_data() {
                return Err(ModelError::Persistence {
                    path: directory.to_path_buf(),
                    detail: format!("variable {} missing from the saved artifact", v.name),
                });
            }
        }
        self.state = ModelState::Initialized;
        if load_optimizer_state {
            let mut slots = 0usize;
            let mut loaded = 0usize;
            for v in self.graph.optimizer_variables() {
                slots += 1;
                if v.has_data() {
                    loaded += 1;
                }
            }
            if slots > 0 && slots == loaded {
                self.state = ModelState::OptimizerInitialized;
            }
        }
        info!("loaded weights from {}", directory.display());
        Ok(())
    }

    fn read_variable(&self, directory: &Path, name: &str) -> Result<ArrayD<f64>> {
        let path = directory.join(format!("{}.txt", name));
        if !path.exists() {
            return Err(ModelError::Persistence {
                path,
                detail: "variable file not found".into(),
            });
        }
        let text = fs::read_to_string(&path)?;
        let mut values = Vec::new();
        for token in text.split_whitespace() {
            values.push(token.parse::<f64>().map_err(|_| ModelError::Persistence {
                path: path.clone(),
                detail: format!("malformed value {:?}", token),
            })?);
        }
        let var = self
            .graph
            .var(name)
            .ok_or(ModelError::Internal("variable disappeared during load"))?;
        if values.len() != var.elements() {
            return Err(ModelError::Persistence {
                path,
                detail: format!(
                    "variable {} holds {} values, the compiled model expects {}",
                    name,
                    values.len(),
                    var.elements()
                ),
            });
        }
        ArrayD::from_shape_vec(ndarray::IxDyn(&var.shape), values)
            .map_err(|e| ModelError::Shape(e.to_string()))
    }
}
