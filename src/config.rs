//! Keras-style declarative model configuration: deserialization into layer
//! graphs and the mirror serialization used by the JSON-config save format.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::core::activations::Activation;
use crate::core::initializers::{FanMode, Initializer, VarianceDistribution, DEFAULT_SEED};
use crate::core::layers::{
    ActivationLayer, BatchNorm, Conv1D, Conv2D, Conv2DTranspose, Dropout, Elu, GlobalAvgPool2D,
    Layer, LayerKind, LeakyReLU, Merge, MergeOp, Pool2D, ReLU, Reshape, ZeroPadding2D,
};
use crate::core::regularizers::Regularizer;
use crate::core::shape::ConvPadding;
use crate::error::{ModelError, Result};
use crate::models::Model;

#[derive(Deserialize)]
struct KerasModel {
    #[serde(default)]
    #[allow(dead_code)]
    class_name: Option<String>,
    config: KerasModelConfig,
    #[serde(default)]
    #[allow(dead_code)]
    keras_version: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    backend: Option<String>,
}

#[derive(Deserialize)]
struct KerasModelConfig {
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
    layers: Vec<KerasLayerEntry>,
}

#[derive(Deserialize)]
struct KerasLayerEntry {
    class_name: String,
    config: KerasLayerConfig,
    #[serde(default)]
    inbound_nodes: Option<Value>,
}

/// Kind-specific config bag; every field optional so partially-specified
/// external configs parse and are validated per layer kind afterwards.
#[derive(Deserialize, Default)]
#[serde(default)]
struct KerasLayerConfig {
    name: Option<String>,
    trainable: Option<bool>,
    batch_input_shape: Option<Vec<Option<usize>>>,
    units: Option<usize>,
    activation: Option<String>,
    use_bias: Option<bool>,
    kernel_initializer: Option<KerasInitializer>,
    bias_initializer: Option<KerasInitializer>,
    kernel_regularizer: Option<KerasRegularizer>,
    bias_regularizer: Option<KerasRegularizer>,
    filters: Option<usize>,
    kernel_size: Option<Vec<usize>>,
    strides: Option<Vec<usize>>,
    dilation_rate: Option<Vec<usize>>,
    padding: Option<KerasPadding>,
    output_padding: Option<Vec<usize>>,
    pool_size: Option<Vec<usize>>,
    rate: Option<f64>,
    target_shape: Option<Vec<usize>>,
    axis: Option<Value>,
    momentum: Option<f64>,
    epsilon: Option<f64>,
    center: Option<bool>,
    scale: Option<bool>,
    beta_initializer: Option<KerasInitializer>,
    gamma_initializer: Option<KerasInitializer>,
    moving_mean_initializer: Option<KerasInitializer>,
    moving_variance_initializer: Option<KerasInitializer>,
    alpha: Option<f64>,
    negative_slope: Option<f64>,
    max_value: Option<f64>,
    threshold: Option<f64>,
}

/// Padding sum type: the symbolic schemes plus explicit 2-D amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KerasPadding {
    Valid,
    Same,
    Full,
    Explicit((usize, usize), (usize, usize)),
}

impl<'de> Deserialize<'de> for KerasPadding {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(s) => match s.as_str() {
                "valid" => Ok(KerasPadding::Valid),
                "same" => Ok(KerasPadding::Same),
                "full" => Ok(KerasPadding::Full),
                other => Err(D::Error::custom(format!("unknown padding {:?}", other))),
            },
            Value::Number(n) => {
                let p = n
                    .as_u64()
                    .ok_or_else(|| D::Error::custom("padding amount must be a non-negative integer"))?
                    as usize;
                Ok(KerasPadding::Explicit((p, p), (p, p)))
            }
            Value::Array(items) => {
                let axis = |v: &Value| -> std::result::Result<(usize, usize), D::Error> {
                    match v {
                        Value::Number(n) => {
                            let p = n.as_u64().ok_or_else(|| {
                                D::Error::custom("padding amount must be a non-negative integer")
                            })? as usize;
                            Ok((p, p))
                        }
                        Value::Array(pair) if pair.len() == 2 => {
                            let a = pair[0].as_u64().ok_or_else(|| {
                                D::Error::custom("padding amount must be a non-negative integer")
                            })? as usize;
                            let b = pair[1].as_u64().ok_or_else(|| {
                                D::Error::custom("padding amount must be a non-negative integer")
                            })? as usize;
                            Ok((a, b))
                        }
                        _ => Err(D::Error::custom("malformed padding entry")),
                    }
                };
                match items.len() {
                    2 => Ok(KerasPadding::Explicit(axis(&items[0])?, axis(&items[1])?)),
                    _ => Err(D::Error::custom("2-D padding needs two axis entries")),
                }
            }
            _ => Err(D::Error::custom("malformed padding descriptor")),
        }
    }
}

#[derive(Deserialize)]
struct KerasInitializer {
    class_name: String,
    #[serde(default)]
    config: KerasInitializerConfig,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct KerasInitializerConfig {
    seed: Option<u64>,
    minval: Option<f64>,
    maxval: Option<f64>,
    mean: Option<f64>,
    stddev: Option<f64>,
    value: Option<f64>,
    scale: Option<f64>,
    mode: Option<String>,
    distribution: Option<String>,
}

#[derive(Deserialize)]
struct KerasRegularizer {
    class_name: String,
    #[serde(default)]
    config: KerasRegularizerConfig,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct KerasRegularizerConfig {
    l1: Option<f64>,
    l2: Option<f64>,
}

/// Caller-owned construction context: running auto-name counter for unnamed
/// entries.
#[derive(Default)]
struct BuildContext {
    counter: usize,
}

impl BuildContext {
    fn name_for(&mut self, tag: &str, given: Option<&str>) -> String {
        match given {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                self.counter += 1;
                format!("{}_{}", tag.to_lowercase(), self.counter)
            }
        }
    }
}

fn require<T>(value: Option<T>, layer: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        ModelError::Config(format!("layer {} missing required field {}", layer, field))
    })
}

fn pair(values: &[usize], layer: &str, field: &str) -> Result<(usize, usize)> {
    match values {
        [v] => Ok((*v, *v)),
        [a, b] => Ok((*a, *b)),
        _ => Err(ModelError::Config(format!(
            "layer {} field {} needs one or two extents, got {:?}",
            layer, field, values
        ))),
    }
}

fn scalar(values: &[usize], layer: &str, field: &str) -> Result<usize> {
    match values {
        [v] => Ok(*v),
        _ => Err(ModelError::Config(format!(
            "layer {} field {} needs exactly one extent, got {:?}",
            layer, field, values
        ))),
    }
}

fn convert_activation(id: &str) -> Result<Activation> {
    Ok(match id {
        "linear" => Activation::Linear,
        "relu" => Activation::Relu,
        "sigmoid" => Activation::Sigmoid,
        "tanh" => Activation::Tanh,
        "softmax" => Activation::Softmax,
        "log_softmax" => Activation::LogSoftmax,
        "elu" => Activation::Elu,
        "selu" => Activation::Selu,
        "softplus" => Activation::Softplus,
        "softsign" => Activation::Softsign,
        "exponential" => Activation::Exponential,
        "hard_sigmoid" => Activation::HardSigmoid,
        "swish" => Activation::Swish,
        "mish" => Activation::Mish,
        other => return Err(ModelError::UnsupportedActivation(other.to_string())),
    })
}

fn activation_id(activation: Activation) -> &'static str {
    match activation {
        Activation::Linear => "linear",
        Activation::Relu => "relu",
        Activation::Sigmoid => "sigmoid",
        Activation::Tanh => "tanh",
        Activation::Softmax => "softmax",
        Activation::LogSoftmax => "log_softmax",
        Activation::Elu => "elu",
        Activation::Selu => "selu",
        Activation::Softplus => "softplus",
        Activation::Softsign => "softsign",
        Activation::Exponential => "exponential",
        Activation::HardSigmoid => "hard_sigmoid",
        Activation::Swish => "swish",
        Activation::Mish => "mish",
    }
}

fn convert_initializer(descriptor: &KerasInitializer) -> Result<Initializer> {
    let cfg = &descriptor.config;
    let seed = cfg.seed.unwrap_or(DEFAULT_SEED);
    Ok(match descriptor.class_name.as_str() {
        "Zeros" => Initializer::Zeros,
        "Ones" => Initializer::Ones,
        "Constant" => Initializer::Constant(cfg.value.unwrap_or(0.0)),
        "RandomUniform" => Initializer::RandomUniform {
            min: cfg.minval.unwrap_or(-0.05),
            max: cfg.maxval.unwrap_or(0.05),
            seed,
        },
        "RandomNormal" => Initializer::RandomNormal {
            mean: cfg.mean.unwrap_or(0.0),
            stdev: cfg.stddev.unwrap_or(0.05),
            seed,
        },
        "TruncatedNormal" => Initializer::TruncatedNormal {
            stdev: cfg.stddev.unwrap_or(0.05),
            seed,
        },
        "GlorotUniform" => Initializer::GlorotUniform { seed },
        "GlorotNormal" => Initializer::GlorotNormal { seed },
        "HeUniform" => Initializer::HeUniform { seed },
        "HeNormal" => Initializer::HeNormal { seed },
        "LeCunUniform" => Initializer::LeCunUniform { seed },
        "LeCunNormal" => Initializer::LeCunNormal { seed },
        "VarianceScaling" => {
            let scale = cfg.scale.unwrap_or(1.0);
            let mode = match cfg.mode.as_deref().unwrap_or("fan_in") {
                "fan_in" => FanMode::FanIn,
                "fan_out" => FanMode::FanOut,
                "fan_avg" => FanMode::FanAvg,
                other => {
                    return Err(ModelError::UnsupportedInitializer(format!(
                        "VarianceScaling mode {}",
                        other
                    )))
                }
            };
            let distribution = match cfg.distribution.as_deref().unwrap_or("truncated_normal") {
                "uniform" => VarianceDistribution::Uniform,
                "truncated_normal" | "normal" => VarianceDistribution::TruncatedNormal,
                "untruncated_normal" => VarianceDistribution::UntruncatedNormal,
                other => {
                    return Err(ModelError::UnsupportedInitializer(format!(
                        "VarianceScaling distribution {}",
                        other
                    )))
                }
            };
            // exact triples collapse to their named equivalents
            match (scale, mode, distribution) {
                (s, FanMode::FanIn, VarianceDistribution::TruncatedNormal) if s == 2.0 => {
                    Initializer::HeNormal { seed }
                }
                (s, FanMode::FanIn, VarianceDistribution::Uniform) if s == 2.0 => {
                    Initializer::HeUniform { seed }
                }
                (s, FanMode::FanIn, VarianceDistribution::TruncatedNormal) if s == 1.0 => {
                    Initializer::LeCunNormal { seed }
                }
                (s, FanMode::FanIn, VarianceDistribution::Uniform) if s == 1.0 => {
                    Initializer::LeCunUniform { seed }
                }
                (s, FanMode::FanAvg, VarianceDistribution::TruncatedNormal) if s == 1.0 => {
                    Initializer::GlorotNormal { seed }
                }
                (s, FanMode::FanAvg, VarianceDistribution::Uniform) if s == 1.0 => {
                    Initializer::GlorotUniform { seed }
                }
                _ => Initializer::VarianceScaling {
                    scale,
                    mode,
                    distribution,
                    seed,
                },
            }
        }
        other => return Err(ModelError::UnsupportedInitializer(other.to_string())),
    })
}

fn convert_regularizer(descriptor: &KerasRegularizer) -> Result<Regularizer> {
    match descriptor.class_name.as_str() {
        "L1" | "L2" | "L1L2" => Ok(Regularizer::from_l1_l2(
            descriptor.config.l1.unwrap_or(0.0),
            descriptor.config.l2.unwrap_or(0.0),
        )),
        other => Err(ModelError::UnsupportedRegularizer(other.to_string())),
    }
}

fn conv_padding(
    padding: Option<&KerasPadding>,
    layer: &str,
) -> Result<ConvPadding> {
    match padding {
        None | Some(KerasPadding::Valid) => Ok(ConvPadding::Valid),
        Some(KerasPadding::Same) => Ok(ConvPadding::Same),
        Some(KerasPadding::Full) => Ok(ConvPadding::Full),
        Some(KerasPadding::Explicit(..)) => Err(ModelError::Config(format!(
            "layer {}: explicit padding amounts only apply to zero-padding layers",
            layer
        ))),
    }
}

fn activation_of(cfg: &KerasLayerConfig) -> Result<Activation> {
    convert_activation(cfg.activation.as_deref().unwrap_or("linear"))
}

fn initializer_of(
    descriptor: Option<&KerasInitializer>,
    fallback: Initializer,
) -> Result<Initializer> {
    match descriptor {
        Some(d) => convert_initializer(d),
        None => Ok(fallback),
    }
}

fn regularizer_of(descriptor: Option<&KerasRegularizer>) -> Result<Regularizer> {
    match descriptor {
        Some(d) => convert_regularizer(d),
        None => Ok(Regularizer::None),
    }
}

fn axis_of(cfg: &KerasLayerConfig, default: isize) -> isize {
    match &cfg.axis {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as isize).unwrap_or(default),
        Some(Value::Array(items)) => items
            .first()
            .and_then(Value::as_i64)
            .map(|v| v as isize)
            .unwrap_or(default),
        _ => default,
    }
}

/// Feature extents synthesized from a declared batch-input shape: rank 3
/// configs describe a two-axis input, rank 4 a three-axis one.
fn input_dims_of(entry: &KerasLayerEntry, name: &str) -> Result<Vec<usize>> {
    let batch_shape = require(entry.config.batch_input_shape.as_ref(), name, "batch_input_shape")?;
    let dims: Vec<usize> = batch_shape.iter().skip(1).flatten().copied().collect();
    if dims.is_empty() || dims.len() + 1 != batch_shape.len() {
        return Err(ModelError::Config(format!(
            "layer {} declares a malformed batch_input_shape {:?}",
            name, batch_shape
        )));
    }
    Ok(dims)
}

fn convert_layer(ctx: &mut BuildContext, entry: &KerasLayerEntry) -> Result<Layer> {
    let tag = entry.class_name.as_str();
    let cfg = &entry.config;
    let name = ctx.name_for(tag, cfg.name.as_deref());
    let kind = match tag {
        "InputLayer" => {
            let dims = input_dims_of(entry, &name)?;
            LayerKind::Input(crate::core::layers::Input::new(&dims))
        }
        "Dense" => LayerKind::Dense(crate::core::layers::Dense {
            units: require(cfg.units, &name, "units")?,
            activation: activation_of(cfg)?,
            use_bias: cfg.use_bias.unwrap_or(true),
            kernel_initializer: initializer_of(
                cfg.kernel_initializer.as_ref(),
                Initializer::glorot_uniform(),
            )?,
            bias_initializer: initializer_of(cfg.bias_initializer.as_ref(), Initializer::Zeros)?,
            kernel_regularizer: regularizer_of(cfg.kernel_regularizer.as_ref())?,
            bias_regularizer: regularizer_of(cfg.bias_regularizer.as_ref())?,
        }),
        "Conv1D" => {
            let kernel = scalar(
                &require(cfg.kernel_size.clone(), &name, "kernel_size")?,
                &name,
                "kernel_size",
            )?;
            LayerKind::Conv1D(Conv1D {
                filters: require(cfg.filters, &name, "filters")?,
                kernel_size: kernel,
                strides: cfg
                    .strides
                    .as_deref()
                    .map(|s| scalar(s, &name, "strides"))
                    .transpose()?
                    .unwrap_or(1),
                dilations: cfg
                    .dilation_rate
                    .as_deref()
                    .map(|d| scalar(d, &name, "dilation_rate"))
                    .transpose()?
                    .unwrap_or(1),
                padding: conv_padding(cfg.padding.as_ref(), &name)?,
                activation: activation_of(cfg)?,
                use_bias: cfg.use_bias.unwrap_or(true),
                kernel_initializer: initializer_of(
                    cfg.kernel_initializer.as_ref(),
                    Initializer::glorot_uniform(),
                )?,
                bias_initializer: initializer_of(cfg.bias_initializer.as_ref(), Initializer::Zeros)?,
                kernel_regularizer: regularizer_of(cfg.kernel_regularizer.as_ref())?,
                bias_regularizer: regularizer_of(cfg.bias_regularizer.as_ref())?,
            })
        }
        "Conv2D" => {
            let kernel = pair(
                &require(cfg.kernel_size.clone(), &name, "kernel_size")?,
                &name,
                "kernel_size",
            )?;
            LayerKind::Conv2D(Conv2D {
                filters: require(cfg.filters, &name, "filters")?,
                kernel_size: kernel,
                strides: cfg
                    .strides
                    .as_deref()
                    .map(|s| pair(s, &name, "strides"))
                    .transpose()?
                    .unwrap_or((1, 1)),
                dilations: cfg
                    .dilation_rate
                    .as_deref()
                    .map(|d| pair(d, &name, "dilation_rate"))
                    .transpose()?
                    .unwrap_or((1, 1)),
                padding: conv_padding(cfg.padding.as_ref(), &name)?,
                activation: activation_of(cfg)?,
                use_bias: cfg.use_bias.unwrap_or(true),
                kernel_initializer: initializer_of(
                    cfg.kernel_initializer.as_ref(),
                    Initializer::glorot_uniform(),
                )?,
                bias_initializer: initializer_of(cfg.bias_initializer.as_ref(), Initializer::Zeros)?,
                kernel_regularizer: regularizer_of(cfg.kernel_regularizer.as_ref())?,
                bias_regularizer: regularizer_of(cfg.bias_regularizer.as_ref())?,
            })
        }
        "Conv2DTranspose" => {
            let kernel = pair(
                &require(cfg.kernel_size.clone(), &name, "kernel_size")?,
                &name,
                "kernel_size",
            )?;
            LayerKind::Conv2DTranspose(Conv2DTranspose {
                filters: require(cfg.filters, &name, "filters")?,
                kernel_size: kernel,
                strides: cfg
                    .strides
                    .as_deref()
                    .map(|s| pair(s, &name, "strides"))
                    .transpose()?
                    .unwrap_or((1, 1)),
                dilations: cfg
                    .dilation_rate
                    .as_deref()
                    .map(|d| pair(d, &name, "dilation_rate"))
                    .transpose()?
                    .unwrap_or((1, 1)),
                padding: conv_padding(cfg.padding.as_ref(), &name)?,
                output_padding: cfg
                    .output_padding
                    .as_deref()
                    .map(|p| pair(p, &name, "output_padding"))
                    .transpose()?,
                activation: activation_of(cfg)?,
                use_bias: cfg.use_bias.unwrap_or(true),
                kernel_initializer: initializer_of(
                    cfg.kernel_initializer.as_ref(),
                    Initializer::glorot_uniform(),
                )?,
                bias_initializer: initializer_of(cfg.bias_initializer.as_ref(), Initializer::Zeros)?,
                kernel_regularizer: regularizer_of(cfg.kernel_regularizer.as_ref())?,
                bias_regularizer: regularizer_of(cfg.bias_regularizer.as_ref())?,
            })
        }
        "MaxPooling2D" | "AveragePooling2D" => {
            let pool_size = cfg
                .pool_size
                .as_deref()
                .map(|p| pair(p, &name, "pool_size"))
                .transpose()?
                .unwrap_or((2, 2));
            let pool = Pool2D {
                pool_size,
                strides: cfg
                    .strides
                    .as_deref()
                    .map(|s| pair(s, &name, "strides"))
                    .transpose()?
                    .unwrap_or(pool_size),
                padding: conv_padding(cfg.padding.as_ref(), &name)?,
            };
            if tag == "MaxPooling2D" {
                LayerKind::MaxPool2D(pool)
            } else {
                LayerKind::AvgPool2D(pool)
            }
        }
        "GlobalAveragePooling2D" => LayerKind::GlobalAvgPool2D(GlobalAvgPool2D),
        "BatchNormalization" => LayerKind::BatchNorm(BatchNorm {
            axis: axis_of(cfg, -1),
            momentum: cfg.momentum.unwrap_or(0.99),
            epsilon: cfg.epsilon.unwrap_or(1e-3),
            center: cfg.center.unwrap_or(true),
            scale: cfg.scale.unwrap_or(true),
            beta_initializer: initializer_of(cfg.beta_initializer.as_ref(), Initializer::Zeros)?,
            gamma_initializer: initializer_of(cfg.gamma_initializer.as_ref(), Initializer::Ones)?,
            moving_mean_initializer: initializer_of(
                cfg.moving_mean_initializer.as_ref(),
                Initializer::Zeros,
            )?,
            moving_variance_initializer: initializer_of(
                cfg.moving_variance_initializer.as_ref(),
                Initializer::Ones,
            )?,
        }),
        "Dropout" => LayerKind::Dropout(Dropout::new(require(cfg.rate, &name, "rate")?)),
        "Flatten" => LayerKind::Flatten,
        "Reshape" => LayerKind::Reshape(Reshape {
            target: require(cfg.target_shape.clone(), &name, "target_shape")?,
        }),
        "ZeroPadding2D" => match cfg.padding.as_ref() {
            Some(KerasPadding::Explicit(rows, cols)) => {
                LayerKind::ZeroPadding2D(ZeroPadding2D::new((*rows, *cols)))
            }
            _ => {
                return Err(ModelError::Config(format!(
                    "layer {} needs explicit padding amounts",
                    name
                )))
            }
        },
        "Activation" => LayerKind::Activation(ActivationLayer::new(convert_activation(
            require(cfg.activation.as_deref(), &name, "activation")?,
        )?)),
        "ReLU" => LayerKind::ReLU(ReLU {
            alpha: cfg.negative_slope.or(cfg.alpha).unwrap_or(0.0),
            max_value: cfg.max_value,
            threshold: cfg.threshold.unwrap_or(0.0),
        }),
        "ELU" => LayerKind::Elu(Elu {
            alpha: cfg.alpha.unwrap_or(1.0),
        }),
        "LeakyReLU" => LayerKind::LeakyReLU(LeakyReLU {
            alpha: cfg.alpha.unwrap_or(0.3),
        }),
        "Add" => LayerKind::Merge(Merge::new(MergeOp::Add)),
        "Subtract" => LayerKind::Merge(Merge::new(MergeOp::Subtract)),
        "Multiply" => LayerKind::Merge(Merge::new(MergeOp::Multiply)),
        "Average" => LayerKind::Merge(Merge::new(MergeOp::Average)),
        "Maximum" => LayerKind::Merge(Merge::new(MergeOp::Maximum)),
        "Minimum" => LayerKind::Merge(Merge::new(MergeOp::Minimum)),
        "Concatenate" => LayerKind::Merge(Merge {
            op: MergeOp::Concatenate,
            axis: axis_of(cfg, -1),
        }),
        other => return Err(ModelError::UnsupportedLayer(other.to_string())),
    };
    Ok(Layer {
        name,
        trainable: cfg.trainable.unwrap_or(true),
        kind,
    })
}

/// Collects the layer-name strings out of an inbound-node descriptor,
/// whatever its nesting; kwargs objects are not descended into.
fn inbound_names(value: Option<&Value>) -> Vec<String> {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => {
                for item in items {
                    collect(item, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    if let Some(v) = value {
        collect(v, &mut out);
    }
    out
}

/// Linear construction mode: layers chained implicitly in file order; the
/// first non-input entry's declared batch shape synthesizes the Input layer.
pub fn sequential_from_json(json: &str) -> Result<Model> {
    let parsed: KerasModel = serde_json::from_str(json)?;
    if parsed.config.layers.is_empty() {
        return Err(ModelError::Config("model config declares no layers".into()));
    }
    let mut ctx = BuildContext::default();
    let mut layers = Vec::with_capacity(parsed.config.layers.len() + 1);
    for (i, entry) in parsed.config.layers.iter().enumerate() {
        if i == 0 && entry.class_name != "InputLayer" {
            let probe = ctx.name_for(&entry.class_name, entry.config.name.as_deref());
            let dims = input_dims_of(entry, &probe)?;
            layers.push(Layer::input(format!("{}_input", probe), &dims));
            // the probe name is reused for the converted entry below
            ctx.counter = ctx.counter.saturating_sub(1);
        }
        layers.push(convert_layer(&mut ctx, entry)?);
    }
    Model::sequential(layers)
}

/// Graph construction mode: inbound-node references resolved against the
/// names declared so far.
pub fn functional_from_json(json: &str) -> Result<Model> {
    let parsed: KerasModel = serde_json::from_str(json)?;
    if parsed.config.layers.is_empty() {
        return Err(ModelError::Config("model config declares no layers".into()));
    }
    let mut ctx = BuildContext::default();
    let mut layers = Vec::with_capacity(parsed.config.layers.len());
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for entry in &parsed.config.layers {
        let layer = convert_layer(&mut ctx, entry)?;
        let inbound = inbound_names(entry.inbound_nodes.as_ref());
        if !matches!(layer.kind, LayerKind::Input(_)) && inbound.is_empty() {
            return Err(ModelError::Config(format!(
                "layer {} declares no inbound nodes",
                layer.name
            )));
        }
        edges.insert(layer.name.clone(), inbound);
        layers.push(layer);
    }
    Model::graph(layers, edges)
}

pub fn load_sequential_config(path: &Path) -> Result<Model> {
    sequential_from_json(&fs::read_to_string(path)?)
}

pub fn load_functional_config(path: &Path) -> Result<Model> {
    functional_from_json(&fs::read_to_string(path)?)
}

fn initializer_to_json(init: &Initializer) -> Value {
    match init {
        Initializer::Zeros => json!({"class_name": "Zeros", "config": {}}),
        Initializer::Ones => json!({"class_name": "Ones", "config": {}}),
        Initializer::Constant(value) => {
            json!({"class_name": "Constant", "config": {"value": value}})
        }
        Initializer::RandomUniform { min, max, seed } => json!({
            "class_name": "RandomUniform",
            "config": {"minval": min, "maxval": max, "seed": seed}
        }),
        Initializer::RandomNormal { mean, stdev, seed } => json!({
            "class_name": "RandomNormal",
            "config": {"mean": mean, "stddev": stdev, "seed": seed}
        }),
        Initializer::TruncatedNormal { stdev, seed } => json!({
            "class_name": "TruncatedNormal",
            "config": {"stddev": stdev, "seed": seed}
        }),
        Initializer::GlorotUniform { seed } => {
            json!({"class_name": "GlorotUniform", "config": {"seed": seed}})
        }
        Initializer::GlorotNormal { seed } => {
            json!({"class_name": "GlorotNormal", "config": {"seed": seed}})
        }
        Initializer::HeUniform { seed } => {
            json!({"class_name": "HeUniform", "config": {"seed": seed}})
        }
        Initializer::HeNormal { seed } => {
            json!({"class_name": "HeNormal", "config": {"seed": seed}})
        }
        Initializer::LeCunUniform { seed } => {
            json!({"class_name": "LeCunUniform", "config": {"seed": seed}})
        }
        Initializer::LeCunNormal { seed } => {
            json!({"class_name": "LeCunNormal", "config": {"seed": seed}})
        }
        Initializer::VarianceScaling {
            scale,
            mode,
            distribution,
            seed,
        } => json!({
            "class_name": "VarianceScaling",
            "config": {
                "scale": scale,
                "mode": match mode {
                    FanMode::FanIn => "fan_in",
                    FanMode::FanOut => "fan_out",
                    FanMode::FanAvg => "fan_avg",
                },
                "distribution": match distribution {
                    VarianceDistribution::Uniform => "uniform",
                    VarianceDistribution::TruncatedNormal => "truncated_normal",
                    VarianceDistribution::UntruncatedNormal => "untruncated_normal",
                },
                "seed": seed,
            }
        }),
    }
}

fn regularizer_to_json(reg: &Regularizer) -> Option<Value> {
    let (l1, l2) = match reg {
        Regularizer::None => return None,
        Regularizer::L1(l1) => (*l1, 0.0),
        Regularizer::L2(l2) => (0.0, *l2),
        Regularizer::L1L2 { l1, l2 } => (*l1, *l2),
    };
    Some(json!({"class_name": "L1L2", "config": {"l1": l1, "l2": l2}}))
}

fn padding_id(padding: ConvPadding) -> &'static str {
    match padding {
        ConvPadding::Valid => "valid",
        ConvPadding::Same => "same",
        ConvPadding::Full => "full",
    }
}

fn insert_conv_common(
    config: &mut Map<String, Value>,
    activation: Activation,
    use_bias: bool,
    kernel_initializer: &Initializer,
    bias_initializer: &Initializer,
    kernel_regularizer: &Regularizer,
    bias_regularizer: &Regularizer,
) {
    config.insert("activation".into(), json!(activation_id(activation)));
    config.insert("use_bias".into(), json!(use_bias));
    config.insert(
        "kernel_initializer".into(),
        initializer_to_json(kernel_initializer),
    );
    config.insert(
        "bias_initializer".into(),
        initializer_to_json(bias_initializer),
    );
    if let Some(v) = regularizer_to_json(kernel_regularizer) {
        config.insert("kernel_regularizer".into(), v);
    }
    if let Some(v) = regularizer_to_json(bias_regularizer) {
        config.insert("bias_regularizer".into(), v);
    }
}

/// Serializes a model's architecture back to the declarative format; the
/// mirror of [`functional_from_json`].
pub fn model_to_json(model: &Model) -> Result<String> {
    let mut entries: Vec<Value> = Vec::with_capacity(model.layers().len());
    for layer in model.layers() {
        let mut config = Map::new();
        config.insert("name".into(), json!(layer.name));
        config.insert("trainable".into(), json!(layer.trainable));
        match &layer.kind {
            LayerKind::Input(input) => {
                let mut dims = vec![Value::Null];
                dims.extend(input.dims.iter().map(|&d| json!(d)));
                config.insert("batch_input_shape".into(), Value::Array(dims));
            }
            LayerKind::Dense(d) => {
                config.insert("units".into(), json!(d.units));
                insert_conv_common(
                    &mut config,
                    d.activation,
                    d.use_bias,
                    &d.kernel_initializer,
                    &d.bias_initializer,
                    &d.kernel_regularizer,
                    &d.bias_regularizer,
                );
            }
            LayerKind::Conv1D(c) => {
                config.insert("filters".into(), json!(c.filters));
                config.insert("kernel_size".into(), json!([c.kernel_size]));
                config.insert("strides".into(), json!([c.strides]));
                config.insert("dilation_rate".into(), json!([c.dilations]));
                config.insert("padding".into(), json!(padding_id(c.padding)));
                insert_conv_common(
                    &mut config,
                    c.activation,
                    c.use_bias,
                    &c.kernel_initializer,
                    &c.bias_initializer,
                    &c.kernel_regularizer,
                    &c.bias_regularizer,
                );
            }
            LayerKind::Conv2D(c) => {
                config.insert("filters".into(), json!(c.filters));
                config.insert("kernel_size".into(), json!([c.kernel_size.0, c.kernel_size.1]));
                config.insert("strides".into(), json!([c.strides.0, c.strides.1]));
                config.insert(
                    "dilation_rate".into(),
                    json!([c.dilations.0, c.dilations.1]),
                );
                config.insert("padding".into(), json!(padding_id(c.padding)));
                insert_conv_common(
                    &mut config,
                    c.activation,
                    c.use_bias,
                    &c.kernel_initializer,
                    &c.bias_initializer,
                    &c.kernel_regularizer,
                    &c.bias_regularizer,
                );
            }
            LayerKind::Conv2DTranspose(c) => {
                config.insert("filters".into(), json!(c.filters));
                config.insert("kernel_size".into(), json!([c.kernel_size.0, c.kernel_size.1]));
                config.insert("strides".into(), json!([c.strides.0, c.strides.1]));
                config.insert(
                    "dilation_rate".into(),
                    json!([c.dilations.0, c.dilations.1]),
                );
                config.insert("padding".into(), json!(padding_id(c.padding)));
                if let Some((a, b)) = c.output_padding {
                    config.insert("output_padding".into(), json!([a, b]));
                }
                insert_conv_common(
                    &mut config,
                    c.activation,
                    c.use_bias,
                    &c.kernel_initializer,
                    &c.bias_initializer,
                    &c.kernel_regularizer,
                    &c.bias_regularizer,
                );
            }
            LayerKind::MaxPool2D(p) | LayerKind::AvgPool2D(p) => {
                config.insert("pool_size".into(), json!([p.pool_size.0, p.pool_size.1]));
                config.insert("strides".into(), json!([p.strides.0, p.strides.1]));
                config.insert("padding".into(), json!(padding_id(p.padding)));
            }
            LayerKind::GlobalAvgPool2D(_) => {}
            LayerKind::BatchNorm(b) => {
                config.insert("axis".into(), json!(b.axis));
                config.insert("momentum".into(), json!(b.momentum));
                config.insert("epsilon".into(), json!(b.epsilon));
                config.insert("center".into(), json!(b.center));
                config.insert("scale".into(), json!(b.scale));
                config.insert("beta_initializer".into(), initializer_to_json(&b.beta_initializer));
                config.insert(
                    "gamma_initializer".into(),
                    initializer_to_json(&b.gamma_initializer),
                );
                config.insert(
                    "moving_mean_initializer".into(),
                    initializer_to_json(&b.moving_mean_initializer),
                );
                config.insert(
                    "moving_variance_initializer".into(),
                    initializer_to_json(&b.moving_variance_initializer),
                );
            }
            LayerKind::Dropout(d) => {
                config.insert("rate".into(), json!(d.rate));
            }
            LayerKind::Flatten => {}
            LayerKind::Reshape(r) => {
                config.insert("target_shape".into(), json!(r.target));
            }
            LayerKind::ZeroPadding2D(z) => {
                let ((top, bottom), (left, right)) = z.padding;
                config.insert("padding".into(), json!([[top, bottom], [left, right]]));
            }
            LayerKind::Activation(a) => {
                config.insert("activation".into(), json!(activation_id(a.activation)));
            }
            LayerKind::ReLU(r) => {
                config.insert("negative_slope".into(), json!(r.alpha));
                config.insert("threshold".into(), json!(r.threshold));
                if let Some(max) = r.max_value {
                    config.insert("max_value".into(), json!(max));
                }
            }
            LayerKind::Elu(e) => {
                config.insert("alpha".into(), json!(e.alpha));
            }
            LayerKind::LeakyReLU(l) => {
                config.insert("alpha".into(), json!(l.alpha));
            }
            LayerKind::Merge(m) => {
                if m.op == MergeOp::Concatenate {
                    config.insert("axis".into(), json!(m.axis));
                }
            }
        }
        let mut entry = Map::new();
        entry.insert("class_name".into(), json!(layer.kind_tag()));
        entry.insert("config".into(), Value::Object(config));
        if !matches!(layer.kind, LayerKind::Input(_)) {
            let nodes: Vec<Value> = model
                .inbound_names(&layer.name)
                .iter()
                .map(|n| json!([n, 0, 0, {}]))
                .collect();
            entry.insert("inbound_nodes".into(), json!([nodes]));
        }
        entries.push(Value::Object(entry));
    }
    let doc = json!({
        "class_name": "Functional",
        "config": {"name": "model", "layers": entries},
        "keras_version": "2.11.0",
        "backend": "rkg",
    });
    Ok(serde_json::to_string_pretty(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DENSE: &str = r#"{
      "class_name": "Sequential",
      "config": {
        "name": "sequential",
        "layers": [
          {"class_name": "Dense",
           "config": {"name": "dense_1", "batch_input_shape": [null, 4],
                      "units": 3, "activation": "linear"}},
          {"class_name": "Dense",
           "config": {"name": "dense_2", "units": 2, "activation": "softmax"}}
        ]
      },
      "keras_version": "2.11.0",
      "backend": "tensorflow"
    }"#;

    #[test]
    fn linear_mode_synthesizes_the_input() {
        let model = sequential_from_json(TWO_DENSE).unwrap();
        let names: Vec<&str> = model.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[1], "dense_1");
        assert_eq!(names[2], "dense_2");
        assert!(matches!(model.layers()[0].kind, LayerKind::Input(_)));
    }

    #[test]
    fn deserialization_is_idempotent() {
        let a = sequential_from_json(TWO_DENSE).unwrap();
        let b = sequential_from_json(TWO_DENSE).unwrap();
        let tags = |m: &Model| {
            m.layers()
                .iter()
                .map(|l| (l.name.clone(), l.kind_tag()))
                .collect::<Vec<_>>()
        };
        assert_eq!(tags(&a), tags(&b));
    }

    #[test]
    fn unknown_class_is_reported_by_name() {
        let json = r#"{
          "config": {"layers": [
            {"class_name": "Transformer",
             "config": {"name": "t", "batch_input_shape": [null, 4]}}
          ]}
        }"#;
        let err = sequential_from_json(json).unwrap_err();
        match err {
            ModelError::UnsupportedLayer(tag) => assert_eq!(tag, "Transformer"),
            other => panic!("expected UnsupportedLayer, got {:?}", other),
        }
    }

    #[test]
    fn variance_scaling_resolves_named_equivalents() {
        let he = KerasInitializer {
            class_name: "VarianceScaling".into(),
            config: KerasInitializerConfig {
                scale: Some(2.0),
                mode: Some("fan_in".into()),
                distribution: Some("truncated_normal".into()),
                ..Default::default()
            },
        };
        assert!(matches!(
            convert_initializer(&he).unwrap(),
            Initializer::HeNormal { .. }
        ));
        let generic = KerasInitializer {
            class_name: "VarianceScaling".into(),
            config: KerasInitializerConfig {
                scale: Some(0.5),
                mode: Some("fan_out".into()),
                distribution: Some("uniform".into()),
                ..Default::default()
            },
        };
        assert!(matches!(
            convert_initializer(&generic).unwrap(),
            Initializer::VarianceScaling { .. }
        ));
    }

    #[test]
    fn regularizer_coefficients_normalize() {
        let both = KerasRegularizer {
            class_name: "L1L2".into(),
            config: KerasRegularizerConfig {
                l1: Some(0.1),
                l2: Some(0.2),
            },
        };
        assert_eq!(
            convert_regularizer(&both).unwrap(),
            Regularizer::L1L2 { l1: 0.1, l2: 0.2 }
        );
        let neither = KerasRegularizer {
            class_name: "L1L2".into(),
            config: KerasRegularizerConfig {
                l1: Some(0.0),
                l2: Some(0.0),
            },
        };
        assert_eq!(convert_regularizer(&neither).unwrap(), Regularizer::None);
        let unknown = KerasRegularizer {
            class_name: "Orthogonal".into(),
            config: KerasRegularizerConfig::default(),
        };
        assert!(matches!(
            convert_regularizer(&unknown),
            Err(ModelError::UnsupportedRegularizer(_))
        ));
    }

    #[test]
    fn functional_mode_rejects_unresolved_inbound() {
        let json = r#"{
          "config": {"layers": [
            {"class_name": "InputLayer",
             "config": {"name": "input_1", "batch_input_shape": [null, 4]}},
            {"class_name": "Dense",
             "config": {"name": "dense_1", "units": 2, "activation": "linear"},
             "inbound_nodes": [[["ghost", 0, 0, {}]]]}
          ]}
        }"#;
        let err = functional_from_json(json).unwrap_err();
        assert!(matches!(err, ModelError::UnresolvedInbound { layer, wanted }
            if layer == "dense_1" && wanted == "ghost"));
    }

    #[test]
    fn functional_mode_rejects_empty_inbound() {
        let json = r#"{
          "config": {"layers": [
            {"class_name": "InputLayer",
             "config": {"name": "input_1", "batch_input_shape": [null, 4]}},
            {"class_name": "Dense",
             "config": {"name": "dense_1", "units": 2, "activation": "linear"},
             "inbound_nodes": []}
          ]}
        }"#;
        let err = functional_from_json(json).unwrap_err();
        assert!(matches!(err, ModelError::Config(msg) if msg.contains("dense_1")));
    }

    #[test]
    fn explicit_padding_parses() {
        let padding: KerasPadding = serde_json::from_str("[[1, 2], [3, 4]]").unwrap();
        assert_eq!(padding, KerasPadding::Explicit((1, 2), (3, 4)));
        let uniform: KerasPadding = serde_json::from_str("2").unwrap();
        assert_eq!(uniform, KerasPadding::Explicit((2, 2), (2, 2)));
        let same: KerasPadding = serde_json::from_str("\"same\"").unwrap();
        assert_eq!(same, KerasPadding::Same);
        assert!(serde_json::from_str::<KerasPadding>("\"diagonal\"").is_err());
    }
}
