use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};

use crate::core::initializers::Initializer;
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

/// Prefix separating optimizer state from layer parameters in the variable
/// namespace and in the persisted manifest.
pub const OPTIMIZER_PREFIX: &str = "optimizer_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Layer,
    Optimizer,
}

/// Parameter declaration produced by a layer's build step.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Initializer,
    pub trainable: bool,
    pub fan_in: usize,
    pub fan_out: usize,
}

/// Named, shaped parameter tensor. Data is absent until the model is
/// initialized or weights are loaded.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: VarKind,
    pub trainable: bool,
    pub init: Initializer,
    pub fan_in: usize,
    pub fan_out: usize,
    /// For optimizer state: the layer variable this slot belongs to.
    pub slot_of: Option<String>,
    data: Option<ArrayD<f64>>,
}

impl Variable {
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// Built-state record for one layer: produced by compile, never by the layer
/// itself.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub name: String,
    pub output_shape: Shape,
    pub variables: Vec<String>,
    pub param_count: usize,
    pub trainable: bool,
}

/// Owner of the computation graph's variables and wiring.
///
/// Holds the variable arena (registration order preserved), the built-layer
/// records keyed by layer name, and the inbound adjacency list. Layers keep
/// only name references; all built state lives here.
#[derive(Debug, Clone, Default)]
pub struct GraphContainer {
    vars: Vec<Variable>,
    index: HashMap<String, usize>,
    built: HashMap<String, BuiltLayer>,
    inbound: HashMap<String, Vec<String>>,
    owner: HashMap<String, String>,
}

impl GraphContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_variable(&mut self, var: Variable) -> Result<()> {
        if self.index.contains_key(&var.name) {
            return Err(ModelError::NameConflict(var.name));
        }
        self.index.insert(var.name.clone(), self.vars.len());
        self.vars.push(var);
        Ok(())
    }

    /// Registers a layer parameter for `owner`. Collisions fail with
    /// NameConflict.
    pub fn add_variable(&mut self, spec: VariableSpec, owner: &str) -> Result<()> {
        self.owner.insert(spec.name.clone(), owner.to_string());
        self.push_variable(Variable {
            name: spec.name,
            shape: spec.shape,
            kind: VarKind::Layer,
            trainable: spec.trainable,
            init: spec.init,
            fan_in: spec.fan_in,
            fan_out: spec.fan_out,
            slot_of: None,
            data: None,
        })
    }

    /// Registers an optimizer state slot for the layer variable `slot_of`.
    pub fn add_optimizer_variable(&mut self, name: String, slot_of: &str) -> Result<()> {
        let source = self.var(slot_of).ok_or_else(|| {
            ModelError::Internal("optimizer slot registered before its layer variable")
        })?;
        let shape = source.shape.clone();
        let (fan_in, fan_out) = (source.fan_in, source.fan_out);
        self.push_variable(Variable {
            name,
            shape,
            kind: VarKind::Optimizer,
            trainable: false,
            init: Initializer::Zeros,
            fan_in,
            fan_out,
            slot_of: Some(slot_of.to_string()),
            data: None,
        })
    }

    /// Records the built state of a layer; building the same layer twice is
    /// an illegal state.
    pub fn register_built(&mut self, built: BuiltLayer) -> Result<()> {
        if self.built.contains_key(&built.name) {
            return Err(ModelError::NameConflict(format!(
                "layer {} already built",
                built.name
            )));
        }
        self.built.insert(built.name.clone(), built);
        Ok(())
    }

    pub fn built(&self, layer: &str) -> Option<&BuiltLayer> {
        self.built.get(layer)
    }

    pub fn set_inbound(&mut self, layer: &str, inbound: Vec<String>) {
        self.inbound.insert(layer.to_string(), inbound);
    }

    pub fn inbound_of(&self, layer: &str) -> &[String] {
        self.inbound.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.index.get(name).map(|&i| &self.vars[i])
    }

    /// Layer parameters in registration order.
    pub fn layer_variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter().filter(|v| v.kind == VarKind::Layer)
    }

    /// Optimizer state slots in registration order.
    pub fn optimizer_variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter().filter(|v| v.kind == VarKind::Optimizer)
    }

    /// Variables owned by non-trainable layers, excluded from updates and
    /// from optimizer-state persistence.
    pub fn frozen_variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars
            .iter()
            .filter(move |v| self.is_frozen(&v.name))
    }

    /// True when the layer owning `name` (or, for an optimizer slot, owning
    /// its source variable) is non-trainable.
    pub fn is_frozen(&self, name: &str) -> bool {
        let layer_var = match self.var(name) {
            Some(v) => match &v.slot_of {
                Some(source) => source.clone(),
                None => v.name.clone(),
            },
            None => return false,
        };
        self.owner
            .get(&layer_var)
            .and_then(|layer| self.built.get(layer))
            .map(|b| !b.trainable)
            .unwrap_or(false)
    }

    pub fn owner_of(&self, var: &str) -> Option<&str> {
        self.owner.get(var).map(String::as_str)
    }

    /// Materializes every layer variable with initializer-sampled values.
    /// Idempotency is guarded at the Model layer, not here.
    pub fn initialize_variables(&mut self) {
        for v in &mut self.vars {
            if v.kind == VarKind::Layer {
                v.data = Some(v.init.generate(v.fan_in, v.fan_out, &v.shape));
            }
        }
    }

    /// Materializes optimizer state slots with zeros.
    pub fn initialize_optimizer_variables(&mut self) {
        for v in &mut self.vars {
            if v.kind == VarKind::Optimizer {
                v.data = Some(ArrayD::zeros(IxDyn(&v.shape)));
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        let mut any = false;
        for v in self.layer_variables() {
            any = true;
            if !v.has_data() {
                return false;
            }
        }
        any
    }

    pub fn data(&self, name: &str) -> Result<&ArrayD<f64>> {
        let var = self
            .var(name)
            .ok_or_else(|| ModelError::Internal("unknown variable name"))?;
        var.data
            .as_ref()
            .ok_or_else(|| ModelError::Internal("variable read before materialization"))
    }

    pub fn set_data(&mut self, name: &str, data: ArrayD<f64>) -> Result<()> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| ModelError::Internal("unknown variable name"))?;
        let var = &mut self.vars[idx];
        if data.shape() != var.shape.as_slice() {
            return Err(ModelError::Shape(format!(
                "variable {} expects shape {:?}, got {:?}",
                name,
                var.shape,
                data.shape()
            )));
        }
        var.data = Some(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, shape: &[usize]) -> VariableSpec {
        VariableSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            init: Initializer::Zeros,
            trainable: true,
            fan_in: shape[0],
            fan_out: *shape.last().unwrap(),
        }
    }

    #[test]
    fn name_collision_is_rejected() {
        let mut g = GraphContainer::new();
        g.add_variable(spec("dense_1_kernel", &[4, 3]), "dense_1").unwrap();
        let err = g.add_variable(spec("dense_1_kernel", &[4, 3]), "dense_1");
        assert!(matches!(err, Err(ModelError::NameConflict(_))));
    }

    #[test]
    fn built_twice_is_rejected() {
        let mut g = GraphContainer::new();
        let built = BuiltLayer {
            name: "dense_1".into(),
            output_shape: Shape::feature(&[3]),
            variables: vec![],
            param_count: 0,
            trainable: true,
        };
        g.register_built(built.clone()).unwrap();
        assert!(g.register_built(built).is_err());
    }

    #[test]
    fn initialization_materializes_layer_variables_only() {
        let mut g = GraphContainer::new();
        g.add_variable(spec("dense_1_kernel", &[4, 3]), "dense_1").unwrap();
        g.add_optimizer_variable("optimizer_adam_m_dense_1_kernel".into(), "dense_1_kernel")
            .unwrap();
        assert!(!g.is_initialized());
        g.initialize_variables();
        assert!(g.is_initialized());
        assert!(g.data("dense_1_kernel").is_ok());
        assert!(g.data("optimizer_adam_m_dense_1_kernel").is_err());
        g.initialize_optimizer_variables();
        assert!(g.data("optimizer_adam_m_dense_1_kernel").is_ok());
    }

    #[test]
    fn frozen_classification_follows_layer_trainable_flag() {
        let mut g = GraphContainer::new();
        g.add_variable(spec("frozen_kernel", &[2, 2]), "frozen").unwrap();
        g.register_built(BuiltLayer {
            name: "frozen".into(),
            output_shape: Shape::feature(&[2]),
            variables: vec!["frozen_kernel".into()],
            param_count: 4,
            trainable: false,
        })
        .unwrap();
        assert!(g.is_frozen("frozen_kernel"));
        assert_eq!(g.frozen_variables().count(), 1);
    }

    #[test]
    fn set_data_checks_shape() {
        let mut g = GraphContainer::new();
        g.add_variable(spec("k", &[2, 2]), "l").unwrap();
        assert!(g.set_data("k", ArrayD::zeros(IxDyn(&[3, 2]))).is_err());
        assert!(g.set_data("k", ArrayD::zeros(IxDyn(&[2, 2]))).is_ok());
    }
}
