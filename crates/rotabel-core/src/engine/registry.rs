use std::collections::HashMap;

use crate::core::graph::{InteractionGraph, OneBodyEnergy};
use crate::engine::config::SolverConfig;
use crate::engine::error::EngineError;
use crate::engine::solver::{ComputeMode, RotamerSolver, SolveStats};

/// A potential-producing node as seen by the outer engine.
pub trait EnergyNode {
    /// Runs one evaluation cycle in the requested mode.
    fn compute_value(&mut self, mode: ComputeMode) -> Result<SolveStats, EngineError>;

    /// The free energy from the last potential-mode evaluation, if any.
    fn potential(&self) -> Option<f32>;
}

impl EnergyNode for RotamerSolver {
    fn compute_value(&mut self, mode: ComputeMode) -> Result<SolveStats, EngineError> {
        RotamerSolver::compute_value(self, mode)
    }

    fn potential(&self) -> Option<f32> {
        RotamerSolver::potential(self)
    }
}

/// Everything a node factory needs: the configuration attribute group, the
/// pair interaction graph, and the one-body providers, in declaration order.
pub struct NodeArgs {
    pub params: HashMap<String, f64>,
    pub igraph: Box<dyn InteractionGraph>,
    pub one_body: Vec<Box<dyn OneBodyEnergy>>,
}

pub type NodeFactory = fn(NodeArgs) -> Result<Box<dyn EnergyNode>, EngineError>;

/// Named node-creation surface.
///
/// The outer engine looks nodes up by the type name it finds in its input
/// files; `"rotamer"` maps to the belief propagation solver.
pub struct NodeRegistry {
    factories: HashMap<&'static str, NodeFactory>,
}

fn create_rotamer_node(args: NodeArgs) -> Result<Box<dyn EnergyNode>, EngineError> {
    let config = SolverConfig::from_params(&args.params)?;
    let solver = RotamerSolver::new(config, args.igraph, args.one_body)?;
    Ok(Box::new(solver))
}

impl NodeRegistry {
    /// A registry with the built-in node types registered.
    pub fn with_builtin_nodes() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("rotamer", create_rotamer_node);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: NodeFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, name: &str, args: NodeArgs) -> Result<Box<dyn EnergyNode>, EngineError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EngineError::UnknownNodeType(name.to_string()))?;
        factory(args)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtin_nodes()
    }
}
