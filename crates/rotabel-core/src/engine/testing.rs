//! Test doubles for the external collaborators: a fixed-topology interaction
//! graph and a table-backed one-body provider. Both hand shared handles back
//! to the test so captured sensitivities and derivatives stay observable after
//! the solver takes ownership.

use std::cell::RefCell;
use std::rc::Rc;

use crate::core::graph::{Bead, InteractionGraph, OneBodyEnergy, PairEdge};
use crate::core::ids::BeadId;

#[derive(Debug, Default)]
pub struct GraphState {
    pub sensitivities: Vec<f32>,
    pub propagate_calls: usize,
}

/// Interaction-graph double with a fixed bead and edge list.
#[derive(Debug, Clone)]
pub struct FixedGraph {
    state: Rc<RefCell<GraphState>>,
    n_positions: usize,
    // compute_edges re-publishes this list each evaluation
    edge_template: Vec<PairEdge>,
    published: Vec<PairEdge>,
    beads: Vec<Bead>,
}

impl FixedGraph {
    pub fn new(beads: Vec<(BeadId, usize)>, edges: Vec<PairEdge>) -> (Self, Rc<RefCell<GraphState>>) {
        let beads: Vec<Bead> = beads
            .into_iter()
            .map(|(id, index)| Bead { id, index })
            .collect();
        let n_positions = beads.iter().map(|b| b.index + 1).max().unwrap_or(0);
        let state = Rc::new(RefCell::new(GraphState {
            sensitivities: vec![0.0; edges.len()],
            propagate_calls: 0,
        }));
        let graph = Self {
            state: Rc::clone(&state),
            n_positions,
            edge_template: edges,
            published: Vec::new(),
            beads,
        };
        (graph, state)
    }
}

impl InteractionGraph for FixedGraph {
    fn n_positions(&self) -> usize {
        self.n_positions
    }

    fn beads(&self) -> &[Bead] {
        &self.beads
    }

    fn compute_edges(&mut self) {
        self.published = self.edge_template.clone();
    }

    fn edges(&self) -> &[PairEdge] {
        &self.published
    }

    fn set_edge_sensitivity(&mut self, edge: usize, sensitivity: f32) {
        self.state.borrow_mut().sensitivities[edge] = sensitivity;
    }

    fn propagate_derivatives(&mut self) {
        self.state.borrow_mut().propagate_calls += 1;
    }
}

#[derive(Debug, Default)]
pub struct TermState {
    pub values: Vec<f32>,
    pub derivs: Vec<f32>,
}

/// One-body provider double backed by a plain value table.
#[derive(Debug, Clone)]
pub struct FixedTerm {
    state: Rc<RefCell<TermState>>,
}

impl FixedTerm {
    pub fn new(values: Vec<f32>) -> (Self, Rc<RefCell<TermState>>) {
        let len = values.len();
        let state = Rc::new(RefCell::new(TermState {
            values,
            derivs: vec![0.0; len],
        }));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl OneBodyEnergy for FixedTerm {
    fn n_elem(&self) -> usize {
        self.state.borrow().values.len()
    }

    fn value(&self, index: usize) -> f32 {
        self.state.borrow().values[index]
    }

    fn set_deriv(&mut self, index: usize, occupancy: f32) {
        self.state.borrow_mut().derivs[index] = occupancy;
    }
}

/// Beads for one residue: one bead per rotamer, with consecutive indices
/// starting at `first_index`.
pub fn residue_beads(residue: u32, n_rot: u32, first_index: usize) -> Vec<(BeadId, usize)> {
    (0..n_rot)
        .map(|rot| (BeadId::pack(residue, n_rot, rot), first_index + rot as usize))
        .collect()
}
