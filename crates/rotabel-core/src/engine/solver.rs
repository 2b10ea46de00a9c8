use std::collections::HashSet;
use tracing::{debug, instrument, trace, warn};

use crate::core::graph::{InteractionGraph, OneBodyEnergy};
use crate::core::ids::UPPER_ROT;
use crate::engine::config::SolverConfig;
use crate::engine::edges::EdgeHolder;
use crate::engine::error::EngineError;
use crate::engine::nodes::NodeHolder;

/// What one evaluation cycle is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    /// Sensitivities and occupation probabilities only.
    DerivativeOnly,
    /// Derivatives plus the Bethe free energy.
    PotentialAndDerivative,
}

/// Outcome of one solve: how many sweeps ran and the final stopping residual.
///
/// Hitting the iteration cap is not an error; the last iterate is still a
/// usable set of L1-normalized marginals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveStats {
    pub iterations: usize,
    pub max_deviation: f32,
}

/// Belief propagation solver for sidechain rotamer marginals.
///
/// Owns the per-alphabet node and edge state plus the external collaborators,
/// and runs the full evaluation cycle: fill the holders from the interaction
/// graph, iterate damped asynchronous BP to convergence, back-propagate
/// derivatives, and optionally read out the Bethe free energy.
///
/// All buffers are sized once at construction from the graph's id set; an
/// evaluation allocates nothing in the hot loop. The solver assumes exclusive
/// access for the duration of a call.
pub struct RotamerSolver {
    config: SolverConfig,
    igraph: Box<dyn InteractionGraph>,
    one_body: Vec<Box<dyn OneBodyEnergy>>,
    nodes1: NodeHolder,
    nodes3: NodeHolder,
    edges11: EdgeHolder,
    edges13: EdgeHolder,
    edges33: EdgeHolder,
    potential: Option<f32>,
    energy_fresh: bool,
}

/// Sizes each alphabet class from the graph's bead ids.
///
/// Residue indices are dense within a class, so the holder size is one past
/// the largest index seen. Id validation happens here, before any buffers are
/// sized from the fields.
fn calculate_n_elem(
    igraph: &dyn InteractionGraph,
) -> Result<[usize; UPPER_ROT as usize], EngineError> {
    let mut result = [0usize; UPPER_ROT as usize];
    for bead in igraph.beads() {
        let decoded = bead.id.decode()?;
        if decoded.n_rot != 1 && decoded.n_rot != 3 {
            return Err(EngineError::UnsupportedAlphabet {
                n_rot: decoded.n_rot,
            });
        }
        let slot = &mut result[decoded.n_rot as usize];
        *slot = (*slot).max(decoded.residue as usize + 1);
    }
    Ok(result)
}

impl RotamerSolver {
    pub fn new(
        config: SolverConfig,
        igraph: Box<dyn InteractionGraph>,
        one_body: Vec<Box<dyn OneBodyEnergy>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let n_elem_rot = calculate_n_elem(igraph.as_ref())?;

        for (index, term) in one_body.iter().enumerate() {
            if term.n_elem() != igraph.n_positions() {
                return Err(EngineError::ShapeMismatch {
                    index,
                    expected: igraph.n_positions(),
                    found: term.n_elem(),
                });
            }
        }

        let n1 = n_elem_rot[1];
        let n3 = n_elem_rot[3];
        debug!(n1, n3, "sized rotamer holders from the graph id set");

        Ok(Self {
            nodes1: NodeHolder::new(1, n1),
            nodes3: NodeHolder::new(3, n3),
            edges11: EdgeHolder::new(1, 1, n1 * (n1 + 1) / 2),
            edges13: EdgeHolder::new(1, 3, n1 * n3),
            edges33: EdgeHolder::new(3, 3, n3 * (n3 + 1) / 2),
            config,
            igraph,
            one_body,
            potential: None,
            energy_fresh: false,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Node state for one alphabet class, if that class is supported.
    pub fn node_holder(&self, n_rot: u32) -> Option<&NodeHolder> {
        match n_rot {
            1 => Some(&self.nodes1),
            3 => Some(&self.nodes3),
            _ => None,
        }
    }

    /// Edge state for one canonical alphabet pairing, if supported.
    pub fn edge_holder(&self, n_rot1: u32, n_rot2: u32) -> Option<&EdgeHolder> {
        match (n_rot1, n_rot2) {
            (1, 1) => Some(&self.edges11),
            (1, 3) => Some(&self.edges13),
            (3, 3) => Some(&self.edges33),
            _ => None,
        }
    }

    /// Free energy from the last evaluation that requested the potential.
    pub fn potential(&self) -> Option<f32> {
        self.potential
    }

    /// Re-evaluates in potential mode if the cached energy is stale relative
    /// to the last derivative pass.
    pub fn ensure_fresh_energy(&mut self) -> Result<(), EngineError> {
        if !self.energy_fresh {
            self.compute_value(ComputeMode::PotentialAndDerivative)?;
        }
        Ok(())
    }

    /// Runs one full evaluation cycle.
    pub fn compute_value(&mut self, mode: ComputeMode) -> Result<SolveStats, EngineError> {
        self.energy_fresh = mode == ComputeMode::PotentialAndDerivative;

        self.fill_holders()?;
        let stats = self.solve_for_marginals();
        if stats.iterations + self.config.iteration_chunk_size + 1 >= self.config.max_iter {
            warn!(
                iterations = stats.iterations,
                max_deviation = stats.max_deviation,
                "belief propagation stopped near the iteration cap"
            );
        }

        self.propagate_derivatives()?;
        if mode == ComputeMode::PotentialAndDerivative {
            self.potential = Some(self.calculate_energy_from_marginals());
        }
        Ok(stats)
    }

    /// Rebuilds node priors and edge tables from the interaction graph and the
    /// one-body providers, then folds singleton-rotamer edges away.
    #[instrument(skip_all, name = "rotamer_fill")]
    fn fill_holders(&mut self) -> Result<(), EngineError> {
        self.nodes1.reset();
        self.nodes3.reset();
        self.edges11.reset();
        self.edges13.reset();
        self.edges33.reset();

        for bead in self.igraph.beads() {
            let decoded = bead.id.decode()?;
            let energy: f32 = self.one_body.iter().map(|term| term.value(bead.index)).sum();
            let holder = match decoded.n_rot {
                1 => &mut self.nodes1,
                3 => &mut self.nodes3,
                n_rot => return Err(EngineError::UnsupportedAlphabet { n_rot }),
            };
            *holder
                .prob
                .get_mut(decoded.rot as usize, decoded.residue as usize) *= (-energy).exp();
        }

        self.igraph.compute_edges();

        let n_edges = self.igraph.edges().len();
        for ne in 0..n_edges {
            let edge = self.igraph.edges()[ne];
            let beads = self.igraph.beads();
            let mut id1 = beads[edge.bead1].id;
            let mut id2 = beads[edge.bead2].id;
            let prob = (-edge.value).exp();

            // Canonical ordering: the smaller rotamer alphabet is endpoint 1.
            if id1.rotamer_count_field() > id2.rotamer_count_field() {
                std::mem::swap(&mut id1, &mut id2);
            }
            let d1 = id1.decode()?;
            let d2 = id2.decode()?;

            let holder = match (d1.n_rot, d2.n_rot) {
                (1, 1) => &mut self.edges11,
                (1, 3) => &mut self.edges13,
                (3, 3) => &mut self.edges33,
                pair => {
                    // endpoints were validated bead-by-bead above
                    return Err(EngineError::Internal(format!(
                        "no edge holder for alphabet pair {pair:?}"
                    )));
                }
            };
            holder.add_to_edge(ne, prob, d1.residue, d1.rot, d2.residue, d2.rot);
        }

        // Edges with a singleton endpoint carry no message freedom; fold them
        // into the other endpoint's priors and drop them from BP.
        self.edges13.move_edge_prob_to_node2(&mut self.nodes3);
        Ok(())
    }

    /// One sweep: reset running node beliefs to the priors, push messages
    /// across every (3,3) edge in place, then damp and rescale the node side.
    fn calculate_new_beliefs(&mut self, damping: f32) {
        self.nodes3.begin_belief_update();
        self.edges33.update_beliefs::<3, 3>(&mut self.nodes3, damping);
        self.nodes3.finish_belief_update::<3>(damping);
    }

    /// Iterates damped BP until the belief deviation drops below tolerance or
    /// the iteration cap is hit, then converts beliefs to marginals.
    #[instrument(skip_all, name = "rotamer_solve")]
    fn solve_for_marginals(&mut self) -> SolveStats {
        self.nodes1.seed_old_from_prob();
        self.nodes3.seed_old_from_prob();
        self.edges33.seed_old_beliefs();

        // The warm-up sweep leaves consistent values in the edge beliefs but
        // poor ones in the node beliefs; swapping only the node side makes
        // both buffers reasonable before iteration starts.
        self.calculate_new_beliefs(0.1);
        self.nodes3.swap_beliefs();

        let mut max_deviation = 1e10f32;
        let mut iterations = 0;

        while max_deviation > self.config.tol && iterations < self.config.max_iter {
            for _ in 0..self.config.iteration_chunk_size {
                self.nodes3.swap_beliefs();
                self.edges33.swap_beliefs();
                self.calculate_new_beliefs(self.config.damping);
            }
            max_deviation = self
                .nodes3
                .max_deviation()
                .max(self.edges33.max_deviation());
            iterations += self.config.iteration_chunk_size;
            trace!(iterations, max_deviation, "completed iteration chunk");
        }

        self.nodes3.calculate_marginals::<3>();
        self.edges33
            .calculate_marginals::<3, 3>(&self.nodes3, &self.nodes3);

        SolveStats {
            iterations,
            max_deviation,
        }
    }

    /// Writes per-source-edge sensitivities back into the graph and the
    /// per-bead occupation probabilities into every one-body provider.
    fn propagate_derivatives(&mut self) -> Result<(), EngineError> {
        // Both endpoints singleton: the pair collapses to a scalar energy.
        for el in self.edges11.edge_loc() {
            self.igraph.set_edge_sensitivity(el.source_edge, 1.0);
        }
        // Folded (1,3) edges: sensitivity is the non-singleton endpoint's
        // occupation probability for the table entry this contribution hit.
        for el in self.edges13.edge_loc() {
            let sensitivity = self
                .nodes3
                .belief_at(el.dim, self.edges13.node2_of(el.edge));
            self.igraph.set_edge_sensitivity(el.source_edge, sensitivity);
        }
        for el in self.edges33.edge_loc() {
            self.igraph
                .set_edge_sensitivity(el.source_edge, self.edges33.marginal_at(el.dim, el.edge));
        }
        self.igraph.propagate_derivatives();

        for bead in self.igraph.beads() {
            let decoded = bead.id.decode()?;
            let occupancy = match decoded.n_rot {
                1 => self
                    .nodes1
                    .belief_at(decoded.rot as usize, decoded.residue as usize),
                3 => self
                    .nodes3
                    .belief_at(decoded.rot as usize, decoded.residue as usize),
                _ => {
                    return Err(EngineError::Internal(
                        "bead alphabet changed mid-evaluation".to_string(),
                    ));
                }
            };
            for term in self.one_body.iter_mut() {
                term.set_deriv(bead.index, occupancy);
            }
        }
        Ok(())
    }

    /// Total Bethe free energy of the converged beliefs.
    ///
    /// The (1,3) tables were folded into the node priors during the fill and
    /// must not be counted again; a (1,1) edge has a single table entry whose
    /// negative log is the scalar pair energy.
    fn calculate_energy_from_marginals(&self) -> f32 {
        let mut en = 0.0;
        for nn in 0..self.nodes1.n_elem() {
            en += self.nodes1.node_free_energy::<1>(nn);
        }
        for nn in 0..self.nodes3.n_elem() {
            en += self.nodes3.node_free_energy::<3>(nn);
        }
        for ne in 0..self.edges11.n_edge() {
            en += -self.edges11.prob_at(0, ne).ln();
        }
        for ne in 0..self.edges33.n_edge() {
            en += self
                .edges33
                .edge_free_energy::<3, 3>(ne, &self.nodes3, &self.nodes3);
        }
        en
    }

    /// Per-residue free energies: each residue's node term plus half of every
    /// incident edge term, arranged in first-rotamer-bead order.
    pub fn residue_free_energies(&self) -> Result<Vec<f32>, EngineError> {
        let mut e1 = vec![0.0f32; self.nodes1.n_elem()];
        let mut e3 = vec![0.0f32; self.nodes3.n_elem()];

        for (nn, slot) in e1.iter_mut().enumerate() {
            *slot += self.nodes1.node_free_energy::<1>(nn);
        }
        for (nn, slot) in e3.iter_mut().enumerate() {
            *slot += self.nodes3.node_free_energy::<3>(nn);
        }

        for ne in 0..self.edges11.n_edge() {
            let en = -self.edges11.prob_at(0, ne).ln();
            e1[self.edges11.node1_of(ne)] += 0.5 * en;
            e1[self.edges11.node2_of(ne)] += 0.5 * en;
        }
        for ne in 0..self.edges33.n_edge() {
            let en = self
                .edges33
                .edge_free_energy::<3, 3>(ne, &self.nodes3, &self.nodes3);
            e3[self.edges33.node1_of(ne)] += 0.5 * en;
            e3[self.edges33.node2_of(ne)] += 0.5 * en;
        }

        self.arrange_energies(&e1, &e3)
    }

    /// Expected one-body energy per residue under the converged marginal, for
    /// one provider.
    pub fn rotamer_1body_energy(&self, term_index: usize) -> Result<Vec<f32>, EngineError> {
        let term = self.one_body.get(term_index).ok_or_else(|| {
            EngineError::Internal(format!("no one-body term with index {term_index}"))
        })?;

        let mut e1 = vec![0.0f32; self.nodes1.n_elem()];
        let mut e3 = vec![0.0f32; self.nodes3.n_elem()];

        for bead in self.igraph.beads() {
            let d = bead.id.decode()?;
            let rot = d.rot as usize;
            let residue = d.residue as usize;
            match d.n_rot {
                1 => e1[residue] += self.nodes1.belief_at(rot, residue) * term.value(bead.index),
                3 => e3[residue] += self.nodes3.belief_at(rot, residue) * term.value(bead.index),
                n_rot => return Err(EngineError::UnsupportedAlphabet { n_rot }),
            }
        }

        self.arrange_energies(&e1, &e3)
    }

    /// Flattens the per-class vectors into one list ordered by each residue's
    /// first-rotamer bead, the order the outer engine logs in.
    fn arrange_energies(&self, e1: &[f32], e3: &[f32]) -> Result<Vec<f32>, EngineError> {
        let mut energies = Vec::with_capacity(e1.len() + e3.len());
        let mut known_ids = HashSet::new();

        for bead in self.igraph.beads() {
            if bead.id.rot_field() != 0 {
                continue;
            }
            // a residue can contribute several beads
            if !known_ids.insert(bead.id) {
                continue;
            }
            let d = bead.id.decode()?;
            match d.n_rot {
                1 => energies.push(e1[d.residue as usize]),
                3 => energies.push(e3[d.residue as usize]),
                n_rot => return Err(EngineError::UnsupportedAlphabet { n_rot }),
            }
        }

        if energies.len() != e1.len() + e3.len() {
            return Err(EngineError::Internal(
                "wrong number of residues".to_string(),
            ));
        }
        Ok(energies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::PairEdge;
    use crate::core::ids::BeadId;
    use crate::engine::testing::{residue_beads, FixedGraph, FixedTerm, GraphState, TermState};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn default_config() -> SolverConfig {
        SolverConfig {
            damping: 0.1,
            max_iter: 1000,
            tol: 1e-6,
            iteration_chunk_size: 10,
        }
    }

    type Handles = (
        RotamerSolver,
        Rc<RefCell<GraphState>>,
        Rc<RefCell<TermState>>,
    );

    fn build_solver(
        config: SolverConfig,
        beads: Vec<(BeadId, usize)>,
        edges: Vec<PairEdge>,
        values: Vec<f32>,
    ) -> Handles {
        let (graph, graph_state) = FixedGraph::new(beads, edges);
        let (term, term_state) = FixedTerm::new(values);
        let solver = RotamerSolver::new(config, Box::new(graph), vec![Box::new(term)]).unwrap();
        (solver, graph_state, term_state)
    }

    /// All nine bead pairs between two 3-rotamer residues, with the pair value
    /// produced by `value(rot1, rot2)`.
    fn all_pair_edges(
        first_bead1: usize,
        first_bead2: usize,
        value: impl Fn(usize, usize) -> f32,
    ) -> Vec<PairEdge> {
        let mut edges = Vec::new();
        for r1 in 0..3 {
            for r2 in 0..3 {
                edges.push(PairEdge {
                    bead1: first_bead1 + r1,
                    bead2: first_bead2 + r2,
                    value: value(r1, r2),
                });
            }
        }
        edges
    }

    #[test]
    fn construction_rejects_shape_mismatched_one_body_terms() {
        let (graph, _) = FixedGraph::new(residue_beads(0, 3, 0), vec![]);
        let (term, _) = FixedTerm::new(vec![0.0; 2]);
        let result = RotamerSolver::new(default_config(), Box::new(graph), vec![Box::new(term)]);
        assert!(matches!(
            result,
            Err(EngineError::ShapeMismatch {
                index: 0,
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn construction_rejects_invalid_rotamer_ids() {
        let beads = vec![(BeadId::pack(0, 3, 3), 0)];
        let (graph, _) = FixedGraph::new(beads, vec![]);
        let result = RotamerSolver::new(default_config(), Box::new(graph), vec![]);
        assert!(matches!(result, Err(EngineError::InvalidRotamerId { .. })));
    }

    #[test]
    fn construction_rejects_unsupported_alphabet_sizes() {
        let beads = vec![(BeadId::pack(0, 2, 0), 0)];
        let (graph, _) = FixedGraph::new(beads, vec![]);
        let result = RotamerSolver::new(default_config(), Box::new(graph), vec![]);
        assert!(matches!(
            result,
            Err(EngineError::UnsupportedAlphabet { n_rot: 2 })
        ));
    }

    #[test]
    fn trivial_singleton_residue_has_zero_energy_and_unit_occupancy() {
        let beads = vec![(BeadId::pack(0, 1, 0), 0)];
        let (mut solver, graph_state, term_state) =
            build_solver(default_config(), beads, vec![], vec![0.0]);

        let stats = solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        assert!(solver.potential().unwrap().abs() < 1e-6);
        assert_eq!(term_state.borrow().derivs[0], 1.0);
        assert_eq!(graph_state.borrow().propagate_calls, 1);
        assert!(stats.iterations < solver.config().max_iter);
    }

    #[test]
    fn uncoupled_residues_recover_boltzmann_marginals_and_free_energy() {
        let ln2 = 2.0f32.ln();
        let ln4 = 4.0f32.ln();
        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        let values = vec![0.0, ln2, ln4, 0.0, ln2, ln4];
        let (mut solver, _, term_state) = build_solver(default_config(), beads, vec![], values);

        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        let derivs = term_state.borrow().derivs.clone();
        for residue in 0..2 {
            let base = residue * 3;
            assert!((derivs[base] - 4.0 / 7.0).abs() < 1e-5);
            assert!((derivs[base + 1] - 2.0 / 7.0).abs() < 1e-5);
            assert!((derivs[base + 2] - 1.0 / 7.0).abs() < 1e-5);
        }

        let expected = -2.0 * (7.0f32 / 4.0).ln();
        assert!((solver.potential().unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn singleton_to_triple_edge_folds_into_the_larger_endpoint() {
        let ln10 = 10.0f32.ln();
        let mut beads = vec![(BeadId::pack(0, 1, 0), 0)];
        beads.extend(residue_beads(0, 3, 1));
        // favor B's rotamer 0 by log 10
        let edges = vec![PairEdge {
            bead1: 0,
            bead2: 1,
            value: -ln10,
        }];
        let (mut solver, graph_state, term_state) =
            build_solver(default_config(), beads, edges, vec![0.0; 4]);

        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        let derivs = term_state.borrow().derivs.clone();
        assert_eq!(derivs[0], 1.0);
        assert!((derivs[1] - 10.0 / 12.0).abs() < 1e-5);
        assert!((derivs[2] - 1.0 / 12.0).abs() < 1e-5);
        assert!((derivs[3] - 1.0 / 12.0).abs() < 1e-5);

        // the folded edge's sensitivity is the endpoint's occupation
        assert!((graph_state.borrow().sensitivities[0] - 10.0 / 12.0).abs() < 1e-5);

        // everything was folded away, so no (3,3) edge remains
        assert_eq!(solver.edge_holder(3, 3).unwrap().n_edge(), 0);
        assert_eq!(solver.edge_holder(1, 3).unwrap().n_edge(), 1);

        let expected = -(12.0f32).ln();
        assert!((solver.potential().unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn coupled_pair_converges_to_symmetric_diagonally_enriched_marginals() {
        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        let edges = all_pair_edges(0, 3, |r1, r2| if r1 == r2 { 0.0 } else { 1.0 });
        let (mut solver, graph_state, term_state) =
            build_solver(default_config(), beads, edges, vec![0.0; 6]);

        let stats = solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        assert!(stats.iterations < solver.config().max_iter);
        assert!(stats.max_deviation <= solver.config().tol);

        // symmetric problem: both residues uniform
        let derivs = term_state.borrow().derivs.clone();
        for &d in &derivs {
            assert!((d - 1.0 / 3.0).abs() < 1e-4);
        }

        let edges33 = solver.edge_holder(3, 3).unwrap();
        assert_eq!(edges33.n_edge(), 1);
        let mut total = 0.0;
        for dim in 0..9 {
            total += edges33.marginal_at(dim, 0);
        }
        assert!((total - 1.0).abs() < 1e-5);

        // diagonal enrichment from the attractive same-rotamer coupling
        for r1 in 0..3 {
            for r2 in 0..3 {
                if r1 != r2 {
                    assert!(edges33.marginal_at(r1 * 3 + r1, 0) > edges33.marginal_at(r1 * 3 + r2, 0));
                }
            }
        }

        // marginalizing the pair marginal recovers the node marginal
        for r1 in 0..3 {
            let row: f32 = (0..3).map(|r2| edges33.marginal_at(r1 * 3 + r2, 0)).sum();
            assert!((row - derivs[r1]).abs() < 1e-4);
        }

        // sensitivities are the joint marginals and therefore sum to one
        let sens_total: f32 = graph_state.borrow().sensitivities.iter().sum();
        assert!((sens_total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn frustrated_cycle_hits_the_iteration_cap_with_sane_marginals() {
        let config = SolverConfig {
            damping: 0.05,
            max_iter: 2,
            tol: 1e-12,
            iteration_chunk_size: 2,
        };

        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        beads.extend(residue_beads(2, 3, 6));

        // anti-correlating couplings on every pair of the 3-cycle
        let anti = |r1: usize, r2: usize| if r1 == r2 { 4.0 } else { 0.0 };
        let mut edges = all_pair_edges(0, 3, anti);
        edges.extend(all_pair_edges(3, 6, anti));
        edges.extend(all_pair_edges(0, 6, anti));

        // a small symmetry-breaking tilt keeps the messages moving
        let values: Vec<f32> = (0..9)
            .map(|i| 0.1 * ((i / 3 + 2 * (i % 3)) % 3) as f32)
            .collect();

        let (mut solver, _, term_state) = build_solver(config, beads, edges, values);
        let stats = solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        assert!(stats.iterations >= solver.config().max_iter);
        assert!(stats.max_deviation > solver.config().tol);

        // the last iterate must still be a sane distribution
        let derivs = term_state.borrow().derivs.clone();
        for residue in 0..3 {
            let total: f32 = derivs[residue * 3..residue * 3 + 3].iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        let edges33 = solver.edge_holder(3, 3).unwrap();
        assert_eq!(edges33.n_edge(), 3);
        for ne in 0..3 {
            let total: f32 = (0..9).map(|dim| edges33.marginal_at(dim, ne)).sum();
            assert!(total.is_finite());
            assert!((total - 1.0).abs() < 1e-5);
        }
        assert!(solver.potential().unwrap().is_finite());
    }

    #[test]
    fn finite_difference_matches_the_recorded_occupancy() {
        let coupling = |r1: usize, r2: usize| if r1 == r2 { 0.0 } else { 0.5 };
        let base_values = vec![0.1, 0.3, 0.05, 0.2, 0.15, 0.25];
        let perturbed_bead = 1;
        let delta = 1e-3f32;

        let potential_for = |values: Vec<f32>| -> f32 {
            let mut beads = residue_beads(0, 3, 0);
            beads.extend(residue_beads(1, 3, 3));
            let edges = all_pair_edges(0, 3, coupling);
            let (mut solver, _, _) = build_solver(default_config(), beads, edges, values);
            solver
                .compute_value(ComputeMode::PotentialAndDerivative)
                .unwrap();
            solver.potential().unwrap()
        };

        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        let edges = all_pair_edges(0, 3, coupling);
        let (mut solver, _, term_state) = build_solver(
            default_config(),
            beads,
            edges,
            base_values.clone(),
        );
        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();
        let recorded = term_state.borrow().derivs[perturbed_bead];

        let mut plus = base_values.clone();
        plus[perturbed_bead] += delta;
        let mut minus = base_values.clone();
        minus[perturbed_bead] -= delta;
        let fd = (potential_for(plus) - potential_for(minus)) / (2.0 * delta);

        assert!(recorded > 0.0 && recorded < 1.0);
        assert!(
            (fd - recorded).abs() < 2e-3,
            "finite difference {fd} vs recorded occupancy {recorded}"
        );
    }

    #[test]
    fn derivative_only_mode_leaves_the_potential_stale() {
        let beads = vec![(BeadId::pack(0, 1, 0), 0)];
        let (mut solver, _, _) = build_solver(default_config(), beads, vec![], vec![0.5]);

        solver.compute_value(ComputeMode::DerivativeOnly).unwrap();
        assert!(solver.potential().is_none());

        solver.ensure_fresh_energy().unwrap();
        assert!(solver.potential().is_some());
    }

    #[test]
    fn repeated_evaluations_are_reproducible() {
        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        let edges = all_pair_edges(0, 3, |r1, r2| 0.2 * (r1 as f32) - 0.1 * (r2 as f32));
        let values = vec![0.3, 0.1, 0.0, 0.05, 0.2, 0.4];
        let (mut solver, _, term_state) = build_solver(default_config(), beads, edges, values);

        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();
        let first_potential = solver.potential().unwrap();
        let first_derivs = term_state.borrow().derivs.clone();

        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();
        assert_eq!(solver.potential().unwrap(), first_potential);
        assert_eq!(term_state.borrow().derivs, first_derivs);
    }

    #[test]
    fn residue_free_energies_attribute_half_of_each_edge_term() {
        let mut beads = residue_beads(0, 3, 0);
        beads.extend(residue_beads(1, 3, 3));
        let edges = all_pair_edges(0, 3, |r1, r2| if r1 == r2 { 0.0 } else { 1.0 });
        let (mut solver, _, _) = build_solver(default_config(), beads, edges, vec![0.0; 6]);
        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        let per_residue = solver.residue_free_energies().unwrap();
        assert_eq!(per_residue.len(), 2);
        let total: f32 = per_residue.iter().sum();
        assert!((total - solver.potential().unwrap()).abs() < 1e-4);
        // symmetric problem splits evenly
        assert!((per_residue[0] - per_residue[1]).abs() < 1e-4);
    }

    #[test]
    fn rotamer_1body_energy_weights_values_by_the_marginal() {
        let ln2 = 2.0f32.ln();
        let ln4 = 4.0f32.ln();
        let beads = residue_beads(0, 3, 0);
        let values = vec![0.0, ln2, ln4];
        let (mut solver, _, _) = build_solver(default_config(), beads, vec![], values);
        solver
            .compute_value(ComputeMode::PotentialAndDerivative)
            .unwrap();

        let expected = (2.0 / 7.0) * ln2 + (1.0 / 7.0) * ln4;
        let energies = solver.rotamer_1body_energy(0).unwrap();
        assert_eq!(energies.len(), 1);
        assert!((energies[0] - expected).abs() < 1e-5);
    }
}
