use itertools::izip;
use std::collections::HashMap;
use wide::f32x4;

use crate::core::storage::PackedStore;
use crate::core::utils::numeric::{
    approx_normalize, horizontal_max, max_component, recip_guarded, BELIEF_EPS,
};
use crate::engine::nodes::NodeHolder;

/// Location of one source-graph edge contribution inside a holder: which
/// pair-table entry of which deduplicated edge it multiplied into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeLoc {
    /// Edge number in the interaction graph's pair list.
    pub source_edge: usize,
    /// Flat index `rot1 * n_rot2 + rot2` into the pair table.
    pub dim: usize,
    /// Deduplicated edge slot within this holder.
    pub edge: usize,
}

/// Pair state between two rotamer alphabet classes of sizes `n_rot1` and
/// `n_rot2`, with `n_rot1 <= n_rot2` by the caller's canonical ordering.
///
/// Each deduplicated residue pair carries a full `n_rot1 * n_rot2` potential
/// table and a split belief of width `n_rot1 + n_rot2`: the two outgoing
/// messages of this edge, concatenated. All per-edge tables live in AoSoA
/// storage so whole-quad sweeps stay vectorizable.
///
/// The holder stores no references to its endpoint [`NodeHolder`]s; methods
/// take the borrows they need, and the solver owns both sides.
#[derive(Debug)]
pub struct EdgeHolder {
    n_rot1: usize,
    n_rot2: usize,
    n_edge: usize,
    prob: PackedStore,
    cur_belief: PackedStore,
    old_belief: PackedStore,
    marginal: PackedStore,
    edge_indices1: Vec<usize>,
    edge_indices2: Vec<usize>,
    nodes_to_edge: HashMap<u64, usize>,
    edge_loc: Vec<EdgeLoc>,
}

impl EdgeHolder {
    pub fn new(n_rot1: usize, n_rot2: usize, max_n_edge: usize) -> Self {
        debug_assert!(n_rot1 <= n_rot2);
        let mut holder = Self {
            n_rot1,
            n_rot2,
            n_edge: 0,
            prob: PackedStore::new(n_rot1 * n_rot2, max_n_edge),
            cur_belief: PackedStore::new(n_rot1 + n_rot2, max_n_edge),
            old_belief: PackedStore::new(n_rot1 + n_rot2, max_n_edge),
            marginal: PackedStore::new(n_rot1 * n_rot2, max_n_edge),
            edge_indices1: Vec::with_capacity(max_n_edge),
            edge_indices2: Vec::with_capacity(max_n_edge),
            nodes_to_edge: HashMap::with_capacity(max_n_edge),
            edge_loc: Vec::with_capacity(n_rot1 * n_rot2 * max_n_edge),
        };
        // Padding lanes must stay well-formed for whole-quad sweeps.
        holder.prob.fill(1.0);
        holder.cur_belief.fill(1.0);
        holder.old_belief.fill(1.0);
        holder
    }

    pub fn n_rot1(&self) -> usize {
        self.n_rot1
    }

    pub fn n_rot2(&self) -> usize {
        self.n_rot2
    }

    /// Number of deduplicated edges currently held.
    pub fn n_edge(&self) -> usize {
        self.n_edge
    }

    pub fn edge_loc(&self) -> &[EdgeLoc] {
        &self.edge_loc
    }

    /// Node slot of endpoint 1 for edge `edge`.
    pub fn node1_of(&self, edge: usize) -> usize {
        self.edge_indices1[edge]
    }

    /// Node slot of endpoint 2 for edge `edge`.
    pub fn node2_of(&self, edge: usize) -> usize {
        self.edge_indices2[edge]
    }

    /// Pair-table entry `dim` of edge `edge`.
    pub fn prob_at(&self, dim: usize, edge: usize) -> f32 {
        self.prob.get(dim, edge)
    }

    /// Converged joint marginal entry `dim` of edge `edge`.
    pub fn marginal_at(&self, dim: usize, edge: usize) -> f32 {
        self.marginal.get(dim, edge)
    }

    /// Clears the edge set for a new evaluation. Table contents are
    /// re-initialized lazily as edges are inserted.
    pub fn reset(&mut self) {
        self.n_edge = 0;
        self.edge_indices1.clear();
        self.edge_indices2.clear();
        self.nodes_to_edge.clear();
        self.edge_loc.clear();
    }

    /// Exchanges the current and previous belief buffers in constant time.
    pub fn swap_beliefs(&mut self) {
        std::mem::swap(&mut self.cur_belief, &mut self.old_belief);
    }

    /// Resets the previous-belief buffer (padding included) at solve start.
    pub fn seed_old_beliefs(&mut self) {
        self.old_belief.fill(1.0);
    }

    /// Multiplies one source-graph contribution into the deduplicated edge for
    /// `(node1, node2)`, allocating the edge slot on first sight.
    ///
    /// The caller has already canonicalized the pair so that the residue with
    /// the smaller rotamer alphabet is endpoint 1.
    pub fn add_to_edge(
        &mut self,
        source_edge: usize,
        prob_value: f32,
        node1: u32,
        rot1: u32,
        node2: u32,
        rot2: u32,
    ) {
        let key = (u64::from(node1) << 32) | u64::from(node2);

        let idx = match self.nodes_to_edge.get(&key) {
            Some(&idx) => idx,
            None => {
                let idx = self.n_edge;
                self.nodes_to_edge.insert(key, idx);
                self.edge_indices1.push(node1 as usize);
                self.edge_indices2.push(node2 as usize);
                self.n_edge += 1;
                for dim in 0..self.n_rot1 * self.n_rot2 {
                    self.prob.set(dim, idx, 1.0);
                }
                idx
            }
        };

        let dim = (rot1 as usize) * self.n_rot2 + rot2 as usize;
        *self.prob.get_mut(dim, idx) *= prob_value;
        self.edge_loc.push(EdgeLoc {
            source_edge,
            dim,
            edge: idx,
        });
    }

    /// Folds every singleton-rotamer edge into its second endpoint's priors,
    /// eliminating the edge from belief propagation. Only meaningful when
    /// `n_rot1 == 1`: the pair table then has exactly `n_rot2` entries, one
    /// per rotamer of node 2.
    pub fn move_edge_prob_to_node2(&self, nodes2: &mut NodeHolder) {
        debug_assert_eq!(self.n_rot1, 1);
        for (edge, &node2) in self.edge_indices2.iter().enumerate() {
            for rot in 0..self.n_rot2 {
                *nodes2.prob.get_mut(rot, node2) *= self.prob.get(rot, edge);
            }
        }
    }

    /// Rescales each edge's pair table by its max entry, holding numerics in
    /// `[0, 1]`. One whole-quad pass per component.
    pub fn standardize_probs(&mut self) {
        let width = self.n_rot1 * self.n_rot2;
        for quad in 0..self.prob.n_quads() {
            let mut max_prob = f32x4::splat(BELIEF_EPS);
            for dim in 0..width {
                max_prob = max_prob.max(self.prob.load_quad(dim, quad));
            }
            let inv = f32x4::splat(1.0) / max_prob;
            for dim in 0..width {
                let rescaled = self.prob.load_quad(dim, quad) * inv;
                self.prob.store_quad(dim, quad, rescaled);
            }
        }
    }

    /// Largest signed difference `cur - old` over all belief components and
    /// edges. Padding lanes hold identical values in both buffers and so
    /// contribute zero.
    pub fn max_deviation(&self) -> f32 {
        let width = self.n_rot1 + self.n_rot2;
        let mut dev = f32x4::ZERO;
        for quad in 0..self.cur_belief.n_quads() {
            for comp in 0..width {
                let delta =
                    self.cur_belief.load_quad(comp, quad) - self.old_belief.load_quad(comp, quad);
                dev = dev.max(delta);
            }
        }
        horizontal_max(dev).max(0.0)
    }

    /// One asynchronous sweep of damped message updates over all edges.
    ///
    /// Both endpoints of every edge live in `nodes`; the solver only runs BP
    /// on the holder whose two alphabet classes coincide, every other pairing
    /// having been folded away or collapsed to a scalar beforehand.
    ///
    /// Edges are processed in ascending slot order and both endpoint node
    /// beliefs are updated immediately, so later edges in the same sweep see
    /// earlier edges' messages. This Gauss-Seidel ordering is part of the
    /// convergence contract; do not batch the node updates.
    pub fn update_beliefs<const R1: usize, const R2: usize>(
        &mut self,
        nodes: &mut NodeHolder,
        damping: f32,
    ) {
        debug_assert_eq!(self.n_rot1, R1);
        debug_assert_eq!(self.n_rot2, R2);

        for ne in 0..self.n_edge {
            let n1 = self.edge_indices1[ne];
            let n2 = self.edge_indices2[ne];

            let old_node1: [f32; R1] = nodes.old_belief.load(n1);
            let old_node2: [f32; R2] = nodes.old_belief.load(n2);

            let mut psi = [[0.0f32; R2]; R1];
            for (r1, row) in psi.iter_mut().enumerate() {
                for (r2, entry) in row.iter_mut().enumerate() {
                    *entry = self.prob.get(r1 * R2 + r2, ne);
                }
            }

            // Cavity messages: divide this edge's previous outgoing message
            // back out of the node belief to avoid double counting.
            let mut cavity1 = [0.0f32; R1];
            for (i, c) in cavity1.iter_mut().enumerate() {
                *c = old_node1[i] * recip_guarded(self.old_belief.get(i, ne));
            }
            let mut cavity2 = [0.0f32; R2];
            for (i, c) in cavity2.iter_mut().enumerate() {
                *c = old_node2[i] * recip_guarded(self.old_belief.get(R1 + i, ne));
            }

            let mut msg1 = [0.0f32; R1];
            for r1 in 0..R1 {
                let mut acc = 0.0;
                for r2 in 0..R2 {
                    acc += psi[r1][r2] * cavity2[r2];
                }
                msg1[r1] = acc;
            }
            let mut msg2 = [0.0f32; R2];
            for r2 in 0..R2 {
                let mut acc = 0.0;
                for r1 in 0..R1 {
                    acc += cavity1[r1] * psi[r1][r2];
                }
                msg2[r2] = acc;
            }

            // Rescale to avoid underflow in later sweeps.
            let inv1 = recip_guarded(max_component(&msg1));
            for m in msg1.iter_mut() {
                *m *= inv1;
            }
            let inv2 = recip_guarded(max_component(&msg2));
            for m in msg2.iter_mut() {
                *m *= inv2;
            }

            for (i, &m) in msg1.iter().enumerate() {
                let old = self.old_belief.get(i, ne);
                self.cur_belief
                    .set(i, ne, (1.0 - damping) * m + damping * old);
            }
            for (i, &m) in msg2.iter().enumerate() {
                let old = self.old_belief.get(R1 + i, ne);
                self.cur_belief
                    .set(R1 + i, ne, (1.0 - damping) * m + damping * old);
            }

            // Immediate node update; the cheap rescale keeps magnitudes near 1.
            let mut belief1: [f32; R1] = nodes.cur_belief.load(n1);
            for (b, &m) in belief1.iter_mut().zip(msg1.iter()) {
                *b *= m;
            }
            approx_normalize(&mut belief1);
            nodes.cur_belief.store(n1, belief1);

            let mut belief2: [f32; R2] = nodes.cur_belief.load(n2);
            for (b, &m) in belief2.iter_mut().zip(msg2.iter()) {
                *b *= m;
            }
            approx_normalize(&mut belief2);
            nodes.cur_belief.store(n2, belief2);
        }
    }

    /// Computes the converged joint marginal of every edge from the endpoint
    /// beliefs, the pair table, and the edge's own messages.
    pub fn calculate_marginals<const R1: usize, const R2: usize>(
        &mut self,
        nodes1: &NodeHolder,
        nodes2: &NodeHolder,
    ) {
        debug_assert_eq!(self.n_rot1, R1);
        debug_assert_eq!(self.n_rot2, R2);

        for ne in 0..self.n_edge {
            let b1: [f32; R1] = nodes1.cur_belief.load(self.edge_indices1[ne]);
            let b2: [f32; R2] = nodes2.cur_belief.load(self.edge_indices2[ne]);

            // Correct for self interaction: remove this edge's own message
            // from each endpoint belief before taking the product with psi.
            let mut cavity1 = [0.0f32; R1];
            for (i, c) in cavity1.iter_mut().enumerate() {
                *c = b1[i] / (BELIEF_EPS + self.cur_belief.get(i, ne));
            }
            let mut cavity2 = [0.0f32; R2];
            for (i, c) in cavity2.iter_mut().enumerate() {
                *c = b2[i] / (BELIEF_EPS + self.cur_belief.get(R1 + i, ne));
            }

            let mut joint = [[0.0f32; R2]; R1];
            let mut total = 0.0;
            for (r1, row) in joint.iter_mut().enumerate() {
                for (r2, entry) in row.iter_mut().enumerate() {
                    *entry = self.prob.get(r1 * R2 + r2, ne) * cavity1[r1] * cavity2[r2];
                    total += *entry;
                }
            }

            let inv = recip_guarded(total);
            for (r1, row) in joint.iter().enumerate() {
                for (r2, &entry) in row.iter().enumerate() {
                    self.marginal.set(r1 * R2 + r2, ne, entry * inv);
                }
            }
        }
    }

    /// Bethe pair contribution of edge `ne`: the average pair energy plus the
    /// mutual information of the joint marginal relative to the product of
    /// the endpoint marginals. The endpoint beliefs must already be
    /// L1-normalized.
    pub fn edge_free_energy<const R1: usize, const R2: usize>(
        &self,
        ne: usize,
        nodes1: &NodeHolder,
        nodes2: &NodeHolder,
    ) -> f32 {
        debug_assert_eq!(self.n_rot1, R1);
        debug_assert_eq!(self.n_rot2, R2);

        let b1: [f32; R1] = nodes1.cur_belief.load(self.edge_indices1[ne]);
        let b2: [f32; R2] = nodes2.cur_belief.load(self.edge_indices2[ne]);

        let mut en = 0.0;
        for r1 in 0..R1 {
            for r2 in 0..R2 {
                let dim = r1 * R2 + r2;
                let mu = self.marginal.get(dim, ne);
                let reference = self.prob.get(dim, ne) * b1[r1] * b2[r2];
                en += mu * ((BELIEF_EPS + mu) / (BELIEF_EPS + reference)).ln();
            }
        }
        en
    }

    /// Per-edge endpoint pairs, in slot order.
    pub fn endpoint_pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        izip!(&self.edge_indices1, &self.edge_indices2).map(|(&n1, &n2)| (n1, n2))
    }
}
