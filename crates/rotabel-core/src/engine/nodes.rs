use crate::core::storage::DenseStore;
use crate::core::utils::numeric::{max_component, recip_guarded, BELIEF_EPS};

/// Per-residue state for one rotamer alphabet size.
///
/// Holds the unnormalized priors (`prob`) and two belief buffers that the
/// solver ping-pongs between sweeps. Beliefs are kept roughly in `[0, 1]` by
/// max-rescaling; exact L1 normalization only happens in
/// [`NodeHolder::calculate_marginals`].
#[derive(Debug)]
pub struct NodeHolder {
    n_rot: usize,
    n_elem: usize,
    pub(crate) prob: DenseStore,
    pub(crate) cur_belief: DenseStore,
    pub(crate) old_belief: DenseStore,
}

impl NodeHolder {
    pub fn new(n_rot: usize, n_elem: usize) -> Self {
        let mut holder = Self {
            n_rot,
            n_elem,
            prob: DenseStore::new(n_rot, n_elem),
            cur_belief: DenseStore::new(n_rot, n_elem),
            old_belief: DenseStore::new(n_rot, n_elem),
        };
        holder.cur_belief.fill(1.0);
        holder.old_belief.fill(1.0);
        holder.reset();
        holder
    }

    pub fn n_rot(&self) -> usize {
        self.n_rot
    }

    pub fn n_elem(&self) -> usize {
        self.n_elem
    }

    /// Current belief (or marginal, after [`NodeHolder::calculate_marginals`])
    /// for rotamer `rot` of element `elem`.
    pub fn belief_at(&self, rot: usize, elem: usize) -> f32 {
        self.cur_belief.get(rot, elem)
    }

    /// Unnormalized prior for rotamer `rot` of element `elem`.
    pub fn prob_at(&self, rot: usize, elem: usize) -> f32 {
        self.prob.get(rot, elem)
    }

    /// Clears the priors back to 1 for a new evaluation.
    pub fn reset(&mut self) {
        self.prob.fill(1.0);
    }

    /// Exchanges the current and previous belief buffers in constant time.
    pub fn swap_beliefs(&mut self) {
        std::mem::swap(&mut self.cur_belief, &mut self.old_belief);
    }

    /// Seeds the previous-belief buffer from the priors at the start of a solve.
    pub fn seed_old_from_prob(&mut self) {
        self.old_belief.copy_from(&self.prob);
    }

    /// Starts a sweep by resetting the running beliefs to the priors; the edge
    /// sweep then multiplies its messages in.
    pub fn begin_belief_update(&mut self) {
        self.cur_belief.copy_from(&self.prob);
    }

    /// Rescales each element's priors by its max component to hold numerics in
    /// `[0, 1]`. The argmax is left invariant.
    pub fn standardize_probs(&mut self) {
        for elem in 0..self.n_elem {
            let mut max_prob = BELIEF_EPS;
            for rot in 0..self.n_rot {
                max_prob = max_prob.max(self.prob.get(rot, elem));
            }
            let inv = 1.0 / max_prob;
            for rot in 0..self.n_rot {
                *self.prob.get_mut(rot, elem) *= inv;
            }
        }
    }

    /// Applies damping and max-rescaling after an edge sweep:
    /// `b <- (1 - d) * b / max(b) + d * b_old`.
    pub fn finish_belief_update<const R: usize>(&mut self, damping: f32) {
        debug_assert_eq!(self.n_rot, R);
        for elem in 0..self.n_elem {
            let cur: [f32; R] = self.cur_belief.load(elem);
            let old: [f32; R] = self.old_belief.load(elem);
            let rescale = (1.0 - damping) * recip_guarded(max_component(&cur));
            let mut out = [0.0; R];
            for rot in 0..R {
                out[rot] = rescale * cur[rot] + damping * old[rot];
            }
            self.cur_belief.store(elem, out);
        }
    }

    /// Largest signed difference `cur - old` over all components and elements.
    ///
    /// Deliberately signed, not absolute: the zero-initialized accumulator
    /// clamps negative deviations. This is the stopping heuristic the iteration
    /// counts depend on.
    pub fn max_deviation(&self) -> f32 {
        let mut dev = 0.0f32;
        for rot in 0..self.n_rot {
            for elem in 0..self.n_elem {
                dev = dev.max(self.cur_belief.get(rot, elem) - self.old_belief.get(rot, elem));
            }
        }
        dev
    }

    /// L1-normalizes the current beliefs in place, turning them into marginals.
    pub fn calculate_marginals<const R: usize>(&mut self) {
        debug_assert_eq!(self.n_rot, R);
        for elem in 0..self.n_elem {
            let b: [f32; R] = self.cur_belief.load(elem);
            let inv = recip_guarded(b.iter().sum());
            let mut out = [0.0; R];
            for rot in 0..R {
                out[rot] = b[rot] * inv;
            }
            self.cur_belief.store(elem, out);
        }
    }

    /// Bethe single-node free energy of element `elem`: the average energy
    /// minus entropy relative to the node prior,
    /// `sum_r b[r] * log((b[r] + eps) / (p[r] + eps))` with `b` L1-normalized.
    pub fn node_free_energy<const R: usize>(&self, elem: usize) -> f32 {
        debug_assert_eq!(self.n_rot, R);
        let mut b: [f32; R] = self.cur_belief.load(elem);
        let inv = recip_guarded(b.iter().sum());
        for x in b.iter_mut() {
            *x *= inv;
        }
        let p: [f32; R] = self.prob.load(elem);

        let mut en = 0.0;
        for rot in 0..R {
            en += b[rot] * ((BELIEF_EPS + b[rot]) / (BELIEF_EPS + p[rot])).ln();
        }
        en
    }
}
