//! Vector storage specialized for the fixed-small-alphabet case.
//!
//! Two flavors: [`DenseStore`] keeps `R` components per element in a plain
//! component-major array and backs the per-residue node state;
//! [`PackedStore`] interleaves components in quads of four elements (AoSoA)
//! so that one edge's whole table, or four edges' worth of one component,
//! can be loaded with short-vector instructions.

mod dense;
mod packed;

pub use dense::DenseStore;
pub use packed::{PackedStore, SIMD_LANES};
