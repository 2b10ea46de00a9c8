use wide::f32x4;

/// Lane width of the AoSoA packing.
pub const SIMD_LANES: usize = 4;

/// AoSoA-packed array of `elem_width` floats per element.
///
/// Elements are grouped in quads of [`SIMD_LANES`]. Within the quad starting
/// at element `q * 4`, the block layout is component 0 of all four elements,
/// then component 1 of all four elements, and so on, so scalar access is
/// `data[(e - e % 4) * W + comp * 4 + e % 4]` and a whole component of a quad
/// is one contiguous vector load.
///
/// The element count is rounded up to a multiple of the lane width. Callers
/// that sweep whole quads rely on the padded elements staying well-formed;
/// [`PackedStore::fill`] covers the padding, and per-element writes never
/// touch it.
#[derive(Debug, Clone)]
pub struct PackedStore {
    elem_width: usize,
    n_elem: usize,
    data: Vec<f32>,
}

fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}

impl PackedStore {
    /// Creates storage for at least `n_elem_min` elements of `elem_width`
    /// components each, padded up to a whole number of quads.
    pub fn new(elem_width: usize, n_elem_min: usize) -> Self {
        let n_elem = round_up(n_elem_min, SIMD_LANES);
        Self {
            elem_width,
            n_elem,
            data: vec![0.0; n_elem * elem_width],
        }
    }

    pub fn elem_width(&self) -> usize {
        self.elem_width
    }

    /// Padded element count (a multiple of the lane width).
    pub fn n_elem(&self) -> usize {
        self.n_elem
    }

    pub fn n_quads(&self) -> usize {
        self.n_elem / SIMD_LANES
    }

    #[inline]
    fn offset(&self, comp: usize, elem: usize) -> usize {
        debug_assert!(comp < self.elem_width && elem < self.n_elem);
        (elem - elem % SIMD_LANES) * self.elem_width + comp * SIMD_LANES + elem % SIMD_LANES
    }

    #[inline]
    pub fn get(&self, comp: usize, elem: usize) -> f32 {
        self.data[self.offset(comp, elem)]
    }

    #[inline]
    pub fn get_mut(&mut self, comp: usize, elem: usize) -> &mut f32 {
        let offset = self.offset(comp, elem);
        &mut self.data[offset]
    }

    #[inline]
    pub fn set(&mut self, comp: usize, elem: usize, value: f32) {
        *self.get_mut(comp, elem) = value;
    }

    /// Overwrites every entry, padding included.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Loads one component of the four elements of quad `quad` in a single
    /// vector. This is the hot-path access the packing exists for.
    #[inline]
    pub fn load_quad(&self, comp: usize, quad: usize) -> f32x4 {
        debug_assert!(comp < self.elem_width && quad < self.n_quads());
        let base = quad * self.elem_width * SIMD_LANES + comp * SIMD_LANES;
        f32x4::from([
            self.data[base],
            self.data[base + 1],
            self.data[base + 2],
            self.data[base + 3],
        ])
    }

    /// Stores one component of the four elements of quad `quad`.
    #[inline]
    pub fn store_quad(&mut self, comp: usize, quad: usize, values: f32x4) {
        debug_assert!(comp < self.elem_width && quad < self.n_quads());
        let base = quad * self.elem_width * SIMD_LANES + comp * SIMD_LANES;
        self.data[base..base + SIMD_LANES].copy_from_slice(&values.to_array());
    }

    /// Loads all `W` components of one element.
    #[inline]
    pub fn load<const W: usize>(&self, elem: usize) -> [f32; W] {
        debug_assert_eq!(self.elem_width, W);
        let mut out = [0.0; W];
        for (comp, slot) in out.iter_mut().enumerate() {
            *slot = self.get(comp, elem);
        }
        out
    }

    /// Stores all `W` components of one element.
    #[inline]
    pub fn store<const W: usize>(&mut self, elem: usize, values: [f32; W]) {
        debug_assert_eq!(self.elem_width, W);
        for (comp, value) in values.into_iter().enumerate() {
            self.set(comp, elem, value);
        }
    }
}
