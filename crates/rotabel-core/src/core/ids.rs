use thiserror::Error;

/// Width in bits of each packed sub-field of a [`BeadId`].
///
/// This constant is part of the contract with the interaction graph: both sides
/// must agree on it for ids to decode consistently.
pub const ROTAMER_FIELD_BITS: u32 = 4;

/// One more than the largest representable rotamer alphabet (handles 0).
pub const UPPER_ROT: u32 = 4;

const FIELD_MASK: u32 = (1 << ROTAMER_FIELD_BITS) - 1;

/// Errors raised while decoding a packed bead id.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    #[error("rotamer index {rot} is out of range for a residue with {n_rot} rotamers")]
    RotamerOutOfRange { rot: u32, n_rot: u32 },

    #[error("invalid rotamer count {n_rot} (must be below {UPPER_ROT})")]
    RotamerCountTooLarge { n_rot: u32 },
}

/// Packed identity of one bead reported by the interaction graph.
///
/// Three sub-fields of [`ROTAMER_FIELD_BITS`] bits each are packed from least to
/// most significant: the current rotamer index `rot`, the size of the residue's
/// rotamer alphabet `n_rot`, and the residue's local index within its alphabet
/// class. Everything above the residue index is opaque to the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeadId(u32);

/// The validated fields of a [`BeadId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedBead {
    /// Local residue index within its alphabet class.
    pub residue: u32,
    /// Size of this residue's rotamer alphabet.
    pub n_rot: u32,
    /// Current rotamer index, `0..n_rot`.
    pub rot: u32,
}

impl BeadId {
    /// Wraps a raw id as produced by the interaction graph.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Packs `(residue, n_rot, rot)` into an id. Inverse of [`BeadId::decode`].
    pub fn pack(residue: u32, n_rot: u32, rot: u32) -> Self {
        debug_assert!(rot <= FIELD_MASK && n_rot <= FIELD_MASK);
        Self((residue << (2 * ROTAMER_FIELD_BITS)) | (n_rot << ROTAMER_FIELD_BITS) | rot)
    }

    /// The raw packed value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The rotamer-index field, without validation.
    pub fn rot_field(self) -> u32 {
        self.0 & FIELD_MASK
    }

    /// The rotamer-count field, without validation.
    ///
    /// Used for canonical edge ordering: endpoints are swapped so the smaller
    /// count comes first, before either id is fully decoded.
    pub fn rotamer_count_field(self) -> u32 {
        (self.0 >> ROTAMER_FIELD_BITS) & FIELD_MASK
    }

    /// Extracts and validates all three fields.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] when `rot >= n_rot` or `n_rot >= UPPER_ROT`.
    pub fn decode(self) -> Result<DecodedBead, IdError> {
        let mut id = self.0;
        let rot = id & FIELD_MASK;
        id >>= ROTAMER_FIELD_BITS;
        let n_rot = id & FIELD_MASK;
        id >>= ROTAMER_FIELD_BITS;

        if rot >= n_rot {
            return Err(IdError::RotamerOutOfRange { rot, n_rot });
        }
        if n_rot >= UPPER_ROT {
            return Err(IdError::RotamerCountTooLarge { n_rot });
        }

        Ok(DecodedBead {
            residue: id,
            n_rot,
            rot,
        })
    }
}
