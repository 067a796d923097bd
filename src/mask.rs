use crate::update::IesError;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Ordered activity flags for one ensemble axis (realizations or
/// observations), with the active count precomputed so sub-matrix
/// construction never rescans the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    bits: Vec<bool>,
    active: usize,
}

impl Mask {
    /// All-active mask of the given length.
    pub fn new_active(len: usize) -> Self {
        Self {
            bits: vec![true; len],
            active: len,
        }
    }

    pub fn from_bits(bits: &[bool]) -> Self {
        let active = bits.iter().filter(|b| **b).count();
        Self {
            bits: bits.to_vec(),
            active,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.bits[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    /// Indices of the active entries, in mask order.
    pub fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }
}

impl From<&[bool]> for Mask {
    fn from(bits: &[bool]) -> Self {
        Self::from_bits(bits)
    }
}

impl<const N: usize> From<[bool; N]> for Mask {
    fn from(bits: [bool; N]) -> Self {
        Self::from_bits(&bits)
    }
}

/// Extract the active sub-matrix of `full`: entries whose row is active in
/// `row_mask` and whose column is active in `col_mask`, with the ordering of
/// `full` preserved.
pub fn alloc_active<S: Data<Elem = f64>>(
    full: &ArrayBase<S, Ix2>,
    row_mask: &Mask,
    col_mask: &Mask,
) -> Result<Array2<f64>, IesError> {
    if full.nrows() != row_mask.len() || full.ncols() != col_mask.len() {
        return Err(IesError::Shape(format!(
            "active slice: matrix is {}x{} but masks cover {}x{}",
            full.nrows(),
            full.ncols(),
            row_mask.len(),
            col_mask.len()
        )));
    }

    let mut active = Array2::<f64>::zeros((row_mask.active_count(), col_mask.active_count()));
    let mut row = 0;
    for i in 0..row_mask.len() {
        if !row_mask.get(i) {
            continue;
        }
        let mut col = 0;
        for j in 0..col_mask.len() {
            if col_mask.get(j) {
                active[[row, col]] = full[[i, j]];
                col += 1;
            }
        }
        row += 1;
    }
    Ok(active)
}
