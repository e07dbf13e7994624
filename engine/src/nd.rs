//! N-dimensional block geometry for reserved index symbols.
//!
//! A kernel call evaluates one block of a larger C-ordered array. The
//! descriptor passed to native code is an `int64_t` array laid out as
//! `[ndim, shape[8], block_start[8], block_shape[8]]`.

use thiserror::Error;
use veckern::Reserved;
use veckern::expr::MAX_DIMS;

/// Number of `i64` slots in a descriptor.
pub const ND_DESCRIPTOR_LEN: usize = 1 + 3 * MAX_DIMS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NdError {
    #[error("ndim must be between 1 and {MAX_DIMS}, got {0}")]
    BadRank(usize),
    #[error("shape, block start and block shape must all have {expected} entries")]
    LengthMismatch { expected: usize },
    #[error("block does not fit the array along dimension {0}")]
    OutOfBounds(usize),
}

/// Global shape plus the position and extent of the block being evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdContext {
    shape: Vec<i64>,
    block_start: Vec<i64>,
    block_shape: Vec<i64>,
}

impl NdContext {
    pub fn new(shape: &[i64], block_start: &[i64], block_shape: &[i64]) -> Result<Self, NdError> {
        let ndim = shape.len();
        if ndim == 0 || ndim > MAX_DIMS {
            return Err(NdError::BadRank(ndim));
        }
        if block_start.len() != ndim || block_shape.len() != ndim {
            return Err(NdError::LengthMismatch { expected: ndim });
        }
        for d in 0..ndim {
            let (n, s, b) = (shape[d], block_start[d], block_shape[d]);
            if n < 0 || s < 0 || b < 0 || s.saturating_add(b) > n {
                return Err(NdError::OutOfBounds(d));
            }
        }
        Ok(NdContext {
            shape: shape.to_vec(),
            block_start: block_start.to_vec(),
            block_shape: block_shape.to_vec(),
        })
    }

    /// A whole 1-D array of `nitems` elements.
    pub fn linear(nitems: usize) -> Self {
        let n = nitems as i64;
        NdContext {
            shape: vec![n],
            block_start: vec![0],
            block_shape: vec![n],
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Elements in the block.
    pub fn block_len(&self) -> usize {
        self.block_shape.iter().map(|&n| n.max(0) as usize).product()
    }

    pub fn descriptor(&self) -> [i64; ND_DESCRIPTOR_LEN] {
        let mut desc = [0i64; ND_DESCRIPTOR_LEN];
        desc[0] = self.ndim() as i64;
        for d in 0..self.ndim() {
            desc[1 + d] = self.shape[d];
            desc[1 + MAX_DIMS + d] = self.block_start[d];
            desc[1 + 2 * MAX_DIMS + d] = self.block_shape[d];
        }
        desc
    }

    /// Value of `reserved` for block item `idx`.
    pub fn reserved_value(&self, reserved: Reserved, idx: usize) -> i64 {
        reserved_in(
            &self.shape,
            &self.block_start,
            &self.block_shape,
            reserved,
            idx as i64,
        )
    }
}

/// Global coordinate of block item `idx` along every dimension.
fn coordinates(block_start: &[i64], block_shape: &[i64], idx: i64) -> [i64; MAX_DIMS] {
    let mut coord = [0i64; MAX_DIMS];
    let mut rem = idx;
    for d in (0..block_shape.len()).rev() {
        let extent = block_shape[d];
        let local = if extent > 0 {
            let r = rem % extent;
            rem /= extent;
            r
        } else {
            0
        };
        coord[d] = block_start[d] + local;
    }
    coord
}

fn reserved_in(
    shape: &[i64],
    block_start: &[i64],
    block_shape: &[i64],
    reserved: Reserved,
    idx: i64,
) -> i64 {
    let ndim = shape.len();
    match reserved {
        Reserved::NDim => ndim as i64,
        Reserved::Extent(d) => shape.get(d).copied().unwrap_or(1),
        Reserved::Index(d) if d < ndim => coordinates(block_start, block_shape, idx)[d],
        Reserved::Index(_) => 0,
        Reserved::FlatIdx => {
            let coord = coordinates(block_start, block_shape, idx);
            (0..ndim).fold(0i64, |acc, d| acc.wrapping_mul(shape[d]).wrapping_add(coord[d]))
        }
    }
}

/// Integer tag for `reserved`, passed to [`reserved_from_descriptor`].
#[cfg(feature = "llvm")]
pub(crate) fn reserved_code(reserved: Reserved) -> i32 {
    match reserved {
        Reserved::NDim => 0,
        Reserved::FlatIdx => 1,
        Reserved::Index(d) => 16 + d as i32,
        Reserved::Extent(d) => 32 + d as i32,
    }
}

#[cfg(feature = "llvm")]
fn reserved_from_code(code: i32) -> Option<Reserved> {
    let dim = |base: i32| usize::try_from(code - base).ok().filter(|d| *d < MAX_DIMS);
    match code {
        0 => Some(Reserved::NDim),
        1 => Some(Reserved::FlatIdx),
        16..=31 => dim(16).map(Reserved::Index),
        32..=47 => dim(32).map(Reserved::Extent),
        _ => None,
    }
}

/// Reserved value computed straight from a native ND descriptor.
///
/// Called from embedded-backend kernels; a null descriptor or an unknown
/// code yields 0.
///
/// # Safety
/// `desc` must be null or point to [`ND_DESCRIPTOR_LEN`] readable `i64`s.
#[cfg(feature = "llvm")]
pub(crate) unsafe extern "C" fn reserved_from_descriptor(desc: *const i64, code: i32, idx: i64) -> i64 {
    let Some(reserved) = reserved_from_code(code) else {
        return 0;
    };
    if desc.is_null() {
        return 0;
    }
    // SAFETY: guaranteed by the caller.
    let desc = unsafe { std::slice::from_raw_parts(desc, ND_DESCRIPTOR_LEN) };
    let ndim = desc[0].clamp(0, MAX_DIMS as i64) as usize;
    let shape = &desc[1..1 + ndim];
    let start = &desc[1 + MAX_DIMS..1 + MAX_DIMS + ndim];
    let block = &desc[1 + 2 * MAX_DIMS..1 + 2 * MAX_DIMS + ndim];
    reserved_in(shape, start, block, reserved, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_defaults() {
        let nd = NdContext::linear(5);
        assert_eq!(nd.reserved_value(Reserved::NDim, 3), 1);
        assert_eq!(nd.reserved_value(Reserved::Extent(0), 3), 5);
        assert_eq!(nd.reserved_value(Reserved::Index(0), 3), 3);
        assert_eq!(nd.reserved_value(Reserved::FlatIdx, 3), 3);
        assert_eq!(nd.reserved_value(Reserved::Extent(2), 3), 1);
        assert_eq!(nd.reserved_value(Reserved::Index(2), 3), 0);
    }

    #[test]
    fn test_block_coordinates() {
        // 4x6 array, block rows 1..3, cols 2..5
        let nd = NdContext::new(&[4, 6], &[1, 2], &[2, 3]).unwrap();
        assert_eq!(nd.block_len(), 6);
        // item 4 -> local (1, 1) -> global (2, 3)
        assert_eq!(nd.reserved_value(Reserved::Index(0), 4), 2);
        assert_eq!(nd.reserved_value(Reserved::Index(1), 4), 3);
        assert_eq!(nd.reserved_value(Reserved::FlatIdx, 4), 2 * 6 + 3);
    }

    #[test]
    fn test_descriptor_layout() {
        let nd = NdContext::new(&[4, 6], &[1, 0], &[2, 6]).unwrap();
        let desc = nd.descriptor();
        assert_eq!(desc[0], 2);
        assert_eq!(&desc[1..3], &[4, 6]);
        assert_eq!(&desc[9..11], &[1, 0]);
        assert_eq!(&desc[17..19], &[2, 6]);
    }

    #[cfg(feature = "llvm")]
    #[test]
    fn test_descriptor_helper_agrees() {
        let nd = NdContext::new(&[3, 4, 5], &[1, 0, 2], &[2, 4, 3]).unwrap();
        let desc = nd.descriptor();
        let all = [
            Reserved::NDim,
            Reserved::FlatIdx,
            Reserved::Index(0),
            Reserved::Index(2),
            Reserved::Index(5),
            Reserved::Extent(1),
            Reserved::Extent(7),
        ];
        for idx in 0..nd.block_len() {
            for r in all {
                let native = unsafe { reserved_from_descriptor(desc.as_ptr(), reserved_code(r), idx as i64) };
                assert_eq!(native, nd.reserved_value(r, idx), "{r:?} at {idx}");
            }
        }
        assert_eq!(unsafe { reserved_from_descriptor(std::ptr::null(), 0, 0) }, 0);
    }

    #[test]
    fn test_validation() {
        assert_eq!(NdContext::new(&[], &[], &[]), Err(NdError::BadRank(0)));
        assert!(matches!(
            NdContext::new(&[4], &[3], &[2]),
            Err(NdError::OutOfBounds(0))
        ));
        assert!(NdContext::new(&[4, 4], &[0], &[4]).is_err());
    }
}
