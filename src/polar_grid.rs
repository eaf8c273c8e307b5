//! Polar scan grid with wrap-aware azimuth indexing
//!
//! All per-cell fields in this crate share one shape: `num_beams` azimuth
//! samples by `num_gates` range samples, stored flat in azimuth-major order
//! (`az * num_gates + r`). Azimuth wraps modulo `num_beams` — a smoothing
//! window spanning 359°→0° must see exactly the same cells as one that does
//! not cross north — while range never wraps.
//!
//! ## Example
//!
//! ```
//! use refract_core::polar_grid::PolarGrid;
//!
//! let mut grid = PolarGrid::new(360, 100, 0.0f64);
//! *grid.get_mut(359, 10) = 1.5;
//! // Signed azimuth offsets wrap around north:
//! assert_eq!(*grid.get_wrapped(-1, 10), 1.5);
//! assert_eq!(*grid.get_wrapped(719, 10), 1.5);
//! ```

/// A `num_beams × num_gates` polar field stored flat in azimuth-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarGrid<T> {
    num_beams: usize,
    num_gates: usize,
    data: Vec<T>,
}

impl<T: Clone> PolarGrid<T> {
    /// Create a grid with every cell set to `fill`.
    pub fn new(num_beams: usize, num_gates: usize, fill: T) -> Self {
        Self {
            num_beams,
            num_gates,
            data: vec![fill; num_beams * num_gates],
        }
    }

    /// Reset every cell to `fill` without reallocating.
    pub fn fill(&mut self, fill: T) {
        for cell in &mut self.data {
            *cell = fill.clone();
        }
    }
}

impl<T> PolarGrid<T> {
    /// Build a grid from a flat azimuth-major vector.
    pub fn from_vec(num_beams: usize, num_gates: usize, data: Vec<T>) -> Option<Self> {
        if data.len() != num_beams * num_gates {
            return None;
        }
        Some(Self {
            num_beams,
            num_gates,
            data,
        })
    }

    /// Number of azimuth samples.
    #[inline]
    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    /// Number of range samples.
    #[inline]
    pub fn num_gates(&self) -> usize {
        self.num_gates
    }

    /// Total cell count.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the grid holds no cells.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fold a signed azimuth index into `[0, num_beams)`.
    #[inline]
    pub fn wrap_az(&self, az: isize) -> usize {
        az.rem_euclid(self.num_beams as isize) as usize
    }

    /// Flat index for an in-range beam/gate pair.
    #[inline]
    pub fn index(&self, az: usize, r: usize) -> usize {
        debug_assert!(az < self.num_beams && r < self.num_gates);
        az * self.num_gates + r
    }

    /// Cell at an in-range beam/gate pair.
    #[inline]
    pub fn get(&self, az: usize, r: usize) -> &T {
        &self.data[self.index(az, r)]
    }

    /// Mutable cell at an in-range beam/gate pair.
    #[inline]
    pub fn get_mut(&mut self, az: usize, r: usize) -> &mut T {
        let k = self.index(az, r);
        &mut self.data[k]
    }

    /// Cell at a signed azimuth (wrapped) and in-range gate.
    #[inline]
    pub fn get_wrapped(&self, az: isize, r: usize) -> &T {
        let az = self.wrap_az(az);
        self.get(az, r)
    }

    /// Flat view of the whole field.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable flat view of the whole field.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// True when `other` has the same shape.
    pub fn same_shape<U>(&self, other: &PolarGrid<U>) -> bool {
        self.num_beams == other.num_beams && self.num_gates == other.num_gates
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // 1. Flat layout is azimuth-major
    // -----------------------------------------------------------------------
    #[test]
    fn test_flat_index_layout() {
        let mut g = PolarGrid::new(4, 10, 0u32);
        *g.get_mut(2, 7) = 42;
        assert_eq!(g.as_slice()[2 * 10 + 7], 42);
    }

    // -----------------------------------------------------------------------
    // 2. Azimuth wrap: negative and overflowing indices
    // -----------------------------------------------------------------------
    #[test]
    fn test_wrap_az() {
        let g = PolarGrid::new(36, 5, 0u8);
        assert_eq!(g.wrap_az(-1), 35);
        assert_eq!(g.wrap_az(36), 0);
        assert_eq!(g.wrap_az(-37), 35);
        assert_eq!(g.wrap_az(73), 1);
    }

    // -----------------------------------------------------------------------
    // 3. A window crossing north sees the same cells as one that does not
    // -----------------------------------------------------------------------
    #[test]
    fn test_window_wrap_equivalence() {
        let num_beams = 36;
        let mut g = PolarGrid::new(num_beams, 3, 0.0f64);
        for az in 0..num_beams {
            *g.get_mut(az, 1) = az as f64;
        }
        // Collect a ±2 window centred on azimuth 0 (crosses north) and on
        // azimuth 18 (does not), then compare against the rotated expectation.
        for centre in [0isize, 18] {
            let cells: Vec<f64> = (-2..=2)
                .map(|daz| *g.get_wrapped(centre + daz, 1))
                .collect();
            let expect: Vec<f64> = (-2..=2)
                .map(|daz| g.wrap_az(centre + daz) as f64)
                .collect();
            assert_eq!(cells, expect, "window mismatch at centre {centre}");
        }
    }

    // -----------------------------------------------------------------------
    // 4. from_vec rejects wrong lengths
    // -----------------------------------------------------------------------
    #[test]
    fn test_from_vec_shape_check() {
        assert!(PolarGrid::from_vec(3, 4, vec![0u8; 12]).is_some());
        assert!(PolarGrid::from_vec(3, 4, vec![0u8; 11]).is_none());
    }

    // -----------------------------------------------------------------------
    // 5. fill resets in place
    // -----------------------------------------------------------------------
    #[test]
    fn test_fill() {
        let mut g = PolarGrid::new(2, 2, 1.0f64);
        g.fill(7.0);
        assert!(g.as_slice().iter().all(|&v| v == 7.0));
    }
}
