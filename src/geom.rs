use std::fmt;

use itertools::Itertools;

/// A static-rank tuple of sizes describing the shape of a data region or
/// compute domain. Rank is a compile-time property: extents of different
/// ranks cannot be combined, so rank mismatch never exists at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent<const R: usize>([usize; R]);

/// A static-rank tuple of signed coordinates identifying one point within
/// an [`Extent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index<const R: usize>([isize; R]);

impl<const R: usize> Default for Extent<R> {
    #[inline]
    fn default() -> Self {
        Self([0; R])
    }
}

impl<const R: usize> Default for Index<R> {
    #[inline]
    fn default() -> Self {
        Self([0; R])
    }
}

impl<const R: usize> From<[usize; R]> for Extent<R> {
    #[inline]
    fn from(value: [usize; R]) -> Self {
        Self(value)
    }
}

impl<const R: usize> From<Extent<R>> for [usize; R] {
    #[inline]
    fn from(value: Extent<R>) -> Self {
        value.0
    }
}

impl<const R: usize> From<[isize; R]> for Index<R> {
    #[inline]
    fn from(value: [isize; R]) -> Self {
        Self(value)
    }
}

impl<const R: usize> From<Index<R>> for [isize; R] {
    #[inline]
    fn from(value: Index<R>) -> Self {
        value.0
    }
}

impl<const R: usize> fmt::Display for Extent<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().format(", "))
    }
}

impl<const R: usize> fmt::Display for Index<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().format(", "))
    }
}

impl<const R: usize> Extent<R> {
    #[inline]
    pub const fn new(dims: [usize; R]) -> Self {
        Self(dims)
    }

    #[inline]
    pub fn dims(&self) -> [usize; R] {
        self.0
    }

    /// Total number of points in the domain, the product of all dimensions.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns `true` if every coordinate of `index` lies within `0..dim`.
    #[inline]
    pub fn contains(&self, index: Index<R>) -> bool {
        itertools::izip!(index.0.iter(), self.0.iter())
            .all(|(&index, &dim)| index >= 0 && (index as usize) < dim)
    }

    /// Row-major linear offset of `index`, the last axis being contiguous.
    ///
    /// # Panics
    /// Panics if `index` lies outside the extent.
    #[inline]
    pub fn index_of(&self, index: Index<R>) -> usize {
        assert!(
            self.contains(index),
            "index {index} out of extent {self}",
        );
        itertools::izip!(index.0.iter(), self.0.iter())
            .fold(0, |offset, (&index, &dim)| offset * dim + index as usize)
    }

    /// Iterate all indices of the domain in row-major order.
    #[inline]
    pub fn iter(&self) -> ExtentIter<R> {
        ExtentIter {
            dims: self.0,
            cursor: [0; R],
            done: self.is_empty(),
        }
    }
}

impl<const R: usize> Index<R> {
    #[inline]
    pub const fn new(coords: [isize; R]) -> Self {
        Self(coords)
    }

    #[inline]
    pub fn coords(&self) -> [isize; R] {
        self.0
    }
}

impl<const R: usize> std::ops::Index<usize> for Extent<R> {
    type Output = usize;

    #[inline]
    fn index(&self, axis: usize) -> &Self::Output {
        &self.0[axis]
    }
}

impl<const R: usize> std::ops::Index<usize> for Index<R> {
    type Output = isize;

    #[inline]
    fn index(&self, axis: usize) -> &Self::Output {
        &self.0[axis]
    }
}

macro_rules! impl_component_wise {
    ($trait:ident, $f:ident, $lhs:ident, $rhs:ident, $out:ident, $elem:ty, $op:tt) => {
        impl<const R: usize> std::ops::$trait<$rhs<R>> for $lhs<R> {
            type Output = $out<R>;

            #[inline]
            fn $f(self, rhs: $rhs<R>) -> Self::Output {
                let mut output = self.0;
                for (output, rhs) in output.iter_mut().zip(rhs.0.iter()) {
                    *output = *output $op (*rhs as $elem);
                }
                $out(output)
            }
        }
    };
}

impl_component_wise!(Add, add, Extent, Extent, Extent, usize, +);
impl_component_wise!(Sub, sub, Extent, Extent, Extent, usize, -);
impl_component_wise!(Add, add, Index, Index, Index, isize, +);
impl_component_wise!(Sub, sub, Index, Index, Index, isize, -);
impl_component_wise!(Add, add, Index, Extent, Index, isize, +);
impl_component_wise!(Sub, sub, Index, Extent, Index, isize, -);

/// Row-major odometer over the indices of an [`Extent`].
#[derive(Debug, Clone)]
pub struct ExtentIter<const R: usize> {
    dims: [usize; R],
    cursor: [usize; R],
    done: bool,
}

impl<const R: usize> Iterator for ExtentIter<R> {
    type Item = Index<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = Index(self.cursor.map(|x| x as isize));
        self.done = true;
        for axis in (0..R).rev() {
            self.cursor[axis] += 1;
            if self.cursor[axis] < self.dims[axis] {
                self.done = false;
                break;
            }
            self.cursor[axis] = 0;
        }
        Some(item)
    }
}

/// A compute domain partitioned into fixed-size cooperative tiles.
/// Produced by [`Extent::tile`]; tile sides are compile-time constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledExtent<const R: usize> {
    extent: Extent<R>,
    tile: [usize; R],
}

impl<const R: usize> fmt::Display for TiledExtent<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / [{}]", self.extent, self.tile.iter().format(", "))
    }
}

impl Extent<1> {
    #[inline]
    pub fn tile<const B0: usize>(self) -> TiledExtent<1> {
        const { assert!(B0 > 0, "tile dimension must be positive") }
        TiledExtent {
            extent: self,
            tile: [B0],
        }
    }
}

impl Extent<2> {
    #[inline]
    pub fn tile<const B0: usize, const B1: usize>(self) -> TiledExtent<2> {
        const { assert!(B0 > 0 && B1 > 0, "tile dimensions must be positive") }
        TiledExtent {
            extent: self,
            tile: [B0, B1],
        }
    }
}

impl Extent<3> {
    #[inline]
    pub fn tile<const B0: usize, const B1: usize, const B2: usize>(self) -> TiledExtent<3> {
        const { assert!(B0 > 0 && B1 > 0 && B2 > 0, "tile dimensions must be positive") }
        TiledExtent {
            extent: self,
            tile: [B0, B1, B2],
        }
    }
}

impl<const R: usize> TiledExtent<R> {
    /// The underlying compute domain.
    #[inline]
    pub fn extent(&self) -> Extent<R> {
        self.extent
    }

    /// The tile sides as an extent.
    #[inline]
    pub fn tile_extent(&self) -> Extent<R> {
        Extent(self.tile)
    }

    /// Number of threads cooperating in one tile.
    #[inline]
    pub fn tile_size(&self) -> usize {
        self.tile.iter().product()
    }

    /// How many whole-or-partial tiles cover the domain along each axis.
    /// Computed by ceiling division: domains whose size is not a multiple
    /// of the tile side are covered by a partial tile at the end.
    #[inline]
    pub fn tile_counts(&self) -> Extent<R> {
        let mut counts = self.extent.0;
        for (count, &tile) in counts.iter_mut().zip(self.tile.iter()) {
            *count = count.div_ceil(tile);
        }
        Extent(counts)
    }

    /// Iterate the coordinates of all tiles covering the domain.
    #[inline]
    pub fn tiles(&self) -> ExtentIter<R> {
        self.tile_counts().iter()
    }

    /// Global coordinate of the first point of the tile at `tile`.
    #[inline]
    pub fn tile_origin(&self, tile: Index<R>) -> Index<R> {
        let mut origin = tile.0;
        for (origin, &side) in origin.iter_mut().zip(self.tile.iter()) {
            *origin *= side as isize;
        }
        Index(origin)
    }
}

/// Coordinates of one thread within a tiled dispatch: its position in the
/// whole domain, within its tile, and the tile's own coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledIndex<const R: usize> {
    /// Coordinate in the global compute domain. May lie outside the
    /// dispatch extent in boundary tiles.
    pub global: Index<R>,
    /// Coordinate within the tile.
    pub local: Index<R>,
    /// Coordinate of the tile itself.
    pub tile: Index<R>,
    /// Global coordinate of the tile's first point.
    pub tile_origin: Index<R>,
}

#[cfg(test)]
mod tests {
    use super::{Extent, Index};

    #[test]
    fn test_extent_arithmetic() {
        let a = Extent::from([4, 6]);
        let b = Extent::from([1, 2]);
        assert_eq!(a + b, [5, 8].into());
        assert_eq!(a - b, [3, 4].into());
        assert_eq!(a.size(), 24);

        let i = Index::from([2, -1]);
        let j = Index::from([1, 1]);
        assert_eq!(i + j, [3, 0].into());
        assert_eq!(i - j, [1, -2].into());
        assert_eq!(i + a, [6, 5].into());
    }

    #[test]
    fn test_extent_contains() {
        let e = Extent::from([3, 5]);
        assert!(e.contains([0, 0].into()));
        assert!(e.contains([2, 4].into()));
        assert!(!e.contains([3, 0].into()));
        assert!(!e.contains([0, 5].into()));
        assert!(!e.contains([-1, 0].into()));
    }

    #[test]
    fn test_index_of_row_major() {
        let e = Extent::from([3, 5]);
        assert_eq!(e.index_of([0, 0].into()), 0);
        assert_eq!(e.index_of([0, 4].into()), 4);
        assert_eq!(e.index_of([1, 0].into()), 5);
        assert_eq!(e.index_of([2, 4].into()), 14);
    }

    #[test]
    fn test_extent_iter_order() {
        let e = Extent::from([2, 3]);
        let indices: Vec<_> = e.iter().collect();
        assert_eq!(indices.len(), 6);
        assert_eq!(indices[0], [0, 0].into());
        assert_eq!(indices[1], [0, 1].into());
        assert_eq!(indices[3], [1, 0].into());
        assert_eq!(indices[5], [1, 2].into());

        assert_eq!(Extent::from([0, 3]).iter().count(), 0);
    }

    #[test]
    fn test_tiling_ceil_division() {
        let tiled = Extent::from([37, 53]).tile::<16, 16>();
        assert_eq!(tiled.tile_counts(), [3, 4].into());
        assert_eq!(tiled.tile_size(), 256);
        assert_eq!(tiled.tiles().count(), 12);
        assert_eq!(tiled.tile_origin([2, 3].into()), [32, 48].into());

        let exact = Extent::from([32]).tile::<16>();
        assert_eq!(exact.tile_counts(), [2].into());
    }
}
