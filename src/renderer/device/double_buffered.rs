use std::ops::{Index, IndexMut};

use smallvec::SmallVec;

use super::MAX_FRAMES_IN_FLIGHT;

/// One `T` per frame slot, addressed by slot index or by a monotonically growing frame number.
#[derive(Clone, Debug)]
pub(crate) struct DoubleBuffered<T> {
    data: SmallVec<[T; MAX_FRAMES_IN_FLIGHT]>,
}

impl<T> DoubleBuffered<T> {
    pub(crate) fn new<F: FnMut(usize) -> T>(count: usize, creator: F) -> DoubleBuffered<T> {
        debug_assert!(count > 0, "at least one frame slot is required");
        DoubleBuffered {
            data: (0..count).map(creator).collect(),
        }
    }

    pub(crate) fn try_new<F, E>(count: usize, creator: F) -> Result<DoubleBuffered<T>, E>
    where
        F: FnMut(usize) -> Result<T, E>,
    {
        debug_assert!(count > 0, "at least one frame slot is required");
        Ok(DoubleBuffered {
            data: (0..count).map(creator).collect::<Result<_, _>>()?,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Slot owned by `frame_number`.
    pub(crate) fn current(&self, frame_number: u64) -> &T {
        &self.data[(frame_number % self.data.len() as u64) as usize]
    }

    pub(crate) fn current_mut(&mut self, frame_number: u64) -> &mut T {
        let len = self.data.len() as u64;
        &mut self.data[(frame_number % len) as usize]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.data.iter()
    }

    pub(crate) fn into_iter(self) -> impl Iterator<Item = T> {
        self.data.into_iter()
    }
}

impl<T> Index<usize> for DoubleBuffered<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<T> IndexMut<usize> for DoubleBuffered<T> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index]
    }
}
