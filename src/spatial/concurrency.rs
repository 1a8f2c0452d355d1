use std::ops::Range;

use rayon::prelude::*;

pub fn par_iter_mut0<F: Fn(usize) + Send + Sync>(n: usize, f: F) {
    (0..n).into_par_iter().for_each(|idx| {
        f(idx);
    });
}

pub fn par_map0<R: Send, F: Fn(usize) -> R + Send + Sync>(n: usize, f: F) -> Vec<R> {
    (0..n).into_par_iter().map(|idx| f(idx)).collect()
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

/// Calls `f` for every chunk of `chunk_size` consecutive elements (the last one may be shorter).
pub fn par_chunks_mut1<T1: Send + Sync, F: Fn(usize, &mut [T1]) + Send + Sync>(
    arr1: &mut [T1],
    chunk_size: usize,
    f: F,
) {
    arr1.par_chunks_mut(chunk_size).enumerate().for_each(|(idx, chunk)| {
        f(idx, chunk);
    });
}

/// Parallel `dst.copy_from_slice(src)`.
pub fn par_copy<T: Copy + Send + Sync>(dst: &mut [T], src: &[T], chunk_size: usize) {
    assert_eq!(dst.len(), src.len());
    dst.par_chunks_mut(chunk_size)
        .zip(src.par_chunks(chunk_size))
        .for_each(|(d, s)| d.copy_from_slice(s));
}

/// Splits `data` into the mutable sub-slices given by `ranges`.
///
/// The ranges have to be sorted, non-overlapping and inside `data`. Gaps between them are allowed.
pub fn split_ranges_mut<'a, T>(mut data: &'a mut [T], ranges: impl IntoIterator<Item = Range<usize>>) -> Vec<&'a mut [T]> {
    let mut parts = Vec::new();
    let mut consumed = 0;
    for range in ranges {
        assert!(
            consumed <= range.start && range.start <= range.end,
            "ranges must be sorted and disjoint: {:?} starts before {}",
            range,
            consumed
        );
        let rest = std::mem::take(&mut data);
        let (_, rest) = rest.split_at_mut(range.start - consumed);
        let (part, rest) = rest.split_at_mut(range.end - range.start);
        parts.push(part);
        data = rest;
        consumed = range.end;
    }
    parts
}
