/// Raw pointer that can be shared between the work-groups of a kernel.
///
/// Used for scattered writes where every index is written by exactly one invocation
/// (e.g. through a permutation), which the borrow checker cannot see.
#[derive(Copy, Clone)]
pub struct ThreadSafeMutPtr<T> {
    ptr: *mut T,
    len: usize,
}
unsafe impl<T> Sync for ThreadSafeMutPtr<T> {}
unsafe impl<T> Send for ThreadSafeMutPtr<T> {}
impl<T> ThreadSafeMutPtr<T> {
    pub fn new(slice: &mut [T]) -> ThreadSafeMutPtr<T> {
        ThreadSafeMutPtr {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// The slice this pointer was created from must still be alive and not otherwise borrowed,
    /// and no other invocation may read or write `idx` concurrently.
    pub unsafe fn write(&self, idx: usize, value: T) {
        assert!(idx < self.len, "index {} out of bounds ({})", idx, self.len);
        self.ptr.add(idx).write(value);
    }
}
