/*!
Work-group execution model used by the neighborhood search.

The accelerator owns a dedicated thread pool (its compute units) and two memory budgets, one for
device-resident and one for host-pinned buffers. Kernels are launched as a grid of work-groups; a launch
returns only after every work-group has finished, so consecutive launches form an in-order queue and
the output of one stage is complete before the next stage reads it.
*/

use std::{
    any::Any,
    fmt,
    mem,
    ops::{Deref, DerefMut, Range},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::{info, trace};

use crate::{
    concurrency::{par_chunks_mut1, par_copy, par_iter_mut0, par_iter_mut1, par_map0},
    error::{AcceleratorError, AllocationError},
    search_parameters::AcceleratorParams,
};

const COPY_CHUNK: usize = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Device,
    HostPinned,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Device => f.write_str("device"),
            Residency::HostPinned => f.write_str("host-pinned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub compute_units: usize,
    pub max_threads_per_group: usize,
    pub shared_memory_per_group: usize,
    pub total_device_memory: usize,
    pub total_pinned_memory: usize,
}

struct MemoryPool {
    residency: Residency,
    limit: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    fn new(residency: Residency, limit: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool {
            residency,
            limit,
            used: AtomicUsize::new(0),
        })
    }

    fn reserve(self: &Arc<Self>, bytes: usize) -> Result<Reservation, AllocationError> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let available = self.limit.saturating_sub(used);
            if bytes > available {
                return Err(AllocationError::OutOfMemory {
                    residency: self.residency,
                    requested: bytes,
                    available,
                    limit: self.limit,
                });
            }
            match self
                .used
                .compare_exchange_weak(used, used + bytes, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return Ok(Reservation {
                        pool: self.clone(),
                        bytes,
                    })
                }
                Err(current) => used = current,
            }
        }
    }
}

struct Reservation {
    pool: Arc<MemoryPool>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Fixed-length array accounted against one of the accelerator's memory budgets.
/// The reservation is returned when the allocation is dropped.
pub struct Allocation<T> {
    data: Vec<T>,
    residency: Residency,
    _reservation: Reservation,
}

impl<T> Allocation<T> {
    pub fn residency(&self) -> Residency {
        self.residency
    }
}

impl<T> Deref for Allocation<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> DerefMut for Allocation<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> fmt::Debug for Allocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("residency", &self.residency)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One work-group of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroup {
    pub id: usize,
    pub size: usize,
}

impl WorkGroup {
    /// Items of a one-dimensional launch over `n` items that belong to this group.
    pub fn items(&self, n: usize) -> Range<usize> {
        let begin = (self.id * self.size).min(n);
        begin..(begin + self.size).min(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub groups: usize,
    pub threads_per_group: usize,
    pub shared_memory: usize,
}

impl LaunchConfig {
    pub fn new(groups: usize, threads_per_group: usize) -> LaunchConfig {
        assert!(threads_per_group > 0, "work-groups need at least one thread");
        LaunchConfig {
            groups,
            threads_per_group,
            shared_memory: 0,
        }
    }

    /// Enough groups to cover `n` items with one thread per item.
    pub fn linear(n: usize, threads_per_group: usize) -> LaunchConfig {
        assert!(threads_per_group > 0, "work-groups need at least one thread");
        LaunchConfig::new((n + threads_per_group - 1) / threads_per_group, threads_per_group)
    }

    pub fn with_shared_memory(mut self, bytes: usize) -> LaunchConfig {
        self.shared_memory = bytes;
        self
    }
}

pub struct Accelerator {
    properties: DeviceProperties,
    pool: rayon::ThreadPool,
    device_memory: Arc<MemoryPool>,
    pinned_memory: Arc<MemoryPool>,
    injected_faults: Mutex<Vec<&'static str>>,
    launches: AtomicU64,
}

impl Accelerator {
    pub fn new(params: &AcceleratorParams) -> Result<Accelerator, AcceleratorError> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("nsearch-cu-{}", i));
        if let Some(compute_units) = params.compute_units {
            builder = builder.num_threads(compute_units);
        }
        let pool = builder.build()?;

        let properties = DeviceProperties {
            name: String::from("rayon work-group emulator"),
            compute_units: pool.current_num_threads(),
            max_threads_per_group: params.max_threads_per_group,
            shared_memory_per_group: params.shared_memory_per_group,
            total_device_memory: params.device_memory_bytes,
            total_pinned_memory: params.pinned_memory_bytes,
        };

        info!("Name: {}", properties.name);
        info!("Compute units: {}", properties.compute_units);
        info!("Max threads per work-group: {}", properties.max_threads_per_group);
        info!("Shared memory per work-group: {}", properties.shared_memory_per_group);
        info!("Total device memory: {}", properties.total_device_memory);
        info!("Total pinned memory: {}", properties.total_pinned_memory);

        Ok(Accelerator {
            device_memory: MemoryPool::new(Residency::Device, properties.total_device_memory),
            pinned_memory: MemoryPool::new(Residency::HostPinned, properties.total_pinned_memory),
            properties,
            pool,
            injected_faults: Mutex::new(Vec::new()),
            launches: AtomicU64::new(0),
        })
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Bytes currently reserved in the given memory.
    pub fn memory_in_use(&self, residency: Residency) -> usize {
        self.memory_pool(residency).used.load(Ordering::Acquire)
    }

    /// Number of kernel launches and copies issued so far.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    fn memory_pool(&self, residency: Residency) -> &Arc<MemoryPool> {
        match residency {
            Residency::Device => &self.device_memory,
            Residency::HostPinned => &self.pinned_memory,
        }
    }

    pub fn allocate<T: Default>(&self, len: usize, residency: Residency) -> Result<Allocation<T>, AllocationError> {
        self.allocate_with(len, residency, T::default)
    }

    /// Like [`allocate`](Self::allocate), but initializes the elements with `init`.
    pub fn allocate_with<T>(
        &self,
        len: usize,
        residency: Residency,
        init: impl FnMut() -> T,
    ) -> Result<Allocation<T>, AllocationError> {
        let element_size = mem::size_of::<T>();
        let bytes = len
            .checked_mul(element_size)
            .ok_or(AllocationError::CapacityOverflow { len, element_size })?;

        let reservation = self.memory_pool(residency).reserve(bytes)?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| AllocationError::HostAllocator {
                residency,
                requested: bytes,
            })?;
        data.resize_with(len, init);

        Ok(Allocation {
            data,
            residency,
            _reservation: reservation,
        })
    }

    /// Makes the next launch or copy named `operation` fail with [`AcceleratorError::InjectedFault`].
    /// Meant for exercising the error paths of callers.
    pub fn inject_failure(&self, operation: &'static str) {
        self.injected_faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(operation);
    }

    fn take_injected_fault(&self, operation: &'static str) -> Result<(), AcceleratorError> {
        let mut faults = self.injected_faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pos) = faults.iter().position(|f| *f == operation) {
            faults.swap_remove(pos);
            return Err(AcceleratorError::InjectedFault(operation));
        }
        Ok(())
    }

    fn validate(&self, kernel: &'static str, config: &LaunchConfig) -> Result<(), AcceleratorError> {
        self.take_injected_fault(kernel)?;

        if config.threads_per_group > self.properties.max_threads_per_group {
            return Err(AcceleratorError::WorkGroupTooLarge {
                kernel,
                requested: config.threads_per_group,
                limit: self.properties.max_threads_per_group,
            });
        }
        if config.shared_memory > self.properties.shared_memory_per_group {
            return Err(AcceleratorError::SharedMemoryExceeded {
                kernel,
                requested: config.shared_memory,
                limit: self.properties.shared_memory_per_group,
            });
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        trace!(
            "launch `{}`: {} groups x {} threads, {} bytes shared",
            kernel,
            config.groups,
            config.threads_per_group,
            config.shared_memory
        );
        Ok(())
    }

    fn run<R: Send>(&self, kernel: &'static str, f: impl FnOnce() -> R + Send) -> Result<R, AcceleratorError> {
        self.pool
            .install(|| catch_unwind(AssertUnwindSafe(f)))
            .map_err(|payload| AcceleratorError::KernelAborted {
                kernel,
                message: panic_message(payload),
            })
    }

    /// Runs `f` once per work-group. Output has to go through atomics or disjoint raw writes.
    pub fn launch<F: Fn(WorkGroup) + Send + Sync>(
        &self,
        kernel: &'static str,
        config: LaunchConfig,
        f: F,
    ) -> Result<(), AcceleratorError> {
        self.validate(kernel, &config)?;
        let size = config.threads_per_group;
        self.run(kernel, || par_iter_mut0(config.groups, |id| f(WorkGroup { id, size })))
    }

    /// Runs `f` once per work-group and collects the per-group results in group order.
    pub fn launch_map<R: Send, F: Fn(WorkGroup) -> R + Send + Sync>(
        &self,
        kernel: &'static str,
        config: LaunchConfig,
        f: F,
    ) -> Result<Vec<R>, AcceleratorError> {
        self.validate(kernel, &config)?;
        let size = config.threads_per_group;
        self.run(kernel, || par_map0(config.groups, |id| f(WorkGroup { id, size })))
    }

    /// One thread per element of `data`; every work-group owns its chunk of `threads_per_group` elements.
    pub fn launch_chunked<T: Send + Sync, F: Fn(WorkGroup, &mut [T]) + Send + Sync>(
        &self,
        kernel: &'static str,
        threads_per_group: usize,
        data: &mut [T],
        f: F,
    ) -> Result<(), AcceleratorError> {
        let config = LaunchConfig::linear(data.len(), threads_per_group);
        self.validate(kernel, &config)?;
        self.run(kernel, || {
            par_chunks_mut1(data, threads_per_group, |id, chunk| {
                f(
                    WorkGroup {
                        id,
                        size: threads_per_group,
                    },
                    chunk,
                )
            })
        })
    }

    /// Work-group `g` owns `parts[g]`; the parts usually come from
    /// [`split_ranges_mut`](crate::concurrency::split_ranges_mut).
    pub fn launch_partitioned<T: Send + Sync, F: Fn(WorkGroup, &mut [T]) + Send + Sync>(
        &self,
        kernel: &'static str,
        config: LaunchConfig,
        mut parts: Vec<&mut [T]>,
        f: F,
    ) -> Result<(), AcceleratorError> {
        assert_eq!(parts.len(), config.groups, "one partition per work-group");
        self.validate(kernel, &config)?;
        let size = config.threads_per_group;
        self.run(kernel, || par_iter_mut1(&mut parts, |id, part| f(WorkGroup { id, size }, &mut **part)))
    }

    /// Synchronous copy of `src[range]` into `dst[range]`.
    pub fn copy<T: Copy + Send + Sync>(
        &self,
        operation: &'static str,
        src: &[T],
        dst: &mut [T],
        range: Range<usize>,
    ) -> Result<(), AcceleratorError> {
        self.take_injected_fault(operation)?;
        if range.start > range.end || range.end > src.len() || range.end > dst.len() {
            return Err(AcceleratorError::CopyOutOfRange {
                operation,
                begin: range.start,
                end: range.end,
                src_len: src.len(),
                dst_len: dst.len(),
            });
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        trace!("copy `{}`: [{}, {})", operation, range.start, range.end);

        let src = &src[range.clone()];
        let dst = &mut dst[range];
        self.run(operation, || par_copy(dst, src, COPY_CHUNK))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

#[cfg(test)]
pub(crate) fn test_accelerator() -> Accelerator {
    Accelerator::new(&AcceleratorParams {
        compute_units: Some(4),
        ..AcceleratorParams::default()
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn launch_runs_every_group() {
        let accel = test_accelerator();
        let hits: Vec<AtomicU32> = (0..100).map(|_| AtomicU32::new(0)).collect();
        accel
            .launch("touch", LaunchConfig::linear(hits.len(), 32), |group| {
                for i in group.items(hits.len()) {
                    hits[i].fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        assert_eq!(accel.launch_count(), 1);
    }

    #[test]
    fn launch_map_keeps_group_order() {
        let accel = test_accelerator();
        let ids = accel
            .launch_map("ids", LaunchConfig::new(50, 8), |group| group.id * 2)
            .unwrap();
        assert_eq!(ids, (0..50).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn limits_are_enforced() {
        let accel = test_accelerator();
        let limit = accel.properties().max_threads_per_group;
        let err = accel
            .launch("too_wide", LaunchConfig::new(1, limit + 1), |_| {})
            .unwrap_err();
        assert!(matches!(err, AcceleratorError::WorkGroupTooLarge { kernel: "too_wide", .. }));

        let shared = accel.properties().shared_memory_per_group;
        let err = accel
            .launch("too_much_shared", LaunchConfig::new(1, 1).with_shared_memory(shared + 1), |_| {})
            .unwrap_err();
        assert!(matches!(err, AcceleratorError::SharedMemoryExceeded { .. }));
    }

    #[test]
    fn kernel_panic_becomes_error() {
        let accel = test_accelerator();
        let err = accel
            .launch("boom", LaunchConfig::new(4, 1), |group| {
                if group.id == 3 {
                    panic!("group {} failed", group.id);
                }
            })
            .unwrap_err();
        match err {
            AcceleratorError::KernelAborted { kernel, message } => {
                assert_eq!(kernel, "boom");
                assert_eq!(message, "group 3 failed");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn injected_fault_fires_once() {
        let accel = test_accelerator();
        accel.inject_failure("flaky");
        assert!(matches!(
            accel.launch("flaky", LaunchConfig::new(1, 1), |_| {}),
            Err(AcceleratorError::InjectedFault("flaky"))
        ));
        assert!(accel.launch("flaky", LaunchConfig::new(1, 1), |_| {}).is_ok());
    }

    #[test]
    fn allocations_are_accounted() {
        let accel = Accelerator::new(&AcceleratorParams {
            compute_units: Some(2),
            device_memory_bytes: 1024,
            ..AcceleratorParams::default()
        })
        .unwrap();

        let a = accel.allocate::<u32>(200, Residency::Device).unwrap();
        assert_eq!(a.len(), 200);
        assert_eq!(accel.memory_in_use(Residency::Device), 800);

        let err = accel.allocate::<u32>(100, Residency::Device).unwrap_err();
        assert!(matches!(
            err,
            AllocationError::OutOfMemory {
                requested: 400,
                available: 224,
                ..
            }
        ));

        drop(a);
        assert_eq!(accel.memory_in_use(Residency::Device), 0);
        assert!(accel.allocate::<u32>(256, Residency::Device).is_ok());
    }

    #[test]
    fn copy_checks_ranges() {
        let accel = test_accelerator();
        let src = vec![1u32, 2, 3, 4];
        let mut dst = vec![0u32; 4];
        accel.copy("copy", &src, &mut dst, 1..3).unwrap();
        assert_eq!(dst, vec![0, 2, 3, 0]);

        let err = accel.copy("copy", &src, &mut dst, 2..5).unwrap_err();
        assert!(matches!(err, AcceleratorError::CopyOutOfRange { end: 5, .. }));
    }
}
