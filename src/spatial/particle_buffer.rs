use std::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    accelerator::{Accelerator, Allocation, Residency},
    error::{AcceleratorError, AllocationError},
    V3,
};

const NUM_FIELDS: usize = 2;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Per-particle columns of a [`ParticleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleField {
    Position,

    /// Opaque per-particle vector owned by the caller. On the device this column doubles as
    /// sort scratch space, so its device contents do not survive an arrangement.
    Auxiliary,
}

impl ParticleField {
    fn column(self) -> usize {
        match self {
            ParticleField::Position => 0,
            ParticleField::Auxiliary => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    HostToHost,
}

impl TransferDirection {
    pub fn between(src: Residency, dst: Residency) -> TransferDirection {
        match (src, dst) {
            (Residency::HostPinned, Residency::Device) => TransferDirection::HostToDevice,
            (Residency::Device, Residency::HostPinned) => TransferDirection::DeviceToHost,
            (Residency::Device, Residency::Device) => TransferDirection::DeviceToDevice,
            (Residency::HostPinned, Residency::HostPinned) => TransferDirection::HostToHost,
        }
    }

    fn operation_name(self) -> &'static str {
        match self {
            TransferDirection::HostToDevice => "transfer_host_to_device",
            TransferDirection::DeviceToHost => "transfer_device_to_host",
            TransferDirection::DeviceToDevice => "transfer_device_to_device",
            TransferDirection::HostToHost => "transfer_host_to_host",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => f.write_str("host-to-device"),
            TransferDirection::DeviceToHost => f.write_str("device-to-host"),
            TransferDirection::DeviceToDevice => f.write_str("device-to-device"),
            TransferDirection::HostToHost => f.write_str("host-to-host"),
        }
    }
}

/// Columnar particle storage in one residency. All fields live in a single arena,
/// `capacity` entries per field, laid out back to back.
pub struct ParticleBuffer {
    id: u64,
    capacity: usize,
    arena: Allocation<V3>,
}

/// A second, same-capacity view into the arena of a device [`ParticleBuffer`].
///
/// The view's position column is the parent's auxiliary column, so the view costs no memory.
/// Contract: while the view is written, the parent's auxiliary field must not be read, and the
/// view's positions must not be read while the parent's auxiliary field is written. The position
/// columns of parent and view never overlap, which [`ParticleBuffer::split_scratch`] checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchView {
    parent: u64,
    capacity: usize,
    position: Range<usize>,
}

impl ScratchView {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Field of the parent buffer that this view's position column aliases.
    pub fn aliased_field(&self) -> ParticleField {
        ParticleField::Auxiliary
    }
}

impl ParticleBuffer {
    pub fn allocate(accel: &Accelerator, capacity: usize, residency: Residency) -> Result<ParticleBuffer, AllocationError> {
        let len = capacity
            .checked_mul(NUM_FIELDS)
            .ok_or(AllocationError::CapacityOverflow {
                len: capacity,
                element_size: NUM_FIELDS * std::mem::size_of::<V3>(),
            })?;
        let arena = accel.allocate_with(len, residency, V3::zeros)?;

        Ok(ParticleBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            arena,
        })
    }

    /// Creates the scratch view described at [`ScratchView`]. Only device buffers can host one.
    pub fn allocate_sub_buffer(&self) -> Result<ScratchView, AllocationError> {
        if self.residency() != Residency::Device {
            return Err(AllocationError::SubBufferResidency(self.residency()));
        }
        Ok(ScratchView {
            parent: self.id,
            capacity: self.capacity,
            position: self.field_range(ParticleField::Auxiliary),
        })
    }

    pub fn residency(&self) -> Residency {
        self.arena.residency()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn field_range(&self, field: ParticleField) -> Range<usize> {
        let begin = field.column() * self.capacity;
        begin..begin + self.capacity
    }

    pub fn field(&self, field: ParticleField) -> &[V3] {
        &self.arena[self.field_range(field)]
    }

    pub fn field_mut(&mut self, field: ParticleField) -> &mut [V3] {
        let range = self.field_range(field);
        &mut self.arena[range]
    }

    pub fn positions(&self) -> &[V3] {
        self.field(ParticleField::Position)
    }

    pub fn positions_mut(&mut self) -> &mut [V3] {
        self.field_mut(ParticleField::Position)
    }

    /// Position column of this buffer and position column of `scratch`, borrowed together.
    pub fn split_scratch(&mut self, scratch: &ScratchView) -> (&mut [V3], &mut [V3]) {
        assert_eq!(scratch.parent, self.id, "scratch view belongs to another buffer");

        let main = self.field_range(ParticleField::Position);
        let aux = scratch.position.clone();
        assert!(
            main.end <= aux.start || aux.end <= main.start,
            "scratch view {:?} overlaps positions {:?}",
            aux,
            main
        );

        if main.end <= aux.start {
            let (head, tail) = self.arena.split_at_mut(aux.start);
            (&mut head[main], &mut tail[..aux.len()])
        } else {
            let (head, tail) = self.arena.split_at_mut(main.start);
            (&mut tail[..main.len()], &mut head[aux])
        }
    }

    /// Copies `field[range]` into `dst`, blocking until the copy is complete.
    pub fn transfer(
        &self,
        accel: &Accelerator,
        dst: &mut ParticleBuffer,
        field: ParticleField,
        range: Range<usize>,
        direction: TransferDirection,
    ) -> Result<(), AcceleratorError> {
        if TransferDirection::between(self.residency(), dst.residency()) != direction {
            return Err(AcceleratorError::ResidencyMismatch {
                direction,
                src: self.residency(),
                dst: dst.residency(),
            });
        }

        accel.copy(direction.operation_name(), self.field(field), dst.field_mut(field), range)
    }
}

impl fmt::Debug for ParticleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleBuffer")
            .field("id", &self.id)
            .field("residency", &self.residency())
            .field("capacity", &self.capacity)
            .finish()
    }
}
