//! Buffers and their update policies.
//!
//! A [`Buffer`] wraps one backing allocation and decides, from its
//! [`BufferPolicy`], how CPU data reaches it: through a retained staging
//! buffer and a GPU copy, through a persistent mapping, or through an
//! on-demand mapping. The device side is abstracted by [`BufferDevice`] so the
//! policy logic runs the same against Vulkan and against the test mock.

use crate::error::{GpuError, Result};
use crate::kind::BufferKind;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Smallest physical allocation; zero-byte requests round up to this.
pub const MIN_BUFFER_SIZE: u64 = 16;

/// Map slots available to non-persistent buffers at once.
pub const DEFAULT_MAP_SLOTS: usize = 1;

/// A device buffer as the policy engine sees it.
pub trait DeviceBuffer {
    /// Physical size in bytes.
    fn size(&self) -> u64;

    /// Host view of the contents, if the memory is host visible.
    fn host_bytes(&self) -> Option<&[u8]>;

    /// Mutable host view of the contents, if the memory is host visible.
    fn host_bytes_mut(&mut self) -> Option<&mut [u8]>;
}

/// Identifies a submitted copy. Tickets increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferTicket(pub u64);

/// Budget of concurrently locked non-persistent buffers.
#[derive(Debug)]
pub struct MapSlots {
    limit: usize,
    active: usize,
}

impl MapSlots {
    /// Create a budget of `limit` slots.
    pub const fn new(limit: usize) -> Self {
        Self { limit, active: 0 }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.active < self.limit {
            self.active += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot.
    pub fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    /// Slots currently taken.
    pub fn active(&self) -> usize {
        self.active
    }
}

impl Default for MapSlots {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_SLOTS)
    }
}

/// Device operations a [`Buffer`] needs.
pub trait BufferDevice {
    type Buffer: DeviceBuffer;

    /// Allocate a buffer. Host-visible locations come back mapped.
    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self::Buffer>;

    /// Record a GPU copy between two buffers.
    fn copy_buffer(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        region: vk::BufferCopy,
    ) -> Result<TransferTicket>;

    /// Whether the copy behind `ticket` has retired on the GPU.
    fn is_complete(&self, ticket: TransferTicket) -> bool;

    /// Submit if needed and block until `ticket` retires.
    fn wait(&mut self, ticket: TransferTicket) -> Result<()>;

    /// Hand a buffer to deferred destruction.
    fn retire(&mut self, buffer: Self::Buffer);

    /// Shared map-slot budget.
    fn map_slots(&mut self) -> &mut MapSlots;
}

/// How a buffer is updated, chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPolicy {
    /// Device-local; writes go through a retained staging buffer.
    Static,
    /// Host visible and mapped for its whole lifetime.
    Persistent,
    /// Host visible; mapped on demand.
    Mappable,
    /// Persistent, and can grow with [`Buffer::resize`].
    Resizable,
}

impl BufferPolicy {
    /// Memory location of the backing allocation.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::Static => MemoryLocation::GpuOnly,
            Self::Persistent | Self::Mappable | Self::Resizable => MemoryLocation::CpuToGpu,
        }
    }

    /// Whether the buffer stays mapped for its lifetime.
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Persistent | Self::Resizable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockTarget {
    Backing,
    Staging,
    Scratch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Unmapped,
    Mapped,
    Locked { len: usize, target: LockTarget },
}

fn physical_size(size: u64) -> u64 {
    size.max(MIN_BUFFER_SIZE)
}

fn invalid(message: impl Into<String>) -> GpuError {
    GpuError::InvalidState(message.into())
}

fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(invalid(format!(
            "range {offset}..{offset}+{len} is outside a buffer of {size} bytes"
        ))),
    }
}

fn host_slice<B: DeviceBuffer>(buffer: Option<&mut B>, len: usize) -> Result<&mut [u8]> {
    let bytes = buffer
        .ok_or_else(|| invalid("buffer has no backing allocation"))?
        .host_bytes_mut()
        .ok_or_else(|| invalid("buffer memory is not host visible"))?;
    bytes
        .get_mut(..len)
        .ok_or_else(|| invalid("host mapping is smaller than the buffer"))
}

/// A GPU buffer with an update policy.
///
/// Buffers hold GPU memory and must be handed back with [`Buffer::release`].
pub struct Buffer<B> {
    kind: BufferKind,
    policy: BufferPolicy,
    name: String,
    size: u64,
    backing: Option<B>,
    staging: Option<B>,
    /// Last copy reading from `staging`.
    staging_ticket: Option<TransferTicket>,
    /// Last copy writing into `backing`.
    write_ticket: Option<TransferTicket>,
    /// Last copy reading from `backing`.
    read_ticket: Option<TransferTicket>,
    state: MapState,
    scratch: Vec<u8>,
    epoch: u64,
}

impl<B: DeviceBuffer> Buffer<B> {
    /// Create an unallocated buffer.
    pub fn new(kind: BufferKind, policy: BufferPolicy, name: impl Into<String>) -> Self {
        Self {
            kind,
            policy,
            name: name.into(),
            size: 0,
            backing: None,
            staging: None,
            staging_ticket: None,
            write_ticket: None,
            read_ticket: None,
            state: MapState::Unmapped,
            scratch: Vec::new(),
            epoch: 0,
        }
    }

    pub fn kind(&self) -> &BufferKind {
        &self.kind
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical size in bytes, as last requested.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size of the backing allocation.
    pub fn physical_size(&self) -> u64 {
        self.backing.as_ref().map_or(0, DeviceBuffer::size)
    }

    /// Backing buffer, if allocated.
    pub fn raw(&self) -> Option<&B> {
        self.backing.as_ref()
    }

    /// Retained staging buffer, if any.
    pub fn staging(&self) -> Option<&B> {
        self.staging.as_ref()
    }

    /// Bumped whenever the backing buffer is replaced.
    ///
    /// Cached descriptor bindings compare against this to know when to
    /// rebind.
    pub fn binding_epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether host memory of this buffer is currently mapped.
    pub fn is_mapped(&self) -> bool {
        if self.backing.is_none() {
            return false;
        }
        if self.policy.is_persistent() {
            return true;
        }
        matches!(
            self.state,
            MapState::Mapped
                | MapState::Locked {
                    target: LockTarget::Backing,
                    ..
                }
        )
    }

    /// Whether the buffer is between `lock` and `unlock`.
    pub fn is_locked(&self) -> bool {
        matches!(self.state, MapState::Locked { .. })
    }

    /// (Re)allocate `size` bytes and optionally upload `data` to the front.
    ///
    /// The previous backing allocation, if any, goes to deferred
    /// destruction.
    pub fn set_data<D>(&mut self, device: &mut D, size: u64, data: Option<&[u8]>) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if self.is_locked() || self.state == MapState::Mapped {
            return Err(invalid(format!("set_data on mapped buffer '{}'", self.name)));
        }
        if let Some(data) = data {
            check_range(0, data.len() as u64, size)?;
        }

        let physical = physical_size(size);
        let backing =
            device.create_buffer(physical, self.kind.usage(), self.policy.location(), &self.name)?;
        if let Some(old) = self.backing.replace(backing) {
            device.retire(old);
        }
        self.size = size;
        self.epoch += 1;
        self.write_ticket = None;
        self.read_ticket = None;

        tracing::trace!(
            buffer = %self.name,
            policy = ?self.policy,
            size,
            physical,
            "Buffer allocated"
        );

        match data {
            Some(data) => self.write(device, 0, data),
            None => Ok(()),
        }
    }

    /// Typed convenience over [`Buffer::set_data`].
    pub fn set_slice<D, T>(&mut self, device: &mut D, items: &[T]) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
        T: bytemuck::Pod,
    {
        let bytes: &[u8] = bytemuck::cast_slice(items);
        self.set_data(device, bytes.len() as u64, Some(bytes))
    }

    /// Overwrite `data.len()` bytes at `offset`.
    ///
    /// Static buffers copy only the touched range from the staging buffer.
    pub fn set_sub_data<D>(&mut self, device: &mut D, offset: u64, data: &[u8]) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if self.backing.is_none() {
            return Err(invalid(format!("set_sub_data on unallocated buffer '{}'", self.name)));
        }
        if self.is_locked() {
            return Err(invalid(format!("set_sub_data on locked buffer '{}'", self.name)));
        }
        check_range(offset, data.len() as u64, self.size)?;
        self.write(device, offset, data)
    }

    fn write<D>(&mut self, device: &mut D, offset: u64, data: &[u8]) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if data.is_empty() {
            return Ok(());
        }
        match self.policy {
            BufferPolicy::Static => self.upload(device, offset, data),
            _ => {
                let start = offset as usize;
                let bytes = host_slice(self.backing.as_mut(), start + data.len())?;
                bytes[start..].copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Write through the staging buffer and copy the range on the GPU.
    fn upload<D>(&mut self, device: &mut D, offset: u64, data: &[u8]) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if data.is_empty() {
            return Ok(());
        }
        self.prepare_staging(device)?;
        let start = offset as usize;
        let bytes = host_slice(self.staging.as_mut(), start + data.len())?;
        bytes[start..].copy_from_slice(data);
        self.flush_staging(device, offset, data.len() as u64)
    }

    /// Make sure a free staging buffer matching the backing size exists.
    ///
    /// A staging buffer still read by an unretired copy is retired and
    /// replaced, never overwritten.
    fn prepare_staging<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        let physical = self.physical_size();
        let busy = self
            .staging_ticket
            .is_some_and(|ticket| !device.is_complete(ticket));
        let fits = self
            .staging
            .as_ref()
            .is_some_and(|staging| staging.size() == physical);
        if !busy && fits {
            return Ok(());
        }

        if let Some(old) = self.staging.take() {
            if busy {
                tracing::trace!(buffer = %self.name, "Staging buffer in flight; replacing");
            }
            device.retire(old);
        }
        self.staging_ticket = None;

        let name = format!("{} (staging)", self.name);
        self.staging = Some(device.create_buffer(
            physical,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &name,
        )?);
        Ok(())
    }

    fn flush_staging<D>(&mut self, device: &mut D, offset: u64, len: u64) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if len == 0 {
            return Ok(());
        }
        let (Some(staging), Some(backing)) = (self.staging.as_ref(), self.backing.as_mut()) else {
            return Err(invalid("staging flush without staging and backing buffers"));
        };
        let ticket = device.copy_buffer(
            staging,
            backing,
            vk::BufferCopy {
                src_offset: offset,
                dst_offset: offset,
                size: len,
            },
        )?;
        self.staging_ticket = Some(ticket);
        self.write_ticket = Some(ticket);
        Ok(())
    }

    /// Map the buffer for host access.
    ///
    /// Persistent and resizable buffers return their lifetime mapping. Static
    /// buffers cannot be mapped. Mapping a mapped buffer is an error.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        if self.backing.is_none() {
            return Err(invalid(format!("map of unallocated buffer '{}'", self.name)));
        }
        match self.policy {
            BufferPolicy::Static => {
                return Err(invalid(format!("static buffer '{}' cannot be mapped", self.name)));
            }
            BufferPolicy::Mappable => {
                if self.state != MapState::Unmapped {
                    return Err(invalid(format!("buffer '{}' is already mapped", self.name)));
                }
                self.state = MapState::Mapped;
            }
            BufferPolicy::Persistent | BufferPolicy::Resizable => {}
        }
        host_slice(self.backing.as_mut(), self.size as usize)
    }

    /// End a [`Buffer::map`]. A no-op for persistent policies.
    pub fn unmap(&mut self) -> Result<()> {
        match self.policy {
            BufferPolicy::Persistent | BufferPolicy::Resizable => Ok(()),
            BufferPolicy::Mappable if self.state == MapState::Mapped => {
                self.state = MapState::Unmapped;
                Ok(())
            }
            _ => Err(invalid(format!("unmap of unmapped buffer '{}'", self.name))),
        }
    }

    /// Get `size` writable bytes at the front of the buffer.
    ///
    /// The returned contents are unspecified; lock is for filling. The buffer
    /// is (re)allocated when it is smaller than `size` (resizable buffers
    /// grow instead). When no map slot is free the write lands in an internal
    /// CPU scratch buffer that [`Buffer::unlock`] flushes with a staging copy.
    pub fn lock<D>(&mut self, device: &mut D, size: u64) -> Result<&mut [u8]>
    where
        D: BufferDevice<Buffer = B>,
    {
        if self.state != MapState::Unmapped {
            return Err(invalid(format!("lock of mapped buffer '{}'", self.name)));
        }

        if self.backing.is_none() {
            self.set_data(device, size, None)?;
        } else if size > self.size {
            match self.policy {
                BufferPolicy::Resizable => self.resize(device, size)?,
                BufferPolicy::Persistent => {
                    return Err(invalid(format!(
                        "lock of {size} bytes exceeds persistent buffer '{}' of {} bytes",
                        self.name, self.size
                    )));
                }
                BufferPolicy::Static | BufferPolicy::Mappable => {
                    self.set_data(device, size, None)?;
                }
            }
        }

        let len = size as usize;
        let target = match self.policy {
            BufferPolicy::Persistent | BufferPolicy::Resizable => LockTarget::Backing,
            // The staging buffer is private and needs no map slot.
            BufferPolicy::Static => {
                self.prepare_staging(device)?;
                LockTarget::Staging
            }
            BufferPolicy::Mappable if device.map_slots().try_acquire() => LockTarget::Backing,
            BufferPolicy::Mappable => {
                tracing::trace!(buffer = %self.name, "No map slot free; locking into scratch");
                LockTarget::Scratch
            }
        };
        let holds_slot = target == LockTarget::Backing && !self.policy.is_persistent();

        let bytes = match target {
            LockTarget::Backing => host_slice(self.backing.as_mut(), len),
            LockTarget::Staging => host_slice(self.staging.as_mut(), len),
            LockTarget::Scratch => {
                self.scratch.clear();
                self.scratch.resize(len, 0);
                Ok(self.scratch.as_mut_slice())
            }
        };
        match bytes {
            Ok(bytes) => {
                self.state = MapState::Locked { len, target };
                Ok(bytes)
            }
            Err(e) => {
                if holds_slot {
                    device.map_slots().release();
                }
                Err(e)
            }
        }
    }

    /// End a [`Buffer::lock`], flushing staged or scratch contents.
    pub fn unlock<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        let MapState::Locked { len, target } = self.state else {
            return Err(invalid(format!("unlock of unlocked buffer '{}'", self.name)));
        };
        self.state = MapState::Unmapped;

        match target {
            LockTarget::Backing => {
                if !self.policy.is_persistent() {
                    device.map_slots().release();
                }
                Ok(())
            }
            LockTarget::Staging => self.flush_staging(device, 0, len as u64),
            LockTarget::Scratch => {
                let scratch = std::mem::take(&mut self.scratch);
                let result = self.upload(device, 0, &scratch);
                self.scratch = scratch;
                result
            }
        }
    }

    /// Grow or shrink a resizable buffer, keeping its contents.
    ///
    /// Allocates the new buffer, copies the old contents into its front on
    /// the GPU, blocks until the copy retires, retires the old buffer and
    /// bumps the binding epoch.
    pub fn resize<D>(&mut self, device: &mut D, new_size: u64) -> Result<()>
    where
        D: BufferDevice<Buffer = B>,
    {
        if self.policy != BufferPolicy::Resizable {
            return Err(invalid(format!(
                "resize of {:?} buffer '{}'",
                self.policy, self.name
            )));
        }
        if self.is_locked() {
            return Err(invalid(format!("resize of locked buffer '{}'", self.name)));
        }
        if self
            .read_ticket
            .is_some_and(|ticket| !device.is_complete(ticket))
        {
            return Err(invalid(format!(
                "resize of buffer '{}' while a copy from it is pending",
                self.name
            )));
        }

        let Some(old) = self.backing.take() else {
            return self.set_data(device, new_size, None);
        };

        let physical = physical_size(new_size);
        let mut new = match device.create_buffer(
            physical,
            self.kind.usage(),
            self.policy.location(),
            &self.name,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.backing = Some(old);
                return Err(e);
            }
        };

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: old.size().min(physical),
        };
        let copied = device
            .copy_buffer(&old, &mut new, region)
            .and_then(|ticket| device.wait(ticket));
        if let Err(e) = copied {
            device.retire(new);
            self.backing = Some(old);
            return Err(e);
        }

        tracing::debug!(
            buffer = %self.name,
            from = self.size,
            to = new_size,
            "Buffer resized"
        );

        device.retire(old);
        self.backing = Some(new);
        self.size = new_size;
        self.epoch += 1;
        self.write_ticket = None;
        self.read_ticket = None;
        Ok(())
    }

    /// Copy the logical contents back to the CPU.
    ///
    /// Waits for pending writes. Device-local buffers go through a temporary
    /// read-back buffer.
    pub fn read_back<D>(&mut self, device: &mut D) -> Result<Vec<u8>>
    where
        D: BufferDevice<Buffer = B>,
    {
        if let Some(ticket) = self.write_ticket.take() {
            device.wait(ticket)?;
        }
        let len = self.size as usize;
        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| invalid(format!("read_back of unallocated buffer '{}'", self.name)))?;

        if let Some(bytes) = backing.host_bytes() {
            return bytes
                .get(..len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| invalid("host mapping is smaller than the buffer"));
        }

        let name = format!("{} (readback)", self.name);
        let mut readback = device.create_buffer(
            backing.size(),
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            &name,
        )?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: backing.size(),
        };
        let result = device
            .copy_buffer(backing, &mut readback, region)
            .and_then(|ticket| device.wait(ticket))
            .and_then(|()| {
                readback
                    .host_bytes()
                    .and_then(|bytes| bytes.get(..len))
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| invalid("read-back buffer is not host visible"))
            });
        device.retire(readback);
        result
    }

    /// Record a GPU copy of `size` bytes into another buffer.
    pub fn copy_to<D>(
        &mut self,
        device: &mut D,
        dst: &mut Self,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<TransferTicket>
    where
        D: BufferDevice<Buffer = B>,
    {
        check_range(src_offset, size, self.size)?;
        check_range(dst_offset, size, dst.size)?;
        if dst.is_locked() {
            return Err(invalid(format!("copy into locked buffer '{}'", dst.name)));
        }
        let (Some(src_buffer), Some(dst_buffer)) = (self.backing.as_ref(), dst.backing.as_mut())
        else {
            return Err(invalid("copy between unallocated buffers"));
        };
        let ticket = device.copy_buffer(
            src_buffer,
            dst_buffer,
            vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        )?;
        self.read_ticket = Some(ticket);
        dst.write_ticket = Some(ticket);
        Ok(ticket)
    }

    /// Hand every allocation to deferred destruction.
    pub fn release<D>(mut self, device: &mut D)
    where
        D: BufferDevice<Buffer = B>,
    {
        if let MapState::Locked { target, .. } = self.state {
            if target == LockTarget::Backing && !self.policy.is_persistent() {
                device.map_slots().release();
            }
        }
        if let Some(backing) = self.backing.take() {
            device.retire(backing);
        }
        if let Some(staging) = self.staging.take() {
            device.retire(staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{IndexFormat, VertexLayout};
    use crate::testing::{MockBuffer, MockDevice, MockEvent};

    const ALL_POLICIES: [BufferPolicy; 4] = [
        BufferPolicy::Static,
        BufferPolicy::Persistent,
        BufferPolicy::Mappable,
        BufferPolicy::Resizable,
    ];

    fn buffer(policy: BufferPolicy) -> Buffer<MockBuffer> {
        Buffer::new(BufferKind::Storage, policy, "test")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn set_data_reads_back_for_every_policy() {
        for policy in ALL_POLICIES {
            let mut device = MockDevice::new();
            let mut buf = buffer(policy);
            let data = pattern(100);
            buf.set_data(&mut device, 100, Some(&data)).unwrap();
            assert_eq!(buf.read_back(&mut device).unwrap(), data, "{policy:?}");
        }
    }

    #[test]
    fn zero_byte_set_data_allocates_minimum() {
        for policy in ALL_POLICIES {
            let mut device = MockDevice::new();
            let mut buf = buffer(policy);
            buf.set_data(&mut device, 0, None).unwrap();
            assert_eq!(buf.size(), 0);
            assert!(buf.physical_size() >= MIN_BUFFER_SIZE);
            assert!(buf.read_back(&mut device).unwrap().is_empty());
        }
    }

    #[test]
    fn static_upload_goes_through_retained_staging() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Static);
        buf.set_data(&mut device, 100, Some(&pattern(100))).unwrap();

        let created = device.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].2, MemoryLocation::GpuOnly);
        assert_eq!(created[1].2, MemoryLocation::CpuToGpu);
        let staging_id = buf.staging().unwrap().id;
        let backing_id = buf.raw().unwrap().id;
        assert_eq!(buf.staging().unwrap().usage, vk::BufferUsageFlags::TRANSFER_SRC);
        assert_eq!(device.copies(), vec![(staging_id, backing_id, 0, 0, 100)]);

        device.complete_all();
        buf.set_sub_data(&mut device, 50, &[0xAB; 10]).unwrap();

        // Same staging buffer, only the touched range copied.
        assert_eq!(buf.staging().unwrap().id, staging_id);
        assert_eq!(device.created().len(), 2);
        assert_eq!(
            device.copies().last().copied(),
            Some((staging_id, backing_id, 50, 50, 10))
        );

        let mut expected = pattern(100);
        expected[50..60].fill(0xAB);
        assert_eq!(buf.raw().unwrap().contents()[..100], expected[..]);
    }

    #[test]
    fn busy_staging_is_replaced_not_overwritten() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Static);
        buf.set_data(&mut device, 64, Some(&pattern(64))).unwrap();
        let first_staging = buf.staging().unwrap().id;

        // The first copy has not retired.
        buf.set_sub_data(&mut device, 0, &[1, 2, 3, 4]).unwrap();
        let second_staging = buf.staging().unwrap().id;
        assert_ne!(first_staging, second_staging);
        assert!(device.retired.contains(&first_staging));
        assert_eq!(
            device.copies().last().map(|c| (c.0, c.4)),
            Some((second_staging, 4))
        );
    }

    #[test]
    fn resize_preserves_old_bytes() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Resizable);
        let data = pattern(32);
        buf.set_data(&mut device, 32, Some(&data)).unwrap();
        let old_id = buf.raw().unwrap().id;
        let epoch = buf.binding_epoch();

        buf.resize(&mut device, 256).unwrap();

        assert_eq!(buf.size(), 256);
        assert!(buf.binding_epoch() > epoch);
        assert!(device.retired.contains(&old_id));
        assert!(device
            .events
            .iter()
            .any(|event| matches!(event, MockEvent::Wait(_))));

        let mapped = buf.map().unwrap();
        assert_eq!(mapped.len(), 256);
        assert_eq!(&mapped[..32], &data[..]);
    }

    #[test]
    fn resize_requires_resizable_policy() {
        for policy in [
            BufferPolicy::Static,
            BufferPolicy::Persistent,
            BufferPolicy::Mappable,
        ] {
            let mut device = MockDevice::new();
            let mut buf = buffer(policy);
            buf.set_data(&mut device, 16, None).unwrap();
            assert!(matches!(
                buf.resize(&mut device, 64),
                Err(GpuError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn resize_while_copy_from_buffer_pending_fails() {
        let mut device = MockDevice::new();
        let mut src = buffer(BufferPolicy::Resizable);
        let mut dst = buffer(BufferPolicy::Persistent);
        src.set_data(&mut device, 32, Some(&pattern(32))).unwrap();
        dst.set_data(&mut device, 32, None).unwrap();

        src.copy_to(&mut device, &mut dst, 0, 0, 32).unwrap();
        assert!(matches!(
            src.resize(&mut device, 64),
            Err(GpuError::InvalidState(_))
        ));

        device.complete_all();
        src.resize(&mut device, 64).unwrap();
    }

    #[test]
    fn mapping_rules() {
        let mut device = MockDevice::new();

        let mut mappable = buffer(BufferPolicy::Mappable);
        mappable.set_data(&mut device, 16, None).unwrap();
        assert!(!mappable.is_mapped());
        mappable.map().unwrap()[0] = 9;
        assert!(mappable.is_mapped());
        assert!(matches!(mappable.map(), Err(GpuError::InvalidState(_))));
        mappable.unmap().unwrap();
        assert!(!mappable.is_mapped());
        assert!(mappable.unmap().is_err());
        assert_eq!(mappable.read_back(&mut device).unwrap()[0], 9);

        let mut persistent = buffer(BufferPolicy::Persistent);
        persistent.set_data(&mut device, 16, None).unwrap();
        assert!(persistent.is_mapped());
        persistent.map().unwrap();
        persistent.map().unwrap();
        persistent.unmap().unwrap();
        assert!(persistent.is_mapped());

        let mut fixed = buffer(BufferPolicy::Static);
        fixed.set_data(&mut device, 16, None).unwrap();
        assert!(fixed.map().is_err());
        assert!(!fixed.is_mapped());
    }

    #[test]
    fn out_of_range_sub_data_is_rejected() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Persistent);
        buf.set_data(&mut device, 20, None).unwrap();
        assert!(buf.set_sub_data(&mut device, 16, &[0; 4]).is_ok());
        assert!(matches!(
            buf.set_sub_data(&mut device, 17, &[0; 4]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(buf.set_sub_data(&mut device, u64::MAX, &[0; 1]).is_err());
    }

    #[test]
    fn second_concurrent_lock_falls_back_to_scratch() {
        let mut device = MockDevice::new();
        let mut a = buffer(BufferPolicy::Mappable);
        let mut b = buffer(BufferPolicy::Mappable);
        a.set_data(&mut device, 32, None).unwrap();
        b.set_data(&mut device, 32, None).unwrap();

        a.lock(&mut device, 32).unwrap().fill(1);
        assert!(a.is_mapped());
        assert_eq!(device.map_slots().active(), 1);

        b.lock(&mut device, 32).unwrap().fill(2);
        assert!(!b.is_mapped());
        let copies_before = device.copies().len();

        b.unlock(&mut device).unwrap();
        assert_eq!(device.copies().len(), copies_before + 1);
        a.unlock(&mut device).unwrap();
        assert_eq!(device.map_slots().active(), 0);

        assert_eq!(a.read_back(&mut device).unwrap(), vec![1; 32]);
        assert_eq!(b.read_back(&mut device).unwrap(), vec![2; 32]);
    }

    #[test]
    fn static_lock_writes_through_staging() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Static);
        buf.lock(&mut device, 24).unwrap().fill(7);
        assert!(buf.is_locked());
        assert!(buf.set_sub_data(&mut device, 0, &[1]).is_err());
        buf.unlock(&mut device).unwrap();

        assert_eq!(device.map_slots().active(), 0);
        assert_eq!(buf.read_back(&mut device).unwrap(), vec![7; 24]);
    }

    #[test]
    fn static_lock_leaves_the_map_slot_free() {
        let mut device = MockDevice::new();
        let mut fixed = buffer(BufferPolicy::Static);
        let mut mappable = buffer(BufferPolicy::Mappable);
        mappable.set_data(&mut device, 16, None).unwrap();

        fixed.lock(&mut device, 16).unwrap().fill(3);
        assert_eq!(device.map_slots().active(), 0);

        mappable.lock(&mut device, 16).unwrap().fill(4);
        assert!(mappable.is_mapped());
        assert_eq!(device.map_slots().active(), 1);

        fixed.unlock(&mut device).unwrap();
        mappable.unlock(&mut device).unwrap();
        assert_eq!(device.map_slots().active(), 0);
        assert_eq!(fixed.read_back(&mut device).unwrap(), vec![3; 16]);
        assert_eq!(mappable.read_back(&mut device).unwrap(), vec![4; 16]);
    }

    #[test]
    fn failed_lock_returns_slot_and_stays_unlocked() {
        let mut device = MockDevice::new();
        let mut broken = buffer(BufferPolicy::Mappable);
        device.fail_map = true;
        broken.set_data(&mut device, 16, None).unwrap();
        device.fail_map = false;

        assert!(matches!(
            broken.lock(&mut device, 16),
            Err(GpuError::InvalidState(_))
        ));
        assert!(!broken.is_locked());
        assert_eq!(device.map_slots().active(), 0);
        assert!(broken.unlock(&mut device).is_err());

        // The slot is still there for the next lock.
        let mut healthy = buffer(BufferPolicy::Mappable);
        healthy.set_data(&mut device, 16, None).unwrap();
        healthy.lock(&mut device, 16).unwrap();
        assert!(healthy.is_mapped());
    }

    #[test]
    fn resizable_lock_grows() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Resizable);
        buf.set_data(&mut device, 8, Some(&[5; 8])).unwrap();
        let bytes = buf.lock(&mut device, 64).unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..8], &[5; 8]);
        buf.unlock(&mut device).unwrap();
        assert_eq!(buf.size(), 64);
    }

    #[test]
    fn read_back_of_static_uses_readback_buffer() {
        let mut device = MockDevice::new();
        let mut buf = Buffer::new(
            BufferKind::Index(IndexFormat::U16),
            BufferPolicy::Static,
            "indices",
        );
        buf.set_slice(&mut device, &[1u16, 2, 3]).unwrap();
        let bytes = buf.read_back(&mut device).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u16, u8>(&[1, 2, 3]));
        assert!(device
            .created()
            .iter()
            .any(|(_, _, location)| *location == MemoryLocation::GpuToCpu));
    }

    #[test]
    fn set_data_replaces_backing_and_bumps_epoch() {
        let mut device = MockDevice::new();
        let mut buf = Buffer::new(
            BufferKind::Vertex(VertexLayout::new(12)),
            BufferPolicy::Persistent,
            "verts",
        );
        buf.set_data(&mut device, 36, None).unwrap();
        let first = buf.raw().unwrap().id;
        let epoch = buf.binding_epoch();
        buf.set_data(&mut device, 36, None).unwrap();
        assert!(buf.binding_epoch() > epoch);
        assert!(device.retired.contains(&first));
    }

    #[test]
    fn release_retires_everything() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Static);
        buf.set_data(&mut device, 16, Some(&[0; 16])).unwrap();
        let ids = [buf.raw().unwrap().id, buf.staging().unwrap().id];
        buf.release(&mut device);
        assert!(ids.iter().all(|id| device.retired.contains(id)));
    }

    #[test]
    fn failed_resize_keeps_old_backing() {
        let mut device = MockDevice::new();
        let mut buf = buffer(BufferPolicy::Resizable);
        buf.set_data(&mut device, 16, Some(&[4; 16])).unwrap();
        let id = buf.raw().unwrap().id;
        let epoch = buf.binding_epoch();

        device.fail_create = true;
        assert!(matches!(
            buf.resize(&mut device, 64),
            Err(GpuError::AllocationFailed(_))
        ));
        assert_eq!(buf.raw().unwrap().id, id);
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.binding_epoch(), epoch);
        assert!(device.retired.is_empty());
    }
}
