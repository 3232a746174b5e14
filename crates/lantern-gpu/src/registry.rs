//! Owner of every live buffer.
//!
//! Lets the renderer walk all buffers, for instance to drop their contents
//! when the device is reset, without buffers linking to each other.

use crate::buffer::{Buffer, BufferDevice, BufferPolicy, DeviceBuffer};
use crate::kind::BufferKind;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle to a buffer in a [`BufferRegistry`].
    pub struct BufferHandle;
}

/// Live buffers behind generation-checked handles.
pub struct BufferRegistry<B> {
    buffers: SlotMap<BufferHandle, Buffer<B>>,
}

impl<B> Default for BufferRegistry<B> {
    fn default() -> Self {
        Self {
            buffers: SlotMap::with_key(),
        }
    }
}

impl<B: DeviceBuffer> BufferRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, unallocated buffer.
    pub fn create(
        &mut self,
        kind: BufferKind,
        policy: BufferPolicy,
        name: impl Into<String>,
    ) -> BufferHandle {
        self.buffers.insert(Buffer::new(kind, policy, name))
    }

    /// Take ownership of an existing buffer.
    pub fn insert(&mut self, buffer: Buffer<B>) -> BufferHandle {
        self.buffers.insert(buffer)
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&Buffer<B>> {
        self.buffers.get(handle)
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Option<&mut Buffer<B>> {
        self.buffers.get_mut(handle)
    }

    /// Remove a buffer and hand its allocations to deferred destruction.
    ///
    /// Returns `false` for stale handles.
    pub fn destroy<D>(&mut self, device: &mut D, handle: BufferHandle) -> bool
    where
        D: BufferDevice<Buffer = B>,
    {
        match self.buffers.remove(handle) {
            Some(buffer) => {
                buffer.release(device);
                true
            }
            None => false,
        }
    }

    /// Visit every live buffer.
    pub fn for_each_live(&self, mut f: impl FnMut(BufferHandle, &Buffer<B>)) {
        for (handle, buffer) in self.buffers.iter() {
            f(handle, buffer);
        }
    }

    /// Release the allocations of every live buffer, keeping the handles.
    ///
    /// Buffers come back unallocated and must be filled again with
    /// `set_data`.
    pub fn reset_all<D>(&mut self, device: &mut D)
    where
        D: BufferDevice<Buffer = B>,
    {
        let mut count = 0usize;
        for buffer in self.buffers.values_mut() {
            let fresh = Buffer::new(buffer.kind().clone(), buffer.policy(), buffer.name());
            std::mem::replace(buffer, fresh).release(device);
            count += 1;
        }
        tracing::debug!(count, "Reset all buffers");
    }

    /// Release every buffer and forget the handles.
    pub fn clear<D>(&mut self, device: &mut D)
    where
        D: BufferDevice<Buffer = B>,
    {
        for (_, buffer) in self.buffers.drain() {
            buffer.release(device);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBuffer, MockDevice};

    #[test]
    fn destroy_invalidates_handle() {
        let mut device = MockDevice::new();
        let mut registry: BufferRegistry<MockBuffer> = BufferRegistry::new();
        let handle = registry.create(BufferKind::Uniform, BufferPolicy::Persistent, "ubo");
        registry
            .get_mut(handle)
            .unwrap()
            .set_data(&mut device, 64, None)
            .unwrap();
        let id = registry.get(handle).unwrap().raw().unwrap().id;

        assert!(registry.destroy(&mut device, handle));
        assert!(registry.get(handle).is_none());
        assert!(!registry.destroy(&mut device, handle));
        assert_eq!(device.retired, vec![id]);
    }

    #[test]
    fn for_each_live_skips_destroyed() {
        let mut device = MockDevice::new();
        let mut registry: BufferRegistry<MockBuffer> = BufferRegistry::new();
        let a = registry.create(BufferKind::Storage, BufferPolicy::Static, "a");
        let b = registry.create(BufferKind::Storage, BufferPolicy::Static, "b");
        let c = registry.create(BufferKind::Storage, BufferPolicy::Static, "c");
        registry.destroy(&mut device, b);

        let mut seen = Vec::new();
        registry.for_each_live(|handle, buffer| seen.push((handle, buffer.name().to_owned())));
        assert_eq!(seen, vec![(a, "a".to_owned()), (c, "c".to_owned())]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reset_all_releases_allocations_and_keeps_handles() {
        let mut device = MockDevice::new();
        let mut registry: BufferRegistry<MockBuffer> = BufferRegistry::new();
        let handle = registry.create(BufferKind::Storage, BufferPolicy::Static, "mesh");
        registry
            .get_mut(handle)
            .unwrap()
            .set_data(&mut device, 32, Some(&[3; 32]))
            .unwrap();

        registry.reset_all(&mut device);

        let buffer = registry.get(handle).unwrap();
        assert!(buffer.raw().is_none());
        assert!(buffer.staging().is_none());
        assert_eq!(buffer.policy(), BufferPolicy::Static);
        assert_eq!(device.retired.len(), 2);

        registry.clear(&mut device);
        assert!(registry.is_empty());
    }
}
