//! Test doubles for the device and presentation seams.

use crate::buffer::{BufferDevice, DeviceBuffer, MapSlots, TransferTicket};
use crate::deferred::{Deferrable, ResourceSink};
use crate::error::{GpuError, Result};
use crate::swapchain::{SurfaceInfo, SwapchainBackend, SwapchainConfig};
use crate::sync::SlotFences;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Buffer living in plain host memory.
#[derive(Debug)]
pub(crate) struct MockBuffer {
    pub id: u32,
    pub location: MemoryLocation,
    pub usage: vk::BufferUsageFlags,
    data: Vec<u8>,
    /// Host-visible memory the driver refused to map.
    unmapped: bool,
}

impl MockBuffer {
    /// Contents regardless of visibility.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn host_visible(&self) -> bool {
        self.location != MemoryLocation::GpuOnly && !self.unmapped
    }
}

impl DeviceBuffer for MockBuffer {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn host_bytes(&self) -> Option<&[u8]> {
        if self.host_visible() {
            Some(&self.data)
        } else {
            None
        }
    }

    fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.host_visible() {
            Some(&mut self.data)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Create {
        id: u32,
        size: u64,
        location: MemoryLocation,
    },
    Copy {
        src: u32,
        dst: u32,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    Wait(u64),
    Retire(u32),
}

/// Device that applies copies immediately but reports them as in flight
/// until waited on or completed.
#[derive(Debug, Default)]
pub(crate) struct MockDevice {
    next_id: u32,
    next_ticket: u64,
    completed: u64,
    slots: MapSlots,
    pub events: Vec<MockEvent>,
    pub retired: Vec<u32>,
    pub fail_create: bool,
    /// Create buffers whose host mapping is missing.
    pub fail_map: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the GPU caught up with every submitted copy.
    pub fn complete_all(&mut self) {
        self.completed = self.next_ticket;
    }

    /// `(id, size, location)` of every buffer created, in order.
    pub fn created(&self) -> Vec<(u32, u64, MemoryLocation)> {
        self.events
            .iter()
            .filter_map(|event| match *event {
                MockEvent::Create { id, size, location } => Some((id, size, location)),
                _ => None,
            })
            .collect()
    }

    /// `(src, dst, src_offset, dst_offset, size)` of every copy, in order.
    pub fn copies(&self) -> Vec<(u32, u32, u64, u64, u64)> {
        self.events
            .iter()
            .filter_map(|event| match *event {
                MockEvent::Copy {
                    src,
                    dst,
                    src_offset,
                    dst_offset,
                    size,
                } => Some((src, dst, src_offset, dst_offset, size)),
                _ => None,
            })
            .collect()
    }
}

impl BufferDevice for MockDevice {
    type Buffer = MockBuffer;

    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<MockBuffer> {
        if self.fail_create {
            return Err(GpuError::AllocationFailed(format!("mock refused '{name}'")));
        }
        self.next_id += 1;
        let id = self.next_id;
        self.events.push(MockEvent::Create { id, size, location });
        Ok(MockBuffer {
            id,
            location,
            usage,
            data: vec![0; size as usize],
            unmapped: self.fail_map,
        })
    }

    fn copy_buffer(
        &mut self,
        src: &MockBuffer,
        dst: &mut MockBuffer,
        region: vk::BufferCopy,
    ) -> Result<TransferTicket> {
        let src_range = region.src_offset as usize..(region.src_offset + region.size) as usize;
        let dst_range = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
        let bytes = src
            .data
            .get(src_range)
            .ok_or_else(|| GpuError::InvalidState("copy source out of range".into()))?;
        dst.data
            .get_mut(dst_range)
            .ok_or_else(|| GpuError::InvalidState("copy destination out of range".into()))?
            .copy_from_slice(bytes);

        self.next_ticket += 1;
        self.events.push(MockEvent::Copy {
            src: src.id,
            dst: dst.id,
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        });
        Ok(TransferTicket(self.next_ticket))
    }

    fn is_complete(&self, ticket: TransferTicket) -> bool {
        ticket.0 <= self.completed
    }

    fn wait(&mut self, ticket: TransferTicket) -> Result<()> {
        self.completed = self.completed.max(ticket.0);
        self.events.push(MockEvent::Wait(ticket.0));
        Ok(())
    }

    fn retire(&mut self, buffer: MockBuffer) {
        self.events.push(MockEvent::Retire(buffer.id));
        self.retired.push(buffer.id);
    }

    fn map_slots(&mut self) -> &mut MapSlots {
        &mut self.slots
    }
}

/// Chain handed out by [`MockPresenter`].
#[derive(Debug)]
pub(crate) struct MockChain {
    pub id: u32,
    pub config: SwapchainConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PresenterEvent {
    Create { id: u32, old: Option<u32> },
    Destroy(u32),
}

/// Presenter history, shared so it outlives the manager owning the presenter.
#[derive(Debug, Default)]
pub(crate) struct PresenterLog {
    pub events: Vec<PresenterEvent>,
    pub destroyed: usize,
}

/// Presenter that replays scripted acquire and present results and succeeds
/// otherwise.
#[derive(Debug)]
pub(crate) struct MockPresenter {
    pub info: SurfaceInfo,
    next_id: u32,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    surface_failures: VecDeque<vk::Result>,
    create_failures: VecDeque<vk::Result>,
    log: Rc<RefCell<PresenterLog>>,
}

impl MockPresenter {
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 8192,
                height: 8192,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };
        Self {
            info: SurfaceInfo {
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::R16G16B16A16_SFLOAT,
                        color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
                    },
                ],
                present_modes: vec![
                    vk::PresentModeKHR::FIFO,
                    vk::PresentModeKHR::FIFO_RELAXED,
                    vk::PresentModeKHR::MAILBOX,
                    vk::PresentModeKHR::IMMEDIATE,
                ],
            },
            next_id: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            surface_failures: VecDeque::new(),
            create_failures: VecDeque::new(),
            log: Rc::default(),
        }
    }

    /// Queue the result of a future acquire.
    pub fn script_acquire(&mut self, result: VkResult<(u32, bool)>) {
        self.acquire_script.push_back(result);
    }

    /// Queue the result of a future present.
    pub fn script_present(&mut self, result: VkResult<bool>) {
        self.present_script.push_back(result);
    }

    /// Fail the next surface query with `result`.
    pub fn script_surface_failure(&mut self, result: vk::Result) {
        self.surface_failures.push_back(result);
    }

    /// Fail the next chain creation with `result`.
    pub fn script_create_failure(&mut self, result: vk::Result) {
        self.create_failures.push_back(result);
    }

    pub fn log(&self) -> Rc<RefCell<PresenterLog>> {
        Rc::clone(&self.log)
    }

    pub fn events(&self) -> Vec<PresenterEvent> {
        self.log.borrow().events.clone()
    }

    /// Number of chains created so far.
    pub fn created(&self) -> usize {
        self.log
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, PresenterEvent::Create { .. }))
            .count()
    }

    /// How often the chain `id` (and with it its views) was destroyed.
    pub fn destroyed_views(&self, id: u32) -> usize {
        self.log
            .borrow()
            .events
            .iter()
            .filter(|e| **e == PresenterEvent::Destroy(id))
            .count()
    }
}

impl SwapchainBackend for MockPresenter {
    type Chain = MockChain;

    fn surface_info(&mut self) -> VkResult<SurfaceInfo> {
        match self.surface_failures.pop_front() {
            Some(result) => Err(result),
            None => Ok(self.info.clone()),
        }
    }

    fn create_chain(
        &mut self,
        config: &SwapchainConfig,
        old: Option<&MockChain>,
    ) -> VkResult<MockChain> {
        if let Some(result) = self.create_failures.pop_front() {
            return Err(result);
        }
        self.next_id += 1;
        let id = self.next_id;
        self.log.borrow_mut().events.push(PresenterEvent::Create {
            id,
            old: old.map(|chain| chain.id),
        });
        Ok(MockChain {
            id,
            config: *config,
        })
    }

    fn destroy_chain(&mut self, chain: MockChain) {
        let mut log = self.log.borrow_mut();
        log.events.push(PresenterEvent::Destroy(chain.id));
        log.destroyed += 1;
    }

    fn acquire(
        &mut self,
        _chain: &MockChain,
        _semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        self.acquire_script.pop_front().unwrap_or(Ok((0, false)))
    }

    fn present(
        &mut self,
        _chain: &MockChain,
        _image_index: u32,
        _wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        self.present_script.pop_front().unwrap_or(Ok(false))
    }
}

/// Frame-slot fences with a queue that retires work when it is waited on.
#[derive(Debug)]
pub(crate) struct MockFences {
    signaled: Vec<bool>,
    /// Frame last submitted on each slot.
    submitted: Vec<Option<u64>>,
    newest_waited: u64,
    fail_next_wait: bool,
}

impl MockFences {
    pub fn new(slots: usize) -> Self {
        Self {
            signaled: vec![true; slots],
            submitted: vec![None; slots],
            newest_waited: 0,
            fail_next_wait: false,
        }
    }

    /// Queue `frame` on `slot`; its fence must have been reset.
    pub fn submit(&mut self, slot: usize, frame: u64) {
        assert!(!self.signaled[slot], "submitted with a signaled fence");
        self.submitted[slot] = Some(frame);
    }

    /// Newest submitted frame whose fence has been waited.
    pub fn newest_waited_frame(&self) -> u64 {
        self.newest_waited
    }

    pub fn fail_next_wait(&mut self) {
        self.fail_next_wait = true;
    }
}

impl SlotFences for MockFences {
    fn wait(&mut self, slot: usize) -> Result<()> {
        if std::mem::take(&mut self.fail_next_wait) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        if let Some(frame) = self.submitted[slot] {
            self.newest_waited = self.newest_waited.max(frame);
        }
        self.signaled[slot] = true;
        Ok(())
    }

    fn reset(&mut self, slot: usize) -> Result<()> {
        self.signaled[slot] = false;
        Ok(())
    }
}

impl Deferrable for &'static str {}

/// Records the names of destroyed resources.
#[derive(Debug, Default)]
pub(crate) struct NameSink {
    pub destroyed: Vec<&'static str>,
}

impl ResourceSink<&'static str> for NameSink {
    fn destroy(&mut self, resource: &'static str) -> Result<()> {
        self.destroyed.push(resource);
        Ok(())
    }
}
