//! Buffer copies on the transfer queue.
//!
//! Copies are recorded into a small ring of command buffers, each with its
//! own fence. Every copy gets a monotonically increasing ticket; a batch
//! covers a contiguous ticket range, so a retired fence retires every ticket
//! up to the batch's last one.
//!
//! When the upload family differs from the graphics family, each copied range
//! gets a queue-family ownership release at the end of its batch and a
//! matching acquire that the graphics command buffer records before first
//! use. On a shared family a plain buffer barrier at the end of the batch is
//! enough.
//!
//! Ownership goes back the other way too. Before a batch touches a buffer the
//! graphics family owns, a small graphics-queue submission releases it to the
//! upload family and the batch waits on it. The batch hands the buffer back
//! to graphics at its end.

use crate::buffer::TransferTicket;
use crate::command::{self, CommandPool, Submission};
use crate::error::{GpuError, Result, VkResultExt};
use crate::sync::{create_fence, create_semaphore, reset_fence, wait_for_fence};
use ash::vk;
use std::collections::HashSet;
use std::sync::Arc;

/// Command buffers the transfer queue cycles through.
pub const TRANSFER_BATCHES: usize = 2;

/// Accesses a freshly uploaded buffer may see on the graphics queue.
const CONSUMER_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags::INDEX_READ.as_raw()
        | vk::AccessFlags::UNIFORM_READ.as_raw()
        | vk::AccessFlags::SHADER_READ.as_raw()
        | vk::AccessFlags::TRANSFER_READ.as_raw(),
);

/// Barriers that make one copied range visible to the graphics queue.
#[derive(Debug, Clone, Copy)]
pub enum TransferBarriers {
    /// Same family: recorded at the end of the transfer batch.
    Shared(vk::BufferMemoryBarrier<'static>),
    /// Different families: `release` ends the transfer batch, `acquire` is
    /// recorded on the graphics command buffer.
    Ownership {
        release: vk::BufferMemoryBarrier<'static>,
        acquire: vk::BufferMemoryBarrier<'static>,
    },
}

/// Plan the barriers for a copy into `buffer[offset..offset + size]`.
pub fn plan_buffer_transfer(
    transfer_family: u32,
    graphics_family: u32,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
) -> TransferBarriers {
    let base = vk::BufferMemoryBarrier::default()
        .buffer(buffer)
        .offset(offset)
        .size(size);

    if transfer_family == graphics_family {
        return TransferBarriers::Shared(
            base.src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(CONSUMER_ACCESS)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
        );
    }

    let owned = base
        .src_queue_family_index(transfer_family)
        .dst_queue_family_index(graphics_family);
    TransferBarriers::Ownership {
        release: owned
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty()),
        acquire: owned
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(CONSUMER_ACCESS),
    }
}

/// Barriers that hand a graphics-owned buffer back to the upload family.
#[derive(Debug, Clone, Copy)]
pub struct OwnershipReturn {
    /// Recorded on the graphics queue ahead of the batch.
    pub release: vk::BufferMemoryBarrier<'static>,
    /// Recorded in the batch before the first copy touching the buffer.
    pub acquire: vk::BufferMemoryBarrier<'static>,
}

/// Plan the return of `buffer` from the graphics family.
///
/// `None` when both families are the same and ownership never moves.
pub fn plan_ownership_return(
    transfer_family: u32,
    graphics_family: u32,
    buffer: vk::Buffer,
) -> Option<OwnershipReturn> {
    if transfer_family == graphics_family {
        return None;
    }
    let owned = vk::BufferMemoryBarrier::default()
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .src_queue_family_index(graphics_family)
        .dst_queue_family_index(transfer_family);
    Some(OwnershipReturn {
        release: owned
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::empty()),
        acquire: owned
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE),
    })
}

/// How a copy may touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Not owned by graphics; ranges written are released at batch end.
    Free,
    /// Owned by graphics; return it before the copy records.
    Return,
    /// Returned earlier in this batch.
    Returned,
}

/// Queue-family ownership of buffers touched by cross-family transfers.
#[derive(Debug, Default)]
pub struct OwnershipTracker {
    /// Released to graphics by a submitted batch.
    graphics_owned: HashSet<vk::Buffer>,
    /// Written by the recording batch; released to graphics at its end.
    written: HashSet<vk::Buffer>,
    /// Returned to the recording batch; released back whole at its end.
    returned: HashSet<vk::Buffer>,
}

impl OwnershipTracker {
    /// Claim `buffer` for a copy in the recording batch.
    pub fn claim(&mut self, buffer: vk::Buffer, write: bool) -> Claim {
        if self.returned.contains(&buffer) {
            return Claim::Returned;
        }
        if self.graphics_owned.remove(&buffer) {
            self.returned.insert(buffer);
            return Claim::Return;
        }
        if write {
            self.written.insert(buffer);
        }
        Claim::Free
    }

    /// Close the recording batch.
    ///
    /// Everything it wrote or returned belongs to graphics afterwards. The
    /// returned buffers, which need a whole-buffer release, come back.
    pub fn end_batch(&mut self) -> Vec<vk::Buffer> {
        self.graphics_owned.extend(self.written.drain());
        let returned: Vec<vk::Buffer> = self.returned.drain().collect();
        self.graphics_owned.extend(returned.iter().copied());
        returned
    }

    /// Whether graphics owns `buffer` between batches.
    pub fn is_graphics_owned(&self, buffer: vk::Buffer) -> bool {
        self.graphics_owned.contains(&buffer)
    }

    /// Drop a destroyed buffer; its handle may be reused.
    pub fn forget(&mut self, buffer: vk::Buffer) {
        self.graphics_owned.remove(&buffer);
        self.written.remove(&buffer);
        self.returned.remove(&buffer);
    }
}

struct Batch {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    /// Last ticket recorded into this batch.
    last_ticket: u64,
    copies: usize,
    recording: bool,
    in_flight: bool,
    end_barriers: Vec<vk::BufferMemoryBarrier<'static>>,
    /// Graphics-queue command buffer returning buffers to this batch.
    return_cmd: vk::CommandBuffer,
    /// Signalled by `return_cmd`, waited by the batch.
    returned: vk::Semaphore,
    /// Acquires of buffers released by an earlier batch but never acquired.
    graphics_acquires: Vec<vk::BufferMemoryBarrier<'static>>,
    graphics_releases: Vec<vk::BufferMemoryBarrier<'static>>,
}

impl Batch {
    fn new(cmd: vk::CommandBuffer, fence: vk::Fence) -> Self {
        Self {
            cmd,
            fence,
            last_ticket: 0,
            copies: 0,
            recording: false,
            in_flight: false,
            end_barriers: Vec::new(),
            return_cmd: vk::CommandBuffer::null(),
            returned: vk::Semaphore::null(),
            graphics_acquires: Vec::new(),
            graphics_releases: Vec::new(),
        }
    }
}

/// Records and submits buffer copies on the upload queue.
pub struct TransferQueue {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    graphics_queue: vk::Queue,
    graphics_family: u32,
    pool: CommandPool,
    /// Graphics-family pool for ownership returns; cross-family only.
    return_pool: Option<CommandPool>,
    batches: Vec<Batch>,
    current: usize,
    next_ticket: u64,
    completed: u64,
    pending_acquires: Vec<vk::BufferMemoryBarrier<'static>>,
    owners: OwnershipTracker,
}

impl TransferQueue {
    /// Create the queue's command pools, command buffers, fences and
    /// semaphores.
    ///
    /// # Safety
    /// The device must be valid, `queue` must belong to `family` and
    /// `graphics_queue` to `graphics_family`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue: vk::Queue,
        family: u32,
        graphics_queue: vk::Queue,
        graphics_family: u32,
    ) -> Result<Self> {
        let pool = CommandPool::new(&device, family, true)?;

        let mut this = Self {
            device,
            queue,
            graphics_queue,
            graphics_family,
            pool,
            return_pool: None,
            batches: Vec::with_capacity(TRANSFER_BATCHES),
            current: 0,
            next_ticket: 0,
            completed: 0,
            pending_acquires: Vec::new(),
            owners: OwnershipTracker::default(),
        };

        // On failure `this` drops and destroys what was created so far.
        let cmds = this.pool.allocate(&this.device, TRANSFER_BATCHES as u32)?;
        for cmd in cmds {
            let fence = create_fence(&this.device, false)?;
            this.batches.push(Batch::new(cmd, fence));
        }

        if family != graphics_family {
            let return_pool = CommandPool::new(&this.device, graphics_family, true)?;
            let return_cmds = return_pool.allocate(&this.device, TRANSFER_BATCHES as u32);
            this.return_pool = Some(return_pool);
            for (batch, cmd) in this.batches.iter_mut().zip(return_cmds?) {
                batch.return_cmd = cmd;
                batch.returned = create_semaphore(&this.device)?;
            }
        }

        Ok(this)
    }

    /// Family copies are recorded on.
    pub fn family(&self) -> u32 {
        self.pool.queue_family()
    }

    /// Whether copies need ownership transfers to reach the graphics queue.
    pub fn is_cross_family(&self) -> bool {
        self.family() != self.graphics_family
    }

    /// Record a copy into the current batch.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<TransferTicket> {
        self.ensure_recording()?;
        let family = self.family();
        let graphics_family = self.graphics_family;
        let mut dst_claim = Claim::Free;
        if self.is_cross_family() {
            if src != dst {
                let claim = self.owners.claim(src, false);
                if claim == Claim::Return {
                    self.return_to_transfer(src)?;
                }
            }
            dst_claim = self.owners.claim(dst, true);
            if dst_claim == Claim::Return {
                self.return_to_transfer(dst)?;
            }
        }
        let batch = &mut self.batches[self.current];

        // SAFETY: the batch is recording and both buffers are alive until
        // their owners retire them through the frame reaper.
        unsafe {
            if batch.copies > 0 {
                // Earlier copies in the batch may touch the same bytes.
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
                self.device.cmd_pipeline_barrier(
                    batch.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
            let region = vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            };
            self.device.cmd_copy_buffer(batch.cmd, src, dst, &[region]);
        }

        // Returned buffers are released whole when the batch ends.
        if dst_claim == Claim::Free {
            match plan_buffer_transfer(family, graphics_family, dst, dst_offset, size) {
                TransferBarriers::Shared(barrier) => batch.end_barriers.push(barrier),
                TransferBarriers::Ownership { release, acquire } => {
                    batch.end_barriers.push(release);
                    self.pending_acquires.push(acquire);
                }
            }
        }

        self.next_ticket += 1;
        batch.last_ticket = self.next_ticket;
        batch.copies += 1;
        Ok(TransferTicket(self.next_ticket))
    }

    /// Take `buffer` back from the graphics family for the recording batch.
    ///
    /// A buffer whose acquire was never recorded on the graphics side is
    /// acquired by the return submission itself, after the batch that
    /// released it has retired.
    fn return_to_transfer(&mut self, buffer: vk::Buffer) -> Result<()> {
        let Some(plan) = plan_ownership_return(self.family(), self.graphics_family, buffer) else {
            return Ok(());
        };

        let mut unacquired = Vec::new();
        self.pending_acquires.retain(|barrier| {
            if barrier.buffer == buffer {
                unacquired.push(*barrier);
                false
            } else {
                true
            }
        });
        if !unacquired.is_empty() {
            for index in 0..self.batches.len() {
                if index != self.current {
                    self.retire_batch(index)?;
                }
            }
        }

        let batch = &mut self.batches[self.current];
        // SAFETY: the batch is recording; the acquire pairs with a release
        // submitted on the graphics queue before the batch.
        unsafe {
            self.device.cmd_pipeline_barrier(
                batch.cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[plan.acquire],
                &[],
            );
        }
        batch.graphics_acquires.extend(unacquired);
        batch.graphics_releases.push(plan.release);
        tracing::trace!(?buffer, "Buffer returned to the upload family");
        Ok(())
    }

    fn ensure_recording(&mut self) -> Result<()> {
        if self.batches[self.current].recording {
            return Ok(());
        }
        self.retire_batch(self.current)?;

        let batch = &mut self.batches[self.current];
        // SAFETY: the batch's previous submission has retired.
        unsafe { command::restart(&self.device, batch.cmd) }?;
        batch.recording = true;
        batch.copies = 0;
        batch.end_barriers.clear();
        batch.graphics_acquires.clear();
        batch.graphics_releases.clear();
        Ok(())
    }

    /// Wait for an in-flight batch and mark its tickets complete.
    fn retire_batch(&mut self, index: usize) -> Result<()> {
        let batch = &mut self.batches[index];
        if !batch.in_flight {
            return Ok(());
        }
        // SAFETY: the fence belongs to this queue's device.
        unsafe {
            wait_for_fence(&self.device, batch.fence, u64::MAX)?;
            reset_fence(&self.device, batch.fence)?;
        }
        batch.in_flight = false;
        self.completed = self.completed.max(batch.last_ticket);
        Ok(())
    }

    /// Whether there are recorded copies waiting for [`TransferQueue::submit`].
    pub fn has_pending_copies(&self) -> bool {
        self.batches[self.current].recording && self.batches[self.current].copies > 0
    }

    /// Submit the current batch, signalling `signal` when it retires.
    ///
    /// Returns `false` (and signals nothing) when no copies were recorded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&mut self, signal: &[vk::Semaphore]) -> Result<bool> {
        if !self.has_pending_copies() {
            return Ok(false);
        }
        let cross_family = self.is_cross_family();
        if cross_family {
            let (family, graphics_family) = (self.family(), self.graphics_family);
            for buffer in self.owners.end_batch() {
                if let TransferBarriers::Ownership { release, acquire } =
                    plan_buffer_transfer(family, graphics_family, buffer, 0, vk::WHOLE_SIZE)
                {
                    self.batches[self.current].end_barriers.push(release);
                    self.pending_acquires.push(acquire);
                }
            }
        }
        let batch = &mut self.batches[self.current];

        let dst_stage = if cross_family {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            vk::PipelineStageFlags::ALL_COMMANDS
        };

        // SAFETY: the batch is recording; fence, semaphores and queues belong
        // to the device. The return command buffer was last used by this
        // batch's previous submission, which has retired.
        unsafe {
            let mut submission = Submission::new(batch.cmd);
            if !batch.graphics_releases.is_empty() {
                command::restart(&self.device, batch.return_cmd)?;
                if !batch.graphics_acquires.is_empty() {
                    self.device.cmd_pipeline_barrier(
                        batch.return_cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        vk::DependencyFlags::empty(),
                        &[],
                        &batch.graphics_acquires,
                        &[],
                    );
                }
                self.device.cmd_pipeline_barrier(
                    batch.return_cmd,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &batch.graphics_releases,
                    &[],
                );
                command::finish(&self.device, batch.return_cmd)?;
                Submission::new(batch.return_cmd)
                    .signal(&[batch.returned])
                    .submit(&self.device, self.graphics_queue)?;
                submission = submission.wait(batch.returned, vk::PipelineStageFlags::TRANSFER);
            }

            self.device.cmd_pipeline_barrier(
                batch.cmd,
                vk::PipelineStageFlags::TRANSFER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &batch.end_barriers,
                &[],
            );
            command::finish(&self.device, batch.cmd)?;
            submission
                .signal(signal)
                .fence(batch.fence)
                .submit(&self.device, self.queue)?;
        }

        tracing::trace!(copies = batch.copies, last_ticket = batch.last_ticket, "Transfer batch submitted");
        batch.recording = false;
        batch.in_flight = true;
        self.current = (self.current + 1) % self.batches.len();
        Ok(true)
    }

    /// Whether the copy behind `ticket` has retired.
    pub fn is_complete(&self, ticket: TransferTicket) -> bool {
        if ticket.0 <= self.completed {
            return true;
        }
        // Batches retire in submission order, so any signalled batch at or
        // past the ticket covers it.
        self.batches.iter().any(|batch| {
            batch.in_flight
                && batch.last_ticket >= ticket.0
                // SAFETY: the fence belongs to this queue's device.
                && unsafe { self.device.get_fence_status(batch.fence) }.unwrap_or(false)
        })
    }

    /// Retire every batch whose fence has signalled.
    pub fn poll(&mut self) -> Result<()> {
        for index in 0..self.batches.len() {
            let batch = &self.batches[index];
            // SAFETY: the fence belongs to this queue's device.
            let signaled = batch.in_flight
                && unsafe { self.device.get_fence_status(batch.fence) }
                    .op("vkGetFenceStatus")?;
            if signaled {
                self.retire_batch(index)?;
            }
        }
        Ok(())
    }

    /// Block until `ticket` retires, submitting its batch first if needed.
    pub fn wait(&mut self, ticket: TransferTicket) -> Result<()> {
        if ticket.0 <= self.completed {
            return Ok(());
        }
        if ticket.0 > self.next_ticket {
            return Err(GpuError::InvalidState(format!(
                "wait on unissued transfer ticket {}",
                ticket.0
            )));
        }
        if self.batches[self.current].recording && self.batches[self.current].last_ticket >= ticket.0
        {
            self.submit(&[])?;
        }
        for index in 0..self.batches.len() {
            if self.batches[index].last_ticket >= ticket.0 {
                self.retire_batch(index)?;
            }
        }
        Ok(())
    }

    /// Record queued ownership acquires into a graphics command buffer.
    ///
    /// Must be called before the first use of uploaded buffers in the
    /// submission that waits on the transfer semaphore. Returns the number of
    /// barriers recorded.
    ///
    /// # Safety
    /// `cmd` must be recording on the graphics family.
    pub unsafe fn record_pending_acquires(&mut self, cmd: vk::CommandBuffer) -> usize {
        if self.pending_acquires.is_empty() {
            return 0;
        }
        self.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &self.pending_acquires,
            &[],
        );
        let count = self.pending_acquires.len();
        self.pending_acquires.clear();
        count
    }

    /// Stop tracking the ownership of a buffer about to be destroyed.
    pub fn forget(&mut self, buffer: vk::Buffer) {
        self.owners.forget(buffer);
    }

    /// Submit leftovers and wait for everything.
    pub fn flush(&mut self) -> Result<()> {
        self.submit(&[])?;
        for index in 0..self.batches.len() {
            self.retire_batch(index)?;
        }
        Ok(())
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        // SAFETY: fences and pool belong to this device; nothing is in flight
        // after the wait.
        unsafe {
            let in_flight: Vec<vk::Fence> = self
                .batches
                .iter()
                .filter(|batch| batch.in_flight)
                .map(|batch| batch.fence)
                .collect();
            if !in_flight.is_empty() {
                let _ = self.device.wait_for_fences(&in_flight, true, u64::MAX);
            }
            for batch in &self.batches {
                self.device.destroy_fence(batch.fence, None);
                if batch.returned != vk::Semaphore::null() {
                    self.device.destroy_semaphore(batch.returned, None);
                }
            }
            if let Some(return_pool) = &self.return_pool {
                return_pool.destroy(&self.device);
            }
            self.pool.destroy(&self.device);
        }
    }
}
