//! The frame compiler. One [FrameCompiler] lives for exactly one `build()`
//! call: it walks the drained op list in order, reconciles every touched
//! resource's tracked state with what the op's pass declares, records
//! barriers and commands into per-queue command buffers, splits those
//! buffers at queue-ownership transfers, and finally replays the global
//! submission order, transitions the swapchain image and presents.
//!
//! The per-queue state machine is [QueueTrack]: an optional open command
//! buffer, the wait semaphores accumulated for it, and the list of already
//! closed [CompiledCommandBuffer]s. Closing a buffer appends it to the
//! track *and* to the global submission order in the same call, which is
//! what keeps cross-queue ordering reconstructible from a single list.

use ash::vk;
use smallvec::SmallVec;
use weft::{
    handle::{CommandBuffer, Fence, ImageHandle, Semaphore},
    BufferBarrier, GpuDevice, ImageBarrier, QueueKind,
};

use crate::{
    descriptors::GlobalDescriptors,
    op::{GpuOp, OpCommand, TransferDirection},
    pass::{BufferTransferPass, ComputePass, GraphicsPass, ImageTransferPass, ResourceUsageEntry},
    pipelines::PipelineCache,
    state::{AnyResource, BarrierTarget, QueueOwnership, ResourceState},
    CompileError,
};

use std::sync::Arc;
use weft::{handle::ImageViewHandle, SpecializedShader};

///Per-queue pool of reusable semaphores. Grows on demand, the cursor is
/// reset when the owning frame slot is retired.
pub(crate) struct SemaphoreCache {
    semaphores: Vec<Semaphore>,
    cursor: usize,
}

impl SemaphoreCache {
    pub fn new() -> Self {
        SemaphoreCache {
            semaphores: Vec::new(),
            cursor: 0,
        }
    }

    pub fn next<D: GpuDevice>(&mut self, device: &D) -> Result<Semaphore, CompileError> {
        if self.cursor == self.semaphores.len() {
            self.semaphores.push(device.create_semaphore()?);
        }
        let sem = self.semaphores[self.cursor];
        self.cursor += 1;
        Ok(sem)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

///A closed recording unit, waiting for submission.
pub(crate) struct CompiledCommandBuffer {
    pub buffer: CommandBuffer,
    pub waits: SmallVec<[(Semaphore, vk::PipelineStageFlags2); 4]>,
    pub signals: SmallVec<[Semaphore; 2]>,
}

///Recording state of one queue during compilation.
pub(crate) struct QueueTrack {
    pub kind: QueueKind,
    pub family: u32,
    pub current: Option<CommandBuffer>,
    ///Semaphores the *next closed* buffer must wait on.
    pub pending_waits: SmallVec<[(Semaphore, vk::PipelineStageFlags2); 4]>,
    pub compiled: Vec<CompiledCommandBuffer>,
}

///Everything one in-flight frame owns: its command buffers, semaphore pools
/// and the fences that gate reuse of this slot.
pub(crate) struct FrameSlot {
    pub command_buffers: Vec<CommandBuffer>,
    pub semaphores: [SemaphoreCache; 3],
    pub image_acquire: Semaphore,
    pub frame_finished: Semaphore,
    pub fences: [Fence; 3],
    pub fences_used: [bool; 3],
    pub in_flight: bool,
}

impl FrameSlot {
    pub fn new<D: GpuDevice>(device: &D) -> Result<Self, CompileError> {
        Ok(FrameSlot {
            command_buffers: Vec::new(),
            semaphores: [
                SemaphoreCache::new(),
                SemaphoreCache::new(),
                SemaphoreCache::new(),
            ],
            image_acquire: device.create_semaphore()?,
            frame_finished: device.create_semaphore()?,
            fences: [
                device.create_fence()?,
                device.create_fence()?,
                device.create_fence()?,
            ],
            fences_used: [false; 3],
            in_flight: false,
        })
    }

    ///Blocks until the slot's previous frame has finished on the GPU, then
    /// recycles its command buffers and semaphore cursors.
    pub fn retire<D: GpuDevice>(&mut self, device: &D) -> Result<(), CompileError> {
        if self.in_flight {
            for (fence, used) in self.fences.iter().zip(self.fences_used.iter_mut()) {
                if *used {
                    device.wait_fence(*fence, u64::MAX)?;
                    device.reset_fence(*fence)?;
                    *used = false;
                }
            }
            self.in_flight = false;
        }
        for cb in self.command_buffers.drain(..) {
            device.free_command_buffer(cb);
        }
        for cache in &mut self.semaphores {
            cache.reset();
        }
        Ok(())
    }
}

///Op with all names resolved against the registries. Produced by the graph
/// before compilation so every validation error surfaces before the first
/// barrier is recorded.
pub(crate) struct ResolvedOp {
    pub op: GpuOp,
    pub pass: ResolvedPass,
    pub queue: QueueKind,
    ///The op's explicit resources followed by any attachments that were
    /// not listed explicitly; aligned positionally with `usages`.
    pub resources: Vec<AnyResource>,
    pub usages: Vec<ResourceUsageEntry>,
    ///Color attachment views in declaration order, depth last.
    pub attachment_views: Vec<ImageViewHandle>,
    pub attachment_names: Vec<String>,
    pub extent: vk::Extent2D,
}

pub(crate) enum ResolvedPass {
    Graphics {
        pass: Arc<GraphicsPass>,
        vertex: SpecializedShader,
        fragment: SpecializedShader,
    },
    Compute {
        pass: Arc<ComputePass>,
        shader: SpecializedShader,
    },
    BufferTransfer(Arc<BufferTransferPass>),
    ImageTransfer(Arc<ImageTransferPass>),
}

impl ResolvedPass {
    pub fn usages(&self) -> &[ResourceUsageEntry] {
        match self {
            ResolvedPass::Graphics { pass, .. } => &pass.usages,
            ResolvedPass::Compute { pass, .. } => &pass.usages,
            ResolvedPass::BufferTransfer(pass) => &pass.usages,
            ResolvedPass::ImageTransfer(pass) => &pass.usages,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResolvedPass::Graphics { pass, .. } => &pass.name,
            ResolvedPass::Compute { pass, .. } => &pass.name,
            ResolvedPass::BufferTransfer(pass) => &pass.name,
            ResolvedPass::ImageTransfer(pass) => &pass.name,
        }
    }
}

pub(crate) struct FrameCompiler<'a, D: GpuDevice> {
    device: &'a D,
    tracks: [QueueTrack; 3],
    ///Global submission order: (track index, index into that track's
    /// compiled list). Appended only by [close](Self::close).
    order: Vec<(usize, usize)>,
    slot: &'a mut FrameSlot,
}

impl<'a, D: GpuDevice> FrameCompiler<'a, D> {
    pub fn new(device: &'a D, slot: &'a mut FrameSlot) -> Self {
        let tracks = QueueKind::ALL.map(|kind| QueueTrack {
            kind,
            family: device.queue_family(kind),
            current: None,
            pending_waits: SmallVec::new(),
            compiled: Vec::new(),
        });
        FrameCompiler {
            device,
            tracks,
            order: Vec::new(),
            slot,
        }
    }

    ///Open command buffer of `track`, allocating and beginning one if the
    /// track has none.
    fn ensure_open(&mut self, track: usize) -> Result<CommandBuffer, CompileError> {
        if let Some(cb) = self.tracks[track].current {
            return Ok(cb);
        }
        let cb = self.device.allocate_command_buffer(self.tracks[track].kind)?;
        self.device.begin_command_buffer(cb)?;
        self.slot.command_buffers.push(cb);
        self.tracks[track].current = Some(cb);
        #[cfg(feature = "logging")]
        log::trace!("Opened command buffer on {}", self.tracks[track].kind);
        Ok(cb)
    }

    ///Closes the track's open buffer, if any, attaching the accumulated
    /// wait semaphores and the optional `signal`. The closed buffer is
    /// appended to the compiled list and the global submission order in the
    /// same step.
    fn close(&mut self, track: usize, signal: Option<Semaphore>) -> Result<(), CompileError> {
        let Some(cb) = self.tracks[track].current.take() else {
            return Ok(());
        };
        self.device.end_command_buffer(cb)?;
        let waits = std::mem::take(&mut self.tracks[track].pending_waits);
        let mut signals = SmallVec::new();
        if let Some(sem) = signal {
            signals.push(sem);
        }
        self.tracks[track].compiled.push(CompiledCommandBuffer {
            buffer: cb,
            waits,
            signals,
        });
        self.order
            .push((track, self.tracks[track].compiled.len() - 1));
        #[cfg(feature = "logging")]
        log::trace!(
            "Closed command buffer {} on {}",
            self.tracks[track].compiled.len() - 1,
            self.tracks[track].kind
        );
        Ok(())
    }

    fn track_for_family(&self, family: u32) -> Option<usize> {
        self.tracks.iter().position(|t| t.family == family)
    }

    fn record_transition(
        &self,
        cb: CommandBuffer,
        resource: &AnyResource,
        from: ResourceState,
        to_stage: vk::PipelineStageFlags2,
        to_access: vk::AccessFlags2,
        to_layout: vk::ImageLayout,
        src_family: u32,
        dst_family: u32,
    ) {
        match resource.target() {
            BarrierTarget::Buffer(buffer) => self.device.cmd_pipeline_barrier(
                cb,
                &[BufferBarrier {
                    buffer,
                    src_stage: from.stage,
                    src_access: from.access,
                    dst_stage: to_stage,
                    dst_access: to_access,
                    src_family,
                    dst_family,
                }],
                &[],
            ),
            BarrierTarget::Image(image) => self.device.cmd_pipeline_barrier(
                cb,
                &[],
                &[ImageBarrier {
                    image,
                    src_stage: from.stage,
                    src_access: from.access,
                    dst_stage: to_stage,
                    dst_access: to_access,
                    old_layout: from.layout,
                    new_layout: to_layout,
                    src_family,
                    dst_family,
                }],
            ),
        }
    }

    ///Brings one resource from its tracked state into the state `usage`
    /// demands at the start of an op on `dst`. Emits nothing when the state
    /// already matches; emits a release/split/acquire when the owning queue
    /// differs.
    fn reconcile(
        &mut self,
        dst: usize,
        resource: &AnyResource,
        usage: &ResourceUsageEntry,
    ) -> Result<(), CompileError> {
        let dst_family = self.tracks[dst].family;
        let current = resource.state();
        let is_image = resource.is_image();
        let start_layout = if is_image {
            usage.start_layout
        } else {
            vk::ImageLayout::UNDEFINED
        };

        match current.ownership {
            QueueOwnership::Owned(owner) if owner != dst_family => {
                //Full queue-ownership transfer: release on the owning
                //track, split it with a semaphore, acquire on dst.
                #[cfg(feature = "log_reasoning")]
                log::trace!(
                    "Queue transfer: family {} -> {} ({})",
                    owner,
                    dst_family,
                    self.tracks[dst].kind
                );
                if let Some(src) = self.track_for_family(owner) {
                    let release_cb = self.ensure_open(src)?;
                    self.record_transition(
                        release_cb, resource, current, usage.start_stage, usage.start_access,
                        start_layout, owner, dst_family,
                    );
                    let sem = self.slot.semaphores[src].next(self.device)?;
                    self.close(src, Some(sem))?;
                    self.tracks[dst]
                        .pending_waits
                        .push((sem, usage.start_stage));
                }
                let acquire_cb = self.ensure_open(dst)?;
                self.record_transition(
                    acquire_cb, resource, current, usage.start_stage, usage.start_access,
                    start_layout, owner, dst_family,
                );
            }
            _ => {
                //Same queue, or first touch of an unclaimed resource.
                let matches = current.stage == usage.start_stage
                    && current.access == usage.start_access
                    && (!is_image || current.layout == start_layout);
                if matches {
                    #[cfg(feature = "log_reasoning")]
                    log::trace!("State already matches, skipping barrier");
                } else {
                    let cb = self.ensure_open(dst)?;
                    self.record_transition(
                        cb,
                        resource,
                        current,
                        usage.start_stage,
                        usage.start_access,
                        start_layout,
                        vk::QUEUE_FAMILY_IGNORED,
                        vk::QUEUE_FAMILY_IGNORED,
                    );
                }
            }
        }

        //The op leaves the resource in its declared final state; this is
        //the baseline for the next op that touches it.
        *resource.state_lock().write().unwrap() = ResourceState {
            stage: usage.final_stage,
            access: usage.final_access,
            layout: if is_image {
                usage.final_layout
            } else {
                vk::ImageLayout::UNDEFINED
            },
            ownership: QueueOwnership::Owned(dst_family),
        };
        Ok(())
    }

    pub fn compile_op(
        &mut self,
        resolved: ResolvedOp,
        pipelines: &mut PipelineCache,
        globals: &GlobalDescriptors,
    ) -> Result<(), CompileError> {
        let track = resolved.queue.index();
        #[cfg(feature = "logging")]
        log::trace!(
            "Compiling op for pass \"{}\" on {}",
            resolved.pass.name(),
            resolved.queue
        );

        self.ensure_open(track)?;
        for (resource, usage) in resolved.resources.iter().zip(&resolved.usages) {
            self.reconcile(track, resource, usage)?;
        }
        //Reconciliation may have split this track's buffer; reopen.
        let cb = self.ensure_open(track)?;

        match &resolved.pass {
            ResolvedPass::Graphics {
                pass,
                vertex,
                fragment,
            } => {
                let rp = pipelines.render_pass(self.device, &pass.render_layout)?;
                let names: Vec<&str> =
                    resolved.attachment_names.iter().map(String::as_str).collect();
                let fb = pipelines.framebuffer(
                    self.device,
                    &pass.render_layout,
                    &names,
                    &resolved.attachment_views,
                    resolved.extent,
                )?;
                let pipeline = pipelines.graphics_pipeline(
                    self.device,
                    &pass.name,
                    &pass.render_layout,
                    vertex.clone(),
                    fragment.clone(),
                    pass.raster,
                    globals.pipeline_layout,
                )?;
                self.device
                    .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
                self.device.cmd_bind_descriptor_set(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    globals.pipeline_layout,
                    globals.set,
                );
                if let Some(push) = &resolved.op.push_constants {
                    self.device
                        .cmd_push_constants(cb, globals.pipeline_layout, globals.push_stages, push);
                }
                //Render passes are scoped per op, which keeps them clear of
                //any queue split.
                self.device.cmd_begin_render_pass(cb, rp, fb, resolved.extent);
                match resolved.op.command {
                    OpCommand::Draw {
                        vertex_count,
                        instance_count,
                    } => self.device.cmd_draw(cb, vertex_count, instance_count, 0, 0),
                    OpCommand::DrawIndexed {
                        index_count,
                        instance_count,
                    } => self
                        .device
                        .cmd_draw_indexed(cb, index_count, instance_count, 0, 0, 0),
                    _ => return Err(CompileError::CommandKindMismatch(pass.name.clone())),
                }
                self.device.cmd_end_render_pass(cb);
            }
            ResolvedPass::Compute { pass, shader } => {
                let pipeline = pipelines.compute_pipeline(
                    self.device,
                    &pass.name,
                    shader.clone(),
                    globals.pipeline_layout,
                )?;
                self.device
                    .cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
                self.device.cmd_bind_descriptor_set(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    globals.pipeline_layout,
                    globals.set,
                );
                if let Some(push) = &resolved.op.push_constants {
                    self.device
                        .cmd_push_constants(cb, globals.pipeline_layout, globals.push_stages, push);
                }
                match resolved.op.command {
                    OpCommand::Dispatch { groups } => self.device.cmd_dispatch(cb, groups),
                    OpCommand::BuildGeometry {
                        geometry,
                        primitive_count,
                    } => self.device.cmd_build_geometry(cb, geometry, primitive_count),
                    OpCommand::Intersect { geometry, extent } => {
                        self.device.cmd_intersect(cb, geometry, extent)
                    }
                    _ => return Err(CompileError::CommandKindMismatch(pass.name.clone())),
                }
            }
            ResolvedPass::BufferTransfer(pass) => {
                let OpCommand::Transfer { region, .. } = resolved.op.command else {
                    return Err(CompileError::CommandKindMismatch(pass.name.clone()));
                };
                let (BarrierTarget::Buffer(src), BarrierTarget::Buffer(dst)) = (
                    resolved.resources[0].target(),
                    resolved.resources[1].target(),
                ) else {
                    return Err(CompileError::CommandKindMismatch(pass.name.clone()));
                };
                self.device.cmd_copy_buffer(cb, src, dst, region);
            }
            ResolvedPass::ImageTransfer(pass) => {
                let OpCommand::Transfer {
                    direction, extent, ..
                } = resolved.op.command
                else {
                    return Err(CompileError::CommandKindMismatch(pass.name.clone()));
                };
                let (BarrierTarget::Buffer(buffer), BarrierTarget::Image(image)) = (
                    resolved.resources[0].target(),
                    resolved.resources[1].target(),
                ) else {
                    return Err(CompileError::CommandKindMismatch(pass.name.clone()));
                };
                //The image slot's usage carries the copy-time layout.
                let layout = pass.usages[1].start_layout;
                match direction {
                    TransferDirection::Stage => self
                        .device
                        .cmd_copy_buffer_to_image(cb, buffer, image, layout, extent),
                    TransferDirection::Download => self
                        .device
                        .cmd_copy_image_to_buffer(cb, image, layout, buffer, extent),
                    TransferDirection::Unspecified => {
                        return Err(CompileError::UnspecifiedTransferDirection {
                            pass: pass.name.clone(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    ///Closes every open track, wires the present chain and submits the
    /// whole frame in the recorded global order.
    pub fn finish(&mut self, swapchain_image: ImageHandle) -> Result<(), CompileError> {
        //The present chain always needs a graphics producer, even for a
        //frame without graphics ops.
        if self.tracks[0].current.is_none() && self.tracks[0].compiled.is_empty() {
            self.ensure_open(0)?;
        }
        for track in 0..self.tracks.len() {
            self.close(track, None)?;
        }

        //Terminal graphics signal feeding the swapchain transition.
        let final_gfx = self.slot.semaphores[0].next(self.device)?;
        if let Some(last) = self.tracks[0].compiled.last_mut() {
            last.signals.push(final_gfx);
        }
        //The first graphics submission of the frame is the one that may
        //touch the acquired image.
        if let Some(first) = self.tracks[0].compiled.first_mut() {
            first.waits.push((
                self.slot.image_acquire,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ));
        }

        //Swapchain image: color attachment -> presentable.
        let transition = self.device.allocate_command_buffer(QueueKind::Graphics)?;
        self.device.begin_command_buffer(transition)?;
        self.device.cmd_pipeline_barrier(
            transition,
            &[],
            &[ImageBarrier {
                image: swapchain_image,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                dst_access: vk::AccessFlags2::empty(),
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }],
        );
        self.device.end_command_buffer(transition)?;
        self.slot.command_buffers.push(transition);

        //Replay the global order, deferring each queue's last buffer so it
        //can carry the queue's outward-facing fence/semaphore.
        for &(track, index) in &self.order {
            if index + 1 == self.tracks[track].compiled.len() {
                continue;
            }
            let compiled = &self.tracks[track].compiled[index];
            self.device.queue_submit(
                self.tracks[track].kind,
                &[compiled.buffer],
                &compiled.waits,
                &compiled.signals,
                None,
            )?;
        }
        //Auxiliary queues close out with their per-queue fences.
        for track in [1usize, 2] {
            if let Some(last) = self.tracks[track].compiled.last() {
                self.device.queue_submit(
                    self.tracks[track].kind,
                    &[last.buffer],
                    &last.waits,
                    &last.signals,
                    Some(self.slot.fences[track]),
                )?;
                self.slot.fences_used[track] = true;
            }
        }
        if let Some(last) = self.tracks[0].compiled.last() {
            self.device.queue_submit(
                QueueKind::Graphics,
                &[last.buffer],
                &last.waits,
                &last.signals,
                None,
            )?;
        }

        self.device.queue_submit(
            QueueKind::Graphics,
            &[transition],
            &[(
                final_gfx,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            )],
            &[self.slot.frame_finished],
            Some(self.slot.fences[0]),
        )?;
        self.slot.fences_used[0] = true;

        self.device.present(self.slot.frame_finished)?;
        self.slot.in_flight = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft::mock::MockDevice;

    #[test]
    fn semaphore_cache_reuses_after_reset() {
        let device = MockDevice::new();
        let mut cache = SemaphoreCache::new();
        let a = cache.next(&device).unwrap();
        let b = cache.next(&device).unwrap();
        assert_ne!(a, b);

        cache.reset();
        assert_eq!(cache.next(&device).unwrap(), a);
        assert_eq!(cache.next(&device).unwrap(), b);
        //Cursor past the pool grows it instead of failing
        assert_ne!(cache.next(&device).unwrap(), b);
    }

    #[test]
    fn slot_retire_waits_only_used_fences() {
        let device = MockDevice::new();
        let mut slot = FrameSlot::new(&device).unwrap();
        slot.in_flight = true;
        slot.fences_used = [true, false, true];
        slot.retire(&device).unwrap();

        let state = device.state();
        assert_eq!(state.fence_waits.len(), 2);
        assert!(state.fence_waits.contains(&slot.fences[0]));
        assert!(state.fence_waits.contains(&slot.fences[2]));
        assert!(!slot.in_flight);
        assert_eq!(slot.fences_used, [false; 3]);
    }
}
