//! A [GpuDevice] that records instead of rendering. Every command ends up as
//! a [MockCommand] in the per-command-buffer log and every submit as a
//! [MockSubmit], so tests can assert on barrier placement, queue splits and
//! semaphore wiring without a driver.
//!
//! Fence waits return immediately; the mock has no notion of GPU progress.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use ahash::{AHashMap, AHashSet};
use ash::vk;

use crate::{
    device::{BufferBarrier, DescriptorWrite, GpuDevice, ImageBarrier},
    handle::*,
    pipeline::{ComputePipelineDesc, DescriptorBindingDesc, GraphicsPipelineDesc, RenderLayout},
    DeviceError, QueueKind,
};

///One recorded command. Barrier variants keep the full transition data,
/// the rest keeps whatever a test might want to count.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    BufferBarrier(MockBufferBarrier),
    ImageBarrier(MockImageBarrier),
    BeginRenderPass {
        render_pass: RenderPass,
        framebuffer: Framebuffer,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: Pipeline,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        set: DescriptorSet,
    },
    PushConstants {
        size: usize,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        dst: BufferHandle,
    },
    BuildGeometry {
        geometry: u64,
    },
    Intersect {
        geometry: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockBufferBarrier {
    pub buffer: BufferHandle,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockImageBarrier {
    pub image: ImageHandle,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Debug, Clone)]
pub struct MockSubmit {
    pub queue: QueueKind,
    pub buffers: Vec<CommandBuffer>,
    pub waits: Vec<(Semaphore, vk::PipelineStageFlags2)>,
    pub signals: Vec<Semaphore>,
    pub fence: Option<Fence>,
}

///Everything the mock has seen so far. Lives behind [MockDevice::state].
#[derive(Default)]
pub struct MockState {
    ///Recorded commands, keyed by command buffer.
    pub commands: AHashMap<CommandBuffer, Vec<MockCommand>>,
    ///Buffers currently between begin and end.
    pub open: AHashSet<CommandBuffer>,
    ///Buffers that went through begin+end.
    pub ended: AHashSet<CommandBuffer>,
    pub freed: Vec<CommandBuffer>,
    pub submits: Vec<MockSubmit>,
    pub fence_waits: Vec<Fence>,
    pub acquires: Vec<Semaphore>,
    pub presents: Vec<Semaphore>,
    pub render_passes_created: u32,
    pub framebuffers_created: u32,
    pub pipelines_created: u32,
}

pub struct MockDevice {
    next_handle: AtomicU64,
    swapchain_image: ImageHandle,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new()
    }
}

impl MockDevice {
    ///Queue families the mock reports, one distinct family per lane.
    pub const FAMILIES: [u32; 3] = [0, 1, 2];

    pub fn new() -> Self {
        MockDevice {
            //0 is reserved so no handle is ever NULL
            next_handle: AtomicU64::new(2),
            swapchain_image: ImageHandle(1),
            state: Mutex::new(MockState::default()),
        }
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    ///The image handle [GpuDevice::acquire_next_image] hands out.
    pub fn swapchain_image(&self) -> ImageHandle {
        self.swapchain_image
    }

    fn record(&self, cb: CommandBuffer, cmd: MockCommand) {
        let mut state = self.state.lock().unwrap();
        assert!(state.open.contains(&cb), "recorded into a closed command buffer");
        state.commands.get_mut(&cb).unwrap().push(cmd);
    }

    ///All commands of `cb`, empty if nothing was recorded.
    pub fn commands_of(&self, cb: CommandBuffer) -> Vec<MockCommand> {
        self.state
            .lock()
            .unwrap()
            .commands
            .get(&cb)
            .cloned()
            .unwrap_or_default()
    }
}

impl GpuDevice for MockDevice {
    fn queue_family(&self, queue: QueueKind) -> u32 {
        Self::FAMILIES[queue.index()]
    }

    fn create_semaphore(&self) -> Result<Semaphore, DeviceError> {
        Ok(Semaphore(self.next()))
    }

    fn create_fence(&self) -> Result<Fence, DeviceError> {
        Ok(Fence(self.next()))
    }

    fn wait_fence(&self, fence: Fence, _timeout: u64) -> Result<(), DeviceError> {
        self.state.lock().unwrap().fence_waits.push(fence);
        Ok(())
    }

    fn reset_fence(&self, _fence: Fence) -> Result<(), DeviceError> {
        Ok(())
    }

    fn allocate_command_buffer(&self, _queue: QueueKind) -> Result<CommandBuffer, DeviceError> {
        let cb = CommandBuffer(self.next());
        self.state.lock().unwrap().commands.insert(cb, Vec::new());
        Ok(cb)
    }

    fn begin_command_buffer(&self, cb: CommandBuffer) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        assert!(state.open.insert(cb), "begin on an already recording buffer");
        Ok(())
    }

    fn end_command_buffer(&self, cb: CommandBuffer) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        assert!(state.open.remove(&cb), "end on a buffer that was not recording");
        state.ended.insert(cb);
        Ok(())
    }

    fn free_command_buffer(&self, cb: CommandBuffer) {
        let mut state = self.state.lock().unwrap();
        state.commands.remove(&cb);
        state.ended.remove(&cb);
        state.freed.push(cb);
    }

    fn cmd_pipeline_barrier(
        &self,
        cb: CommandBuffer,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        for b in buffers {
            self.record(
                cb,
                MockCommand::BufferBarrier(MockBufferBarrier {
                    buffer: b.buffer,
                    src_stage: b.src_stage,
                    src_access: b.src_access,
                    dst_stage: b.dst_stage,
                    dst_access: b.dst_access,
                    src_family: b.src_family,
                    dst_family: b.dst_family,
                }),
            );
        }
        for i in images {
            self.record(
                cb,
                MockCommand::ImageBarrier(MockImageBarrier {
                    image: i.image,
                    src_stage: i.src_stage,
                    src_access: i.src_access,
                    dst_stage: i.dst_stage,
                    dst_access: i.dst_access,
                    old_layout: i.old_layout,
                    new_layout: i.new_layout,
                    src_family: i.src_family,
                    dst_family: i.dst_family,
                }),
            );
        }
    }

    fn cmd_begin_render_pass(
        &self,
        cb: CommandBuffer,
        render_pass: RenderPass,
        framebuffer: Framebuffer,
        _area: vk::Extent2D,
    ) {
        self.record(
            cb,
            MockCommand::BeginRenderPass {
                render_pass,
                framebuffer,
            },
        );
    }

    fn cmd_end_render_pass(&self, cb: CommandBuffer) {
        self.record(cb, MockCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        cb: CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: Pipeline,
    ) {
        self.record(
            cb,
            MockCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        _layout: PipelineLayout,
        set: DescriptorSet,
    ) {
        self.record(cb, MockCommand::BindDescriptorSet { bind_point, set });
    }

    fn cmd_push_constants(
        &self,
        cb: CommandBuffer,
        _layout: PipelineLayout,
        _stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.record(cb, MockCommand::PushConstants { size: data.len() });
    }

    fn cmd_draw(
        &self,
        cb: CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(
            cb,
            MockCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cb: CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            cb,
            MockCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cb: CommandBuffer, groups: [u32; 3]) {
        self.record(cb, MockCommand::Dispatch { groups });
    }

    fn cmd_copy_buffer(
        &self,
        cb: CommandBuffer,
        src: BufferHandle,
        dst: BufferHandle,
        region: vk::BufferCopy,
    ) {
        self.record(
            cb,
            MockCommand::CopyBuffer {
                src,
                dst,
                size: region.size,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBuffer,
        src: BufferHandle,
        dst: ImageHandle,
        _dst_layout: vk::ImageLayout,
        _extent: vk::Extent3D,
    ) {
        self.record(cb, MockCommand::CopyBufferToImage { src, dst });
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: CommandBuffer,
        src: ImageHandle,
        _src_layout: vk::ImageLayout,
        dst: BufferHandle,
        _extent: vk::Extent3D,
    ) {
        self.record(cb, MockCommand::CopyImageToBuffer { src, dst });
    }

    fn cmd_build_geometry(&self, cb: CommandBuffer, geometry: u64, _primitive_count: u32) {
        self.record(cb, MockCommand::BuildGeometry { geometry });
    }

    fn cmd_intersect(&self, cb: CommandBuffer, geometry: u64, _extent: [u32; 3]) {
        self.record(cb, MockCommand::Intersect { geometry });
    }

    fn create_render_pass(&self, _layout: &RenderLayout) -> Result<RenderPass, DeviceError> {
        self.state.lock().unwrap().render_passes_created += 1;
        Ok(RenderPass(self.next()))
    }

    fn create_framebuffer(
        &self,
        _render_pass: RenderPass,
        _attachments: &[ImageViewHandle],
        _extent: vk::Extent2D,
    ) -> Result<Framebuffer, DeviceError> {
        self.state.lock().unwrap().framebuffers_created += 1;
        Ok(Framebuffer(self.next()))
    }

    fn create_descriptor_layout(
        &self,
        _bindings: &[DescriptorBindingDesc],
    ) -> Result<DescriptorSetLayout, DeviceError> {
        Ok(DescriptorSetLayout(self.next()))
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[(vk::DescriptorType, u32)],
        _max_sets: u32,
    ) -> Result<DescriptorPool, DeviceError> {
        Ok(DescriptorPool(self.next()))
    }

    fn allocate_descriptor_set(
        &self,
        _pool: DescriptorPool,
        _layout: DescriptorSetLayout,
    ) -> Result<DescriptorSet, DeviceError> {
        Ok(DescriptorSet(self.next()))
    }

    fn update_descriptor_set(&self, _set: DescriptorSet, _writes: &[DescriptorWrite]) {}

    fn create_pipeline_layout(
        &self,
        _set_layout: DescriptorSetLayout,
        _push_constant_size: u32,
    ) -> Result<PipelineLayout, DeviceError> {
        Ok(PipelineLayout(self.next()))
    }

    fn create_graphics_pipeline(
        &self,
        _desc: &GraphicsPipelineDesc,
    ) -> Result<Pipeline, DeviceError> {
        self.state.lock().unwrap().pipelines_created += 1;
        Ok(Pipeline(self.next()))
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
    ) -> Result<Pipeline, DeviceError> {
        self.state.lock().unwrap().pipelines_created += 1;
        Ok(Pipeline(self.next()))
    }

    fn queue_submit(
        &self,
        queue: QueueKind,
        buffers: &[CommandBuffer],
        waits: &[(Semaphore, vk::PipelineStageFlags2)],
        signals: &[Semaphore],
        fence: Option<Fence>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        for cb in buffers {
            assert!(
                state.ended.contains(cb),
                "submitted a command buffer that was never ended"
            );
        }
        state.submits.push(MockSubmit {
            queue,
            buffers: buffers.to_vec(),
            waits: waits.to_vec(),
            signals: signals.to_vec(),
            fence,
        });
        Ok(())
    }

    fn acquire_next_image(&self, signal: Semaphore) -> Result<ImageHandle, DeviceError> {
        self.state.lock().unwrap().acquires.push(signal);
        Ok(self.swapchain_image)
    }

    fn present(&self, wait: Semaphore) -> Result<(), DeviceError> {
        self.state.lock().unwrap().presents.push(wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_commands_in_order() {
        let dev = MockDevice::new();
        let cb = dev.allocate_command_buffer(QueueKind::Graphics).unwrap();
        dev.begin_command_buffer(cb).unwrap();
        dev.cmd_dispatch(cb, [1, 2, 3]);
        dev.cmd_end_render_pass(cb);
        dev.end_command_buffer(cb).unwrap();

        assert_eq!(
            dev.commands_of(cb),
            vec![
                MockCommand::Dispatch { groups: [1, 2, 3] },
                MockCommand::EndRenderPass
            ]
        );
    }

    #[test]
    #[should_panic]
    fn submit_of_open_buffer_panics() {
        let dev = MockDevice::new();
        let cb = dev.allocate_command_buffer(QueueKind::Compute).unwrap();
        dev.begin_command_buffer(cb).unwrap();
        dev.queue_submit(QueueKind::Compute, &[cb], &[], &[], None)
            .unwrap();
    }
}
