//! The [GpuDevice] trait: everything the frame-graph compiler is allowed to
//! ask of the native layer. The trait is deliberately flat — one method per
//! native call — so an implementation stays a thin dispatch layer and the
//! mock can record calls one to one.

use ash::vk;

use crate::{
    handle::{
        BufferHandle, CommandBuffer, DescriptorPool, DescriptorSet, DescriptorSetLayout, Fence,
        Framebuffer, ImageHandle, ImageViewHandle, Pipeline, PipelineLayout, RenderPass, Semaphore,
        SamplerHandle, BufferViewHandle,
    },
    pipeline::{ComputePipelineDesc, DescriptorBindingDesc, GraphicsPipelineDesc, RenderLayout},
    DeviceError, QueueKind,
};

///Memory/execution dependency on a buffer range. `src_family`/`dst_family`
/// are [vk::QUEUE_FAMILY_IGNORED] unless the barrier is one half of a
/// queue-ownership transfer.
#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_family: u32,
    pub dst_family: u32,
}

///Memory/execution dependency on a whole image, optionally transitioning
/// its layout and/or queue ownership.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
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

///What a descriptor-set write points at.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResource {
    Buffer(BufferHandle),
    BufferView(BufferViewHandle),
    Image {
        view: ImageViewHandle,
        layout: vk::ImageLayout,
    },
    CombinedImageSampler {
        view: ImageViewHandle,
        sampler: SamplerHandle,
        layout: vk::ImageLayout,
    },
    Sampler(SamplerHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub resource: DescriptorResource,
}

///Contract between the graph and the native graphics API.
///
/// Implementations must be callable from the single thread that holds the
/// graph's build lock, while object creation may also be hit from
/// registration paths; hence `Send + Sync`.
pub trait GpuDevice: Send + Sync + 'static {
    ///Queue-family index backing `queue`. Families may alias on hardware
    /// that exposes fewer queues; the graph only compares these values.
    fn queue_family(&self, queue: QueueKind) -> u32;

    //----- sync primitives

    fn create_semaphore(&self) -> Result<Semaphore, DeviceError>;
    fn create_fence(&self) -> Result<Fence, DeviceError>;
    ///Blocks until `fence` is signaled or `timeout` (nanoseconds) elapsed.
    fn wait_fence(&self, fence: Fence, timeout: u64) -> Result<(), DeviceError>;
    fn reset_fence(&self, fence: Fence) -> Result<(), DeviceError>;

    //----- command buffer lifecycle

    fn allocate_command_buffer(&self, queue: QueueKind) -> Result<CommandBuffer, DeviceError>;
    fn begin_command_buffer(&self, cb: CommandBuffer) -> Result<(), DeviceError>;
    fn end_command_buffer(&self, cb: CommandBuffer) -> Result<(), DeviceError>;
    fn free_command_buffer(&self, cb: CommandBuffer);

    //----- recording

    fn cmd_pipeline_barrier(
        &self,
        cb: CommandBuffer,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    );
    fn cmd_begin_render_pass(
        &self,
        cb: CommandBuffer,
        render_pass: RenderPass,
        framebuffer: Framebuffer,
        area: vk::Extent2D,
    );
    fn cmd_end_render_pass(&self, cb: CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cb: CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cb: CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayout,
        set: DescriptorSet,
    );
    fn cmd_push_constants(
        &self,
        cb: CommandBuffer,
        layout: PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );
    fn cmd_draw(
        &self,
        cb: CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cb: CommandBuffer, groups: [u32; 3]);
    fn cmd_copy_buffer(
        &self,
        cb: CommandBuffer,
        src: BufferHandle,
        dst: BufferHandle,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBuffer,
        src: BufferHandle,
        dst: ImageHandle,
        dst_layout: vk::ImageLayout,
        extent: vk::Extent3D,
    );
    fn cmd_copy_image_to_buffer(
        &self,
        cb: CommandBuffer,
        src: ImageHandle,
        src_layout: vk::ImageLayout,
        dst: BufferHandle,
        extent: vk::Extent3D,
    );
    ///Builds ray-tracing geometry identified by an application-side handle.
    fn cmd_build_geometry(&self, cb: CommandBuffer, geometry: u64, primitive_count: u32);
    ///Dispatches an intersection/trace over `extent` against `geometry`.
    fn cmd_intersect(&self, cb: CommandBuffer, geometry: u64, extent: [u32; 3]);

    //----- pipeline objects

    fn create_render_pass(&self, layout: &RenderLayout) -> Result<RenderPass, DeviceError>;
    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageViewHandle],
        extent: vk::Extent2D,
    ) -> Result<Framebuffer, DeviceError>;
    fn create_descriptor_layout(
        &self,
        bindings: &[DescriptorBindingDesc],
    ) -> Result<DescriptorSetLayout, DeviceError>;
    fn create_descriptor_pool(
        &self,
        sizes: &[(vk::DescriptorType, u32)],
        max_sets: u32,
    ) -> Result<DescriptorPool, DeviceError>;
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPool,
        layout: DescriptorSetLayout,
    ) -> Result<DescriptorSet, DeviceError>;
    fn update_descriptor_set(&self, set: DescriptorSet, writes: &[DescriptorWrite]);
    fn create_pipeline_layout(
        &self,
        set_layout: DescriptorSetLayout,
        push_constant_size: u32,
    ) -> Result<PipelineLayout, DeviceError>;
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Pipeline, DeviceError>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc)
        -> Result<Pipeline, DeviceError>;

    //----- submission & presentation

    fn queue_submit(
        &self,
        queue: QueueKind,
        buffers: &[CommandBuffer],
        waits: &[(Semaphore, vk::PipelineStageFlags2)],
        signals: &[Semaphore],
        fence: Option<Fence>,
    ) -> Result<(), DeviceError>;
    ///Acquires the next swapchain image, signaling `signal` once it is
    /// usable. Returns the handle of the image's backing storage.
    fn acquire_next_image(&self, signal: Semaphore) -> Result<ImageHandle, DeviceError>;
    ///Presents the image acquired last, after `wait` has been signaled.
    fn present(&self, wait: Semaphore) -> Result<(), DeviceError>;
}
