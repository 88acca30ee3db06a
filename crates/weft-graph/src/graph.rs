//! The [FrameGraph]: the context object an application talks to. It owns
//! the name registries, the op queue, the pipeline caches and a small ring
//! of in-flight frames. Registration and op queueing are safe from many
//! threads; [build](FrameGraph::build) is the exclusive, blocking compile
//! step that turns one frame's ops into submissions.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use ahash::AHashMap;
use ash::vk;
use weft::{
    handle::{BufferHandle, BufferViewHandle, ImageViewHandle, SamplerHandle},
    resources::{Buffer, BufferView, ImageView, Sampler},
    GpuDevice, QueueKind, SpecializedShader,
};

use crate::{
    compiler::{FrameCompiler, FrameSlot, ResolvedOp, ResolvedPass},
    descriptors::{self, GlobalDescriptors, ResourceLookup},
    op::{GpuOp, OpQueue},
    pass::{BufferTransferPass, ComputePass, GraphicsPass, ImageTransferPass, ResourceUsageEntry},
    pipelines::PipelineCache,
    state::{AnyResource, ResourceState, TrackedBuffer, TrackedBufferView, TrackedImage},
    CompileError,
};

///Bounded frames in flight. Slot N is recycled when frame N+2 starts.
const FRAMES_IN_FLIGHT: usize = 2;

type Registry<T> = RwLock<AHashMap<String, T>>;

///Mutable compile-side state, all behind the build lock.
struct ExecState {
    pipelines: PipelineCache,
    globals: Option<GlobalDescriptors>,
    frames: Vec<FrameSlot>,
    frame_index: usize,
}

pub struct FrameGraph<D: GpuDevice> {
    device: Arc<D>,

    buffers: Registry<Arc<TrackedBuffer>>,
    buffer_views: Registry<Arc<TrackedBufferView>>,
    image_views: Registry<Arc<TrackedImage>>,
    samplers: Registry<Arc<Sampler>>,
    shaders: Registry<SpecializedShader>,

    graphics_passes: Registry<Arc<GraphicsPass>>,
    compute_passes: Registry<Arc<ComputePass>>,
    buffer_transfer_passes: Registry<Arc<BufferTransferPass>>,
    image_transfer_passes: Registry<Arc<ImageTransferPass>>,

    ops: OpQueue,
    exec: Mutex<ExecState>,
}

impl<D: GpuDevice> FrameGraph<D> {
    pub fn new(device: Arc<D>) -> Result<Self, CompileError> {
        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            frames.push(FrameSlot::new(&*device)?);
        }
        Ok(FrameGraph {
            device,
            buffers: RwLock::default(),
            buffer_views: RwLock::default(),
            image_views: RwLock::default(),
            samplers: RwLock::default(),
            shaders: RwLock::default(),
            graphics_passes: RwLock::default(),
            compute_passes: RwLock::default(),
            buffer_transfer_passes: RwLock::default(),
            image_transfer_passes: RwLock::default(),
            ops: OpQueue::new(),
            exec: Mutex::new(ExecState {
                pipelines: PipelineCache::default(),
                globals: None,
                frames,
                frame_index: 0,
            }),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    //----- registration (idempotent upserts, last writer wins)

    pub fn register_buffer(&self, name: impl Into<String>, buffer: Buffer) {
        self.buffers
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(TrackedBuffer::new(buffer)));
    }

    ///Registers a buffer whose GPU state is already known, e.g. one the
    /// application filled outside the graph.
    pub fn register_buffer_with_state(
        &self,
        name: impl Into<String>,
        buffer: Buffer,
        state: ResourceState,
    ) {
        self.buffers
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(TrackedBuffer::with_state(buffer, state)));
    }

    pub fn register_buffer_view(&self, name: impl Into<String>, view: BufferView) {
        self.buffer_views
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(TrackedBufferView::new(view)));
    }

    pub fn register_buffer_view_with_state(
        &self,
        name: impl Into<String>,
        view: BufferView,
        state: ResourceState,
    ) {
        self.buffer_views.write().unwrap().insert(
            name.into(),
            Arc::new(TrackedBufferView::with_state(view, state)),
        );
    }

    pub fn register_image(&self, name: impl Into<String>, view: ImageView) {
        self.image_views
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(TrackedImage::new(view)));
    }

    pub fn register_image_with_state(
        &self,
        name: impl Into<String>,
        view: ImageView,
        state: ResourceState,
    ) {
        self.image_views
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(TrackedImage::with_state(view, state)));
    }

    pub fn register_sampler(&self, name: impl Into<String>, sampler: Sampler) {
        self.samplers
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(sampler));
    }

    pub fn register_shader(&self, name: impl Into<String>, shader: SpecializedShader) {
        self.shaders.write().unwrap().insert(name.into(), shader);
    }

    pub fn register_graphics_pass(&self, pass: GraphicsPass) {
        self.graphics_passes
            .write()
            .unwrap()
            .insert(pass.name.clone(), Arc::new(pass));
    }

    pub fn register_compute_pass(&self, pass: ComputePass) {
        self.compute_passes
            .write()
            .unwrap()
            .insert(pass.name.clone(), Arc::new(pass));
    }

    pub fn register_buffer_transfer_pass(&self, pass: BufferTransferPass) {
        self.buffer_transfer_passes
            .write()
            .unwrap()
            .insert(pass.name.clone(), Arc::new(pass));
    }

    pub fn register_image_transfer_pass(&self, pass: ImageTransferPass) {
        self.image_transfer_passes
            .write()
            .unwrap()
            .insert(pass.name.clone(), Arc::new(pass));
    }

    //----- per-frame interface

    ///Appends ops for the current frame. May be called many times from
    /// many threads before [build](Self::build).
    pub fn queue_ops<I: IntoIterator<Item = GpuOp>>(&self, ops: I) {
        self.ops.push(ops);
    }

    ///Merges the descriptor requirements of every registered graphics and
    /// compute pass into one global set. Must run before the first
    /// [build](Self::build) and again after pass registration changes.
    pub fn gather_descriptors(&self) -> Result<(), CompileError> {
        let mut exec = self.exec.lock().unwrap();

        let graphics = self.graphics_passes.read().unwrap();
        let compute = self.compute_passes.read().unwrap();

        let mut bindings = Vec::new();
        let mut push_size = 0u32;
        let mut push_stages = vk::ShaderStageFlags::empty();
        for pass in graphics.values() {
            bindings.extend(pass.bindings.iter().cloned());
            if pass.push_constant_size > 0 {
                push_size = push_size.max(pass.push_constant_size);
                push_stages |= vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
            }
        }
        for pass in compute.values() {
            bindings.extend(pass.bindings.iter().cloned());
            if pass.push_constant_size > 0 {
                push_size = push_size.max(pass.push_constant_size);
                push_stages |= vk::ShaderStageFlags::COMPUTE;
            }
        }
        drop(graphics);
        drop(compute);

        let view = self.view();
        exec.globals = Some(descriptors::gather(
            &*self.device,
            &bindings,
            push_size,
            push_stages,
            &view,
        )?);
        Ok(())
    }

    ///Compiles and submits one frame's worth of queued ops, then presents.
    /// Blocking and exclusive: a second concurrent call waits for the
    /// first to finish.
    pub fn build(&self) -> Result<(), CompileError> {
        let mut exec = self.exec.lock().unwrap();
        let ExecState {
            pipelines,
            globals,
            frames,
            frame_index,
        } = &mut *exec;
        let Some(globals) = globals.as_ref() else {
            return Err(CompileError::DescriptorsNotGathered);
        };

        let slot = &mut frames[*frame_index % FRAMES_IN_FLIGHT];
        *frame_index = frame_index.wrapping_add(1);
        slot.retire(&*self.device)?;

        let swapchain_image = self.device.acquire_next_image(slot.image_acquire)?;

        //Resolve and validate every op up front so configuration errors
        //surface before anything is recorded.
        let ops = self.ops.drain();
        let resolved = {
            let view = self.view();
            ops.into_iter()
                .map(|op| self.resolve_op(op, &view))
                .collect::<Result<Vec<_>, _>>()?
        };

        #[cfg(feature = "logging")]
        log::trace!("Compiling frame with {} ops", resolved.len());

        let mut compiler = FrameCompiler::new(&*self.device, slot);
        for op in resolved {
            compiler.compile_op(op, pipelines, globals)?;
        }
        compiler.finish(swapchain_image)
    }

    ///Tracked state of a registered resource, mainly for inspection and
    /// handing pre-initialized resources between graphs.
    pub fn resource_state(&self, name: &str) -> Option<ResourceState> {
        if let Some(buffer) = self.buffers.read().unwrap().get(name) {
            return Some(buffer.state());
        }
        if let Some(view) = self.buffer_views.read().unwrap().get(name) {
            return Some(view.state());
        }
        self.image_views
            .read()
            .unwrap()
            .get(name)
            .map(|image| image.state())
    }

    fn view(&self) -> RegistryView<'_> {
        RegistryView {
            buffers: self.buffers.read().unwrap(),
            buffer_views: self.buffer_views.read().unwrap(),
            image_views: self.image_views.read().unwrap(),
            samplers: self.samplers.read().unwrap(),
        }
    }

    fn resolve_op(&self, op: GpuOp, view: &RegistryView<'_>) -> Result<ResolvedOp, CompileError> {
        let (pass, queue) = self.classify(&op.pass)?;
        #[cfg(feature = "log_reasoning")]
        log::trace!("Pass \"{}\" assigned to {}", op.pass, queue);

        let usages = pass.usages();
        if usages.len() != op.resources.len() {
            return Err(CompileError::UsageCountMismatch {
                pass: op.pass.clone(),
                expected: usages.len(),
                got: op.resources.len(),
            });
        }

        let mut attachment_views = Vec::new();
        let mut attachment_names = Vec::new();
        let mut extent = vk::Extent2D::default();
        //Attachments the op did not also list explicitly still take part
        //in reconciliation, with the usage their render-layout slot
        //implies.
        let mut implied = Vec::new();
        match &pass {
            ResolvedPass::Graphics { pass: gp, .. } => {
                if op.color_attachments.len() != gp.render_layout.color.len() {
                    return Err(CompileError::AttachmentMismatch {
                        pass: op.pass.clone(),
                        expected: gp.render_layout.color.len(),
                        got: op.color_attachments.len(),
                    });
                }
                if gp.render_layout.depth.is_some() != op.depth_attachment.is_some() {
                    return Err(CompileError::DepthAttachmentMismatch {
                        pass: op.pass.clone(),
                        declared: gp.render_layout.depth.is_some(),
                        supplied: op.depth_attachment.is_some(),
                    });
                }
                let slots = op
                    .color_attachments
                    .iter()
                    .zip(&gp.render_layout.color)
                    .map(|(name, slot)| (name, ResourceUsageEntry::color_attachment(slot)))
                    .chain(
                        op.depth_attachment
                            .iter()
                            .zip(&gp.render_layout.depth)
                            .map(|(name, slot)| (name, ResourceUsageEntry::depth_attachment(slot))),
                    );
                for (name, slot_usage) in slots {
                    let image = view
                        .image_views
                        .get(name)
                        .ok_or_else(|| CompileError::UnknownResource(name.clone()))?;
                    attachment_views.push(image.view.inner);
                    attachment_names.push(name.clone());
                    extent = image.view.extent;
                    if !op.resources.contains(name) {
                        #[cfg(feature = "log_reasoning")]
                        log::trace!(
                            "Attachment \"{}\" not listed explicitly, reconciling with its slot usage",
                            name
                        );
                        implied.push((AnyResource::Image(image.clone()), slot_usage));
                    }
                }
                if attachment_views.is_empty() {
                    extent = gp.raster.viewport;
                }
            }
            ResolvedPass::BufferTransfer(_) | ResolvedPass::ImageTransfer(_) => {
                //Slot 0 is the source/staging side, slot 1 the target.
                if op.resources.len() != 2 {
                    return Err(CompileError::UsageCountMismatch {
                        pass: op.pass.clone(),
                        expected: 2,
                        got: op.resources.len(),
                    });
                }
            }
            ResolvedPass::Compute { .. } => {}
        }

        let mut resources = op
            .resources
            .iter()
            .map(|name| view.any_resource(name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut op_usages = usages.to_vec();
        for (resource, usage) in implied {
            resources.push(resource);
            op_usages.push(usage);
        }

        Ok(ResolvedOp {
            op,
            pass,
            queue,
            resources,
            usages: op_usages,
            attachment_views,
            attachment_names,
            extent,
        })
    }

    ///Queue assignment by pass-registry membership. Non-async compute
    /// folds into the graphics stream so it never pays cross-queue sync.
    fn classify(&self, name: &str) -> Result<(ResolvedPass, QueueKind), CompileError> {
        if let Some(pass) = self.graphics_passes.read().unwrap().get(name) {
            let vertex = self.shader(&pass.vertex_shader)?;
            let fragment = self.shader(&pass.fragment_shader)?;
            return Ok((
                ResolvedPass::Graphics {
                    pass: pass.clone(),
                    vertex,
                    fragment,
                },
                QueueKind::Graphics,
            ));
        }
        if let Some(pass) = self.compute_passes.read().unwrap().get(name) {
            let queue = if pass.is_async {
                QueueKind::Compute
            } else {
                QueueKind::Graphics
            };
            let shader = self.shader(&pass.shader)?;
            return Ok((
                ResolvedPass::Compute {
                    pass: pass.clone(),
                    shader,
                },
                queue,
            ));
        }
        if let Some(pass) = self.buffer_transfer_passes.read().unwrap().get(name) {
            return Ok((ResolvedPass::BufferTransfer(pass.clone()), QueueKind::Transfer));
        }
        if let Some(pass) = self.image_transfer_passes.read().unwrap().get(name) {
            return Ok((ResolvedPass::ImageTransfer(pass.clone()), QueueKind::Transfer));
        }
        Err(CompileError::UnknownPass(name.to_string()))
    }

    fn shader(&self, name: &str) -> Result<SpecializedShader, CompileError> {
        self.shaders
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownShader(name.to_string()))
    }
}

impl<D: GpuDevice> Drop for FrameGraph<D> {
    ///Waits for every in-flight frame before the graph's resources go
    /// away.
    fn drop(&mut self) {
        if let Ok(mut exec) = self.exec.lock() {
            for slot in &mut exec.frames {
                let _ = slot.retire(&*self.device);
            }
        }
    }
}

///Read-locked snapshot of the resource registries.
struct RegistryView<'a> {
    buffers: RwLockReadGuard<'a, AHashMap<String, Arc<TrackedBuffer>>>,
    buffer_views: RwLockReadGuard<'a, AHashMap<String, Arc<TrackedBufferView>>>,
    image_views: RwLockReadGuard<'a, AHashMap<String, Arc<TrackedImage>>>,
    samplers: RwLockReadGuard<'a, AHashMap<String, Arc<Sampler>>>,
}

impl RegistryView<'_> {
    ///Resolves a name against buffers, then buffer views, then images.
    fn any_resource(&self, name: &str) -> Result<AnyResource, CompileError> {
        if let Some(buffer) = self.buffers.get(name) {
            return Ok(AnyResource::Buffer(buffer.clone()));
        }
        if let Some(view) = self.buffer_views.get(name) {
            return Ok(AnyResource::BufferView(view.clone()));
        }
        if let Some(image) = self.image_views.get(name) {
            return Ok(AnyResource::Image(image.clone()));
        }
        Err(CompileError::UnknownResource(name.to_string()))
    }
}

impl ResourceLookup for RegistryView<'_> {
    fn buffer(&self, name: &str) -> Option<BufferHandle> {
        self.buffers.get(name).map(|buffer| buffer.buffer.inner)
    }

    fn buffer_view(&self, name: &str) -> Option<BufferViewHandle> {
        self.buffer_views.get(name).map(|view| view.view.inner)
    }

    fn image_view(&self, name: &str) -> Option<ImageViewHandle> {
        self.image_views.get(name).map(|image| image.view.inner)
    }

    fn sampler(&self, name: &str) -> Option<SamplerHandle> {
        self.samplers.get(name).map(|sampler| sampler.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use weft::mock::MockDevice;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(FrameGraph<MockDevice>: Send, Sync);
    }
}
