//! # Weft-graph
//!
//! Frame-graph compiler and executor on top of the [weft] device surface.
//!
//! The application registers resources, shaders and pass descriptions with a
//! [FrameGraph](graph::FrameGraph), queues [GpuOp](op::GpuOp)s for a frame,
//! and calls [build](graph::FrameGraph::build). The graph then does the
//! actual work of explicit-API rendering:
//!
//! - tracks the GPU-side state of every resource (pipeline stage, access
//!   mask, image layout, owning queue family) across frames,
//! - derives the minimal set of pipeline barriers that reconciles the
//!   tracked state with what each op declares it needs,
//! - moves resources between queue families with release/acquire barrier
//!   pairs, splitting command buffers and wiring semaphores so submissions
//!   on different queues stay ordered,
//! - caches render passes, framebuffers and pipelines by structural
//!   identity,
//! - submits everything in recording order and presents the swapchain
//!   image.
//!
//! Ops are compiled strictly in the order they were queued; the graph never
//! reorders work. All decisions can be traced with the `logging` and
//! `log_reasoning` features.

mod compiler;
pub mod descriptors;
pub mod graph;
pub mod op;
pub mod pass;
mod pipelines;
pub mod state;

use ash::vk;
use thiserror::Error;
use weft::DeviceError;

pub use descriptors::GlobalDescriptors;
pub use weft::QueueKind;
pub use graph::FrameGraph;
pub use op::{GpuOp, OpCommand, TransferDirection};
pub use pass::{
    BufferTransferPass, ComputePass, DescriptorBinding, GraphicsPass, ImageTransferPass,
    ResourceUsageEntry,
};
pub use state::{QueueOwnership, ResourceState, TrackedBuffer, TrackedBufferView, TrackedImage};

///Errors raised while gathering descriptors or compiling a frame. Every
/// variant aborts the frame that triggered it; the graph has no partial
/// recovery.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("No resource named \"{0}\" is registered")]
    UnknownResource(String),
    #[error("No pass named \"{0}\" is registered")]
    UnknownPass(String),
    #[error("No shader named \"{0}\" is registered")]
    UnknownShader(String),
    #[error("Pass \"{pass}\" declares {expected} color attachments, but the op supplied {got}")]
    AttachmentMismatch {
        pass: String,
        expected: usize,
        got: usize,
    },
    #[error("Pass \"{pass}\" depth attachment mismatch: declared={declared}, supplied={supplied}")]
    DepthAttachmentMismatch {
        pass: String,
        declared: bool,
        supplied: bool,
    },
    #[error("Pass \"{pass}\" declares {expected} resource usages, but the op supplied {got} resources")]
    UsageCountMismatch {
        pass: String,
        expected: usize,
        got: usize,
    },
    #[error("Descriptor type {0:?} is not supported by the global descriptor set")]
    UnsupportedDescriptorType(vk::DescriptorType),
    #[error("Descriptor binding {0} is declared with conflicting types")]
    DescriptorBindingConflict(u32),
    #[error("Combined-image-sampler binding {0} names no sampler")]
    MissingSampler(u32),
    #[error("Transfer op for pass \"{pass}\" has no direction set")]
    UnspecifiedTransferDirection { pass: String },
    #[error("Requested a framebuffer for a render layout that was never built")]
    UnbuiltRenderPass,
    #[error("build() was called before gather_descriptors()")]
    DescriptorsNotGathered,
    #[error("Op command does not match the kind of pass \"{0}\"")]
    CommandKindMismatch(String),
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(CompileError: Send, Sync);
    }
}
