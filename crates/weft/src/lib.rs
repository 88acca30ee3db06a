//! # Weft
//!
//! The thin surface between a frame-graph compiler and the native graphics API.
//! Weft does not talk to a driver itself. Instead it defines:
//!
//! - opaque [handles](handle) for every GPU object the graph hands around,
//! - plain-data descriptors for [resources](resources) and [pipeline state](pipeline),
//! - the [GpuDevice] trait, which is the whole contract the graph has with
//!   the native layer: object creation, command recording, submission and
//!   presentation.
//!
//! The application supplies the actual device implementation (typically a thin
//! Vulkan wrapper). For tests the crate ships a recording [MockDevice](mock::MockDevice)
//! behind the `mock` feature, which turns every call into an inspectable event.
//!
//! All stage, access, layout and format types are re-used from [ash]'s `vk`
//! module. They are plain bitflags/enums and carry no connection to a loaded
//! driver.

pub mod device;
pub mod handle;
pub mod pipeline;
pub mod resources;

#[cfg(feature = "mock")]
pub mod mock;

pub use ash;

use ash::vk;
use thiserror::Error;

pub use device::{BufferBarrier, DescriptorResource, DescriptorWrite, GpuDevice, ImageBarrier};
pub use pipeline::{
    AttachmentLayout, ComputePipelineDesc, DescriptorBindingDesc, GraphicsPipelineDesc,
    RasterState, RenderLayout, SpecializedShader,
};

///The three submission lanes the graph schedules onto. Maps 1:1 to a hardware
/// queue family via [GpuDevice::queue_family].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    ///Stable index, used to address per-queue tables.
    pub fn index(&self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Compute => 1,
            QueueKind::Transfer => 2,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Graphics => write!(f, "Graphics"),
            QueueKind::Compute => write!(f, "Compute"),
            QueueKind::Transfer => write!(f, "Transfer"),
        }
    }
}

///Errors surfaced by a [GpuDevice] implementation. Everything in here is
/// fatal for the frame that triggered it.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("No queue family for {0} is present on this device")]
    MissingQueue(QueueKind),
    #[error("Failed to allocate descriptor sets from pool")]
    DescriptorAllocation,
    #[error("Object was already built and is locked: {0}")]
    AlreadyBuilt(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DeviceError: Send, Sync);
        assert_impl_all!(QueueKind: Send, Sync);
    }

    #[test]
    fn queue_indices_are_stable() {
        for (idx, kind) in QueueKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), idx);
        }
    }
}
