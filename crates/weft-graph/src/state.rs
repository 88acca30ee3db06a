//! Per-resource GPU state tracking. Every registered buffer, buffer view and
//! image carries a [ResourceState] behind a `RwLock`; the compiler compares
//! it against what an op declares, emits the barrier that reconciles the
//! two, and writes the op's final state back. State therefore persists
//! across frames, which is what makes minimal barrier derivation possible.

use std::sync::{Arc, RwLock};

use ash::vk;
use weft::{
    handle::{BufferHandle, ImageHandle},
    resources::{Buffer, BufferView, ImageView},
};

///Which queue family owns a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOwnership {
    ///Registration sentinel: no queue has touched the resource yet. The
    /// first op claims it without a transfer.
    Ignored,
    ///Owned by the given queue family.
    Owned(u32),
}

impl QueueOwnership {
    ///The owning family, or `None` while still unclaimed.
    pub fn family(&self) -> Option<u32> {
        match self {
            QueueOwnership::Ignored => None,
            QueueOwnership::Owned(f) => Some(*f),
        }
    }

    pub fn is_owned_by(&self, family: u32) -> bool {
        matches!(self, QueueOwnership::Owned(f) if *f == family)
    }
}

///Tracked GPU state of a resource. Buffers keep `layout` at
/// [vk::ImageLayout::UNDEFINED] permanently, which lets one reconciliation
/// routine serve both resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub ownership: QueueOwnership,
}

impl Default for ResourceState {
    fn default() -> Self {
        ResourceState {
            stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            access: vk::AccessFlags2::empty(),
            layout: vk::ImageLayout::UNDEFINED,
            ownership: QueueOwnership::Ignored,
        }
    }
}

///Stateful buffer. The descriptor is immutable after registration, only the
/// tracked state moves.
pub struct TrackedBuffer {
    pub buffer: Buffer,
    pub(crate) state: RwLock<ResourceState>,
}

impl TrackedBuffer {
    pub fn new(buffer: Buffer) -> Self {
        TrackedBuffer {
            buffer,
            state: RwLock::new(ResourceState::default()),
        }
    }

    ///Registers the buffer with a known pre-existing state, for resources
    /// the application already used outside the graph.
    pub fn with_state(buffer: Buffer, state: ResourceState) -> Self {
        TrackedBuffer {
            buffer,
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state.read().unwrap()
    }
}

///Stateful texel-buffer view. State lives on the view, barriers target the
/// parent buffer.
pub struct TrackedBufferView {
    pub view: BufferView,
    pub(crate) state: RwLock<ResourceState>,
}

impl TrackedBufferView {
    pub fn new(view: BufferView) -> Self {
        TrackedBufferView {
            view,
            state: RwLock::new(ResourceState::default()),
        }
    }

    pub fn with_state(view: BufferView, state: ResourceState) -> Self {
        TrackedBufferView {
            view,
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state.read().unwrap()
    }
}

///Stateful image view. Layout transitions operate on the parent image.
pub struct TrackedImage {
    pub view: ImageView,
    pub(crate) state: RwLock<ResourceState>,
}

impl TrackedImage {
    pub fn new(view: ImageView) -> Self {
        TrackedImage {
            view,
            state: RwLock::new(ResourceState::default()),
        }
    }

    pub fn with_state(view: ImageView, state: ResourceState) -> Self {
        TrackedImage {
            view,
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state.read().unwrap()
    }
}

///What a barrier has to target for a tracked resource.
pub(crate) enum BarrierTarget {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

///Any tracked resource, as the compiler sees it. One tagged union keeps the
/// reconciliation routine polymorphic over buffers and images.
#[derive(Clone)]
pub enum AnyResource {
    Buffer(Arc<TrackedBuffer>),
    BufferView(Arc<TrackedBufferView>),
    Image(Arc<TrackedImage>),
}

impl AnyResource {
    pub(crate) fn target(&self) -> BarrierTarget {
        match self {
            AnyResource::Buffer(b) => BarrierTarget::Buffer(b.buffer.inner),
            AnyResource::BufferView(v) => BarrierTarget::Buffer(v.view.buffer),
            AnyResource::Image(i) => BarrierTarget::Image(i.view.image),
        }
    }

    pub(crate) fn state_lock(&self) -> &RwLock<ResourceState> {
        match self {
            AnyResource::Buffer(b) => &b.state,
            AnyResource::BufferView(v) => &v.state,
            AnyResource::Image(i) => &i.state,
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.state_lock().read().unwrap()
    }

    pub fn is_image(&self) -> bool {
        matches!(self, AnyResource::Image(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(TrackedBuffer: Send, Sync);
        assert_impl_all!(TrackedImage: Send, Sync);
        assert_impl_all!(AnyResource: Send, Sync);
    }

    #[test]
    fn default_state_is_unclaimed() {
        let state = ResourceState::default();
        assert_eq!(state.ownership, QueueOwnership::Ignored);
        assert_eq!(state.layout, vk::ImageLayout::UNDEFINED);
        assert!(state.access.is_empty());
    }

    #[test]
    fn ownership_family() {
        assert_eq!(QueueOwnership::Ignored.family(), None);
        assert_eq!(QueueOwnership::Owned(2).family(), Some(2));
        assert!(QueueOwnership::Owned(1).is_owned_by(1));
        assert!(!QueueOwnership::Ignored.is_owned_by(0));
    }
}
