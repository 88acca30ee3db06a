//! Plain descriptors for the resources an application registers with the
//! graph. The native objects behind the handles are created, owned and
//! destroyed by the application layer; the graph only needs the metadata
//! carried here to build barriers, framebuffers and descriptor writes.

use ash::vk;

use crate::handle::{BufferHandle, BufferViewHandle, ImageHandle, ImageViewHandle, SamplerHandle};

#[derive(Debug, Clone)]
pub struct Buffer {
    pub inner: BufferHandle,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

impl Buffer {
    pub fn is_storage_buffer(&self) -> bool {
        self.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER)
    }
}

///Typed view over a [Buffer], used for texel-buffer descriptors. Barriers
/// always target the underlying buffer.
#[derive(Debug, Clone)]
pub struct BufferView {
    pub inner: BufferViewHandle,
    pub buffer: BufferHandle,
    pub format: vk::Format,
}

///View over an image. This is what graphics passes bind as attachments and
/// what descriptors sample from. The parent image handle is kept around since
/// layout transitions operate on the image, not the view.
#[derive(Debug, Clone)]
pub struct ImageView {
    pub inner: ImageViewHandle,
    pub image: ImageHandle,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageView {
    pub fn is_depth(&self) -> bool {
        self.aspect.contains(vk::ImageAspectFlags::DEPTH)
    }
}

#[derive(Debug, Clone)]
pub struct Sampler {
    pub inner: SamplerHandle,
}
