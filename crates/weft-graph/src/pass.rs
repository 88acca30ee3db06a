//! Pass descriptions. A pass is a reusable template: it names its shaders,
//! its attachment layout and, for every resource slot, the GPU state the
//! resource must be in when the pass starts and the state it is left in
//! when the pass ends. Ops reference passes by name and fill the slots with
//! concrete resource names.

use ash::vk;
use weft::{AttachmentLayout, RasterState, RenderLayout};

///Start/final state of one resource slot. Slots align positionally with the
/// resource names of the op that instantiates the pass. Layout fields are
/// ignored for buffer resources.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsageEntry {
    pub start_stage: vk::PipelineStageFlags2,
    pub start_access: vk::AccessFlags2,
    pub start_layout: vk::ImageLayout,
    pub final_stage: vk::PipelineStageFlags2,
    pub final_access: vk::AccessFlags2,
    pub final_layout: vk::ImageLayout,
}

impl ResourceUsageEntry {
    ///Usage that enters and leaves the pass in the same state.
    pub fn uniform(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        ResourceUsageEntry {
            start_stage: stage,
            start_access: access,
            start_layout: layout,
            final_stage: stage,
            final_access: access,
            final_layout: layout,
        }
    }

    pub fn buffer(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self::uniform(stage, access, vk::ImageLayout::UNDEFINED)
    }

    ///Usage a color attachment slot implies: the image must be
    /// attachment-optimal at the draw and is left in the slot's declared
    /// final layout.
    pub fn color_attachment(attachment: &AttachmentLayout) -> Self {
        let mut access = vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
        if attachment.load_op == vk::AttachmentLoadOp::LOAD {
            access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
        }
        ResourceUsageEntry {
            start_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            start_access: access,
            start_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            final_access: access,
            final_layout: attachment.final_layout,
        }
    }

    ///Usage a depth attachment slot implies.
    pub fn depth_attachment(attachment: &AttachmentLayout) -> Self {
        let mut access = vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
        if attachment.load_op == vk::AttachmentLoadOp::LOAD {
            access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
        }
        let stages = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        ResourceUsageEntry {
            start_stage: stages,
            start_access: access,
            start_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            final_stage: stages,
            final_access: access,
            final_layout: attachment.final_layout,
        }
    }
}

///One descriptor slot of a pass, bound to a registered resource by name.
/// `sampler` is only consulted for combined-image-sampler bindings.
#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub resource: String,
    pub sampler: Option<String>,
}

pub struct GraphicsPass {
    pub name: String,
    pub vertex_shader: String,
    pub fragment_shader: String,
    ///Usage slots, one per op resource, attachments included.
    pub usages: Vec<ResourceUsageEntry>,
    pub render_layout: RenderLayout,
    pub raster: RasterState,
    pub bindings: Vec<DescriptorBinding>,
    pub push_constant_size: u32,
}

pub struct ComputePass {
    pub name: String,
    pub shader: String,
    pub usages: Vec<ResourceUsageEntry>,
    ///Async passes run on the dedicated compute queue; otherwise the
    /// dispatch folds into the graphics stream.
    pub is_async: bool,
    pub bindings: Vec<DescriptorBinding>,
    pub push_constant_size: u32,
}

///Buffer-to-buffer copy template. Slot 0 is the source, slot 1 the
/// destination.
pub struct BufferTransferPass {
    pub name: String,
    pub usages: Vec<ResourceUsageEntry>,
}

///Buffer/image copy template; the op's [TransferDirection](crate::TransferDirection)
/// decides which way the copy goes. Slot 0 is the buffer, slot 1 the image.
pub struct ImageTransferPass {
    pub name: String,
    pub usages: Vec<ResourceUsageEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_usage_round_trips() {
        let usage = ResourceUsageEntry::uniform(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
        );
        assert_eq!(usage.start_stage, usage.final_stage);
        assert_eq!(usage.start_access, usage.final_access);
        assert_eq!(usage.start_layout, usage.final_layout);
    }

    #[test]
    fn attachment_usage_follows_declared_layout() {
        let attachment = AttachmentLayout {
            format: vk::Format::B8G8R8A8_UNORM,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let usage = ResourceUsageEntry::color_attachment(&attachment);
        assert_eq!(usage.start_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(usage.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        //LOAD means the previous contents are read back in
        assert!(usage.start_access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_READ));

        let depth = ResourceUsageEntry::depth_attachment(&AttachmentLayout {
            format: vk::Format::D32_SFLOAT,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        assert_eq!(
            depth.start_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert!(!depth
            .start_access
            .contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ));
    }

    #[test]
    fn buffer_usage_keeps_layout_undefined() {
        let usage = ResourceUsageEntry::buffer(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        );
        assert_eq!(usage.start_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(usage.final_layout, vk::ImageLayout::UNDEFINED);
    }
}
