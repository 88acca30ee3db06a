//! Structural descriptions of pipeline state. Everything in this module
//! derives `PartialEq`/`Eq`/`Hash` by value on purpose: the graph keys its
//! render-pass and pipeline caches on these types, so two layouts that
//! compare equal share one native object regardless of which pass asked
//! for them.

use ash::vk;

use crate::handle::{PipelineLayout, RenderPass, ShaderModule};

///Description of a single color or depth attachment slot in a
/// [RenderLayout].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentLayout {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    ///Layout the attachment is left in when the pass ends.
    pub final_layout: vk::ImageLayout,
}

///Ordered attachment setup of a graphics pass. This is the structural
/// identity of a render pass: identical layouts map to the same native
/// render pass object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderLayout {
    pub color: Vec<AttachmentLayout>,
    pub depth: Option<AttachmentLayout>,
}

impl RenderLayout {
    pub fn attachment_count(&self) -> usize {
        self.color.len() + self.depth.is_some() as usize
    }
}

///Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub viewport: vk::Extent2D,
}

impl Default for RasterState {
    fn default() -> Self {
        RasterState {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: false,
            viewport: vk::Extent2D {
                width: 1,
                height: 1,
            },
        }
    }
}

///A shader module together with its entry point and stage. Registered by
/// name with the graph and referenced from pass descriptions.
#[derive(Debug, Clone)]
pub struct SpecializedShader {
    pub module: ShaderModule,
    pub stage: vk::ShaderStageFlags,
    pub entry: String,
}

impl SpecializedShader {
    pub fn new(module: ShaderModule, stage: vk::ShaderStageFlags) -> Self {
        SpecializedShader {
            module,
            stage,
            entry: String::from("main"),
        }
    }
}

///One binding slot of a descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex: SpecializedShader,
    pub fragment: SpecializedShader,
    pub layout: PipelineLayout,
    pub render_pass: RenderPass,
    pub raster: RasterState,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub shader: SpecializedShader,
    pub layout: PipelineLayout,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RenderLayout {
        RenderLayout {
            color: vec![AttachmentLayout {
                format: vk::Format::B8G8R8A8_UNORM,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }],
            depth: None,
        }
    }

    #[test]
    fn render_layout_structural_equality() {
        assert_eq!(layout(), layout());

        let mut other = layout();
        other.color[0].load_op = vk::AttachmentLoadOp::LOAD;
        assert_ne!(layout(), other);
    }

    #[test]
    fn attachment_count_includes_depth() {
        let mut l = layout();
        assert_eq!(l.attachment_count(), 1);
        l.depth = Some(AttachmentLayout {
            format: vk::Format::D32_SFLOAT,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        assert_eq!(l.attachment_count(), 2);
    }
}
