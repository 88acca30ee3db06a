//! Lazily built, structurally keyed caches for render passes, framebuffers
//! and pipelines. Two passes that describe the same attachment setup share
//! one native render pass; two ops that render into the same attachments
//! share one framebuffer. Nothing is ever evicted, the graph's working set
//! of layouts is small and stable.

use ahash::AHashMap;
use ash::vk;
use weft::{
    handle::{Framebuffer, ImageViewHandle, Pipeline, PipelineLayout, RenderPass},
    ComputePipelineDesc, GpuDevice, GraphicsPipelineDesc, RasterState, RenderLayout,
    SpecializedShader,
};

use crate::CompileError;

#[derive(Default)]
pub(crate) struct PipelineCache {
    render_passes: AHashMap<RenderLayout, RenderPass>,
    ///Keyed by the concatenated attachment names, depth last.
    framebuffers: AHashMap<String, Framebuffer>,
    graphics: AHashMap<(String, RenderLayout), Pipeline>,
    compute: AHashMap<String, Pipeline>,
}

fn framebuffer_key(attachment_names: &[&str]) -> String {
    attachment_names.join("\u{1f}")
}

impl PipelineCache {
    pub fn render_pass<D: GpuDevice>(
        &mut self,
        device: &D,
        layout: &RenderLayout,
    ) -> Result<RenderPass, CompileError> {
        if let Some(rp) = self.render_passes.get(layout) {
            return Ok(*rp);
        }
        #[cfg(feature = "logging")]
        log::trace!(
            "Building render pass for layout with {} attachments",
            layout.attachment_count()
        );
        let rp = device.create_render_pass(layout)?;
        self.render_passes.insert(layout.clone(), rp);
        Ok(rp)
    }

    ///Framebuffer for a concrete attachment set. The render pass for
    /// `layout` must already exist; the compiler always builds it first.
    pub fn framebuffer<D: GpuDevice>(
        &mut self,
        device: &D,
        layout: &RenderLayout,
        attachment_names: &[&str],
        attachments: &[ImageViewHandle],
        extent: vk::Extent2D,
    ) -> Result<Framebuffer, CompileError> {
        let key = framebuffer_key(attachment_names);
        if let Some(fb) = self.framebuffers.get(&key) {
            return Ok(*fb);
        }
        let rp = *self
            .render_passes
            .get(layout)
            .ok_or(CompileError::UnbuiltRenderPass)?;
        #[cfg(feature = "logging")]
        log::trace!("Building framebuffer for attachments {:?}", attachment_names);
        let fb = device.create_framebuffer(rp, attachments, extent)?;
        self.framebuffers.insert(key, fb);
        Ok(fb)
    }

    pub fn graphics_pipeline<D: GpuDevice>(
        &mut self,
        device: &D,
        pass_name: &str,
        layout: &RenderLayout,
        vertex: SpecializedShader,
        fragment: SpecializedShader,
        raster: RasterState,
        pipeline_layout: PipelineLayout,
    ) -> Result<Pipeline, CompileError> {
        let key = (pass_name.to_string(), layout.clone());
        if let Some(pipe) = self.graphics.get(&key) {
            return Ok(*pipe);
        }
        let render_pass = self.render_pass(device, layout)?;
        #[cfg(feature = "logging")]
        log::trace!("Building graphics pipeline for pass \"{}\"", pass_name);
        let pipe = device.create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex,
            fragment,
            layout: pipeline_layout,
            render_pass,
            raster,
        })?;
        self.graphics.insert(key, pipe);
        Ok(pipe)
    }

    pub fn compute_pipeline<D: GpuDevice>(
        &mut self,
        device: &D,
        pass_name: &str,
        shader: SpecializedShader,
        pipeline_layout: PipelineLayout,
    ) -> Result<Pipeline, CompileError> {
        if let Some(pipe) = self.compute.get(pass_name) {
            return Ok(*pipe);
        }
        #[cfg(feature = "logging")]
        log::trace!("Building compute pipeline for pass \"{}\"", pass_name);
        let pipe = device.create_compute_pipeline(&ComputePipelineDesc {
            shader,
            layout: pipeline_layout,
        })?;
        self.compute.insert(pass_name.to_string(), pipe);
        Ok(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffer_keys_separate_attachment_sets() {
        assert_eq!(framebuffer_key(&["a", "b"]), framebuffer_key(&["a", "b"]));
        assert_ne!(framebuffer_key(&["a", "b"]), framebuffer_key(&["b", "a"]));
        //Joined names must not collide with a differently split set
        assert_ne!(framebuffer_key(&["ab"]), framebuffer_key(&["a", "b"]));
    }
}
