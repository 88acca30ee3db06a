//! Global descriptor gathering. All graphics and compute passes share one
//! descriptor set: their binding lists are merged into a single layout, one
//! pool and one set, and every named resource is written once. The matching
//! pipeline layout (set layout + one push-constant range sized for the
//! largest pass) is what every pipeline in the graph is built against.

use ahash::AHashMap;
use ash::vk;
use weft::{
    handle::{
        BufferHandle, BufferViewHandle, DescriptorPool, DescriptorSet, DescriptorSetLayout,
        ImageViewHandle, PipelineLayout, SamplerHandle,
    },
    DescriptorBindingDesc, DescriptorResource, DescriptorWrite, GpuDevice,
};

use crate::{pass::DescriptorBinding, CompileError};

///Name-to-handle resolution against the graph's registries.
pub(crate) trait ResourceLookup {
    fn buffer(&self, name: &str) -> Option<BufferHandle>;
    fn buffer_view(&self, name: &str) -> Option<BufferViewHandle>;
    fn image_view(&self, name: &str) -> Option<ImageViewHandle>;
    fn sampler(&self, name: &str) -> Option<SamplerHandle>;
}

///The merged descriptor objects shared by every pass.
pub struct GlobalDescriptors {
    pub set_layout: DescriptorSetLayout,
    pub pool: DescriptorPool,
    pub set: DescriptorSet,
    pub pipeline_layout: PipelineLayout,
    ///Union of all stages that read push constants.
    pub push_stages: vk::ShaderStageFlags,
    pub push_size: u32,
}

///Image layout a descriptor of this type expects its image in while bound.
fn expected_layout(ty: vk::DescriptorType) -> vk::ImageLayout {
    match ty {
        vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

fn is_supported(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_TEXEL_BUFFER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::SAMPLER
    )
}

struct MergedBinding {
    desc: DescriptorBindingDesc,
    resource: String,
    sampler: Option<String>,
}

pub(crate) fn gather<D: GpuDevice>(
    device: &D,
    bindings: &[DescriptorBinding],
    push_size: u32,
    push_stages: vk::ShaderStageFlags,
    lookup: &impl ResourceLookup,
) -> Result<GlobalDescriptors, CompileError> {
    let mut merged: AHashMap<u32, MergedBinding> = AHashMap::default();
    for binding in bindings {
        if !is_supported(binding.ty) {
            return Err(CompileError::UnsupportedDescriptorType(binding.ty));
        }
        match merged.entry(binding.binding) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let prev = entry.get_mut();
                if prev.desc.ty != binding.ty {
                    return Err(CompileError::DescriptorBindingConflict(binding.binding));
                }
                prev.desc.stages |= binding.stages;
                prev.desc.count = prev.desc.count.max(binding.count);
                //Last pass naming the slot wins, like the registries.
                prev.resource = binding.resource.clone();
                prev.sampler = binding.sampler.clone();
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(MergedBinding {
                    desc: DescriptorBindingDesc {
                        binding: binding.binding,
                        ty: binding.ty,
                        count: binding.count,
                        stages: binding.stages,
                    },
                    resource: binding.resource.clone(),
                    sampler: binding.sampler.clone(),
                });
            }
        }
    }

    let mut merged: Vec<MergedBinding> = merged.into_values().collect();
    merged.sort_by_key(|binding| binding.desc.binding);

    #[cfg(feature = "logging")]
    log::trace!(
        "Gathering {} descriptor bindings, push constants: {}b over {:?}",
        merged.len(),
        push_size,
        push_stages
    );

    let layout_descs: Vec<DescriptorBindingDesc> = merged.iter().map(|m| m.desc).collect();
    let set_layout = device.create_descriptor_layout(&layout_descs)?;

    let mut pool_sizes: AHashMap<vk::DescriptorType, u32> = AHashMap::default();
    for binding in &merged {
        *pool_sizes.entry(binding.desc.ty).or_insert(0) += binding.desc.count;
    }
    let pool_sizes: Vec<(vk::DescriptorType, u32)> = pool_sizes.into_iter().collect();
    let pool = device.create_descriptor_pool(&pool_sizes, 1)?;
    let set = device.allocate_descriptor_set(pool, set_layout)?;

    let mut writes = Vec::with_capacity(merged.len());
    for binding in &merged {
        let resource = resolve(binding, lookup)?;
        writes.push(DescriptorWrite {
            binding: binding.desc.binding,
            ty: binding.desc.ty,
            resource,
        });
    }
    device.update_descriptor_set(set, &writes);

    let pipeline_layout = device.create_pipeline_layout(set_layout, push_size)?;

    Ok(GlobalDescriptors {
        set_layout,
        pool,
        set,
        pipeline_layout,
        push_stages,
        push_size,
    })
}

fn resolve(
    binding: &MergedBinding,
    lookup: &impl ResourceLookup,
) -> Result<DescriptorResource, CompileError> {
    let unknown = || CompileError::UnknownResource(binding.resource.clone());
    match binding.desc.ty {
        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
            let buffer = lookup.buffer(&binding.resource).ok_or_else(unknown)?;
            Ok(DescriptorResource::Buffer(buffer))
        }
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER => {
            let view = lookup.buffer_view(&binding.resource).ok_or_else(unknown)?;
            Ok(DescriptorResource::BufferView(view))
        }
        vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::STORAGE_IMAGE => {
            let view = lookup.image_view(&binding.resource).ok_or_else(unknown)?;
            Ok(DescriptorResource::Image {
                view,
                layout: expected_layout(binding.desc.ty),
            })
        }
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
            let view = lookup.image_view(&binding.resource).ok_or_else(unknown)?;
            let sampler_name = binding
                .sampler
                .as_deref()
                .ok_or(CompileError::MissingSampler(binding.desc.binding))?;
            let sampler = lookup
                .sampler(sampler_name)
                .ok_or_else(|| CompileError::UnknownResource(sampler_name.to_string()))?;
            Ok(DescriptorResource::CombinedImageSampler {
                view,
                sampler,
                layout: expected_layout(binding.desc.ty),
            })
        }
        vk::DescriptorType::SAMPLER => {
            let sampler = lookup.sampler(&binding.resource).ok_or_else(unknown)?;
            Ok(DescriptorResource::Sampler(sampler))
        }
        other => Err(CompileError::UnsupportedDescriptorType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_images_expect_general() {
        assert_eq!(
            expected_layout(vk::DescriptorType::STORAGE_IMAGE),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            expected_layout(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn acceleration_structures_are_unsupported() {
        assert!(!is_supported(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
        assert!(is_supported(vk::DescriptorType::STORAGE_BUFFER));
    }
}
