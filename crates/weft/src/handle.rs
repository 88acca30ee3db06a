//! Opaque, copyable ids for native GPU objects. A handle is only meaningful
//! to the [GpuDevice](crate::GpuDevice) that produced it; the graph never
//! inspects the inner value, it only stores and compares them.

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: $name = $name(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }
    };
}

define_handle!(
    ///Binary semaphore used for cross-queue and present synchronisation.
    Semaphore
);
define_handle!(
    ///Host-waitable fence.
    Fence
);
define_handle!(CommandBuffer);
define_handle!(RenderPass);
define_handle!(Framebuffer);
define_handle!(Pipeline);
define_handle!(PipelineLayout);
define_handle!(DescriptorSetLayout);
define_handle!(DescriptorPool);
define_handle!(DescriptorSet);
define_handle!(ShaderModule);
define_handle!(BufferHandle);
define_handle!(BufferViewHandle);
define_handle!(ImageHandle);
define_handle!(ImageViewHandle);
define_handle!(SamplerHandle);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(CommandBuffer::NULL.is_null());
        assert!(!Semaphore(42).is_null());
    }
}
