//! End-to-end tests of the frame compiler against the recording mock
//! device: barrier minimality, queue-ownership transfers, submission
//! wiring and the validation surface.

use std::sync::Arc;

use weft::{
    ash::vk,
    handle::{BufferHandle, BufferViewHandle, ImageHandle, ImageViewHandle, ShaderModule},
    mock::{MockCommand, MockDevice},
    resources::{Buffer, BufferView, ImageView},
    AttachmentLayout, RenderLayout, SpecializedShader,
};
use weft_graph::{
    BufferTransferPass, CompileError, ComputePass, FrameGraph, GpuOp, GraphicsPass, ImageTransferPass,
    OpCommand, QueueKind, QueueOwnership, ResourceState, ResourceUsageEntry, TransferDirection,
};

const GFX_FAMILY: u32 = 0;
const COMPUTE_FAMILY: u32 = 1;
const TRANSFER_FAMILY: u32 = 2;

fn buffer(handle: u64) -> Buffer {
    Buffer {
        inner: BufferHandle(handle),
        size: 1024,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
    }
}

fn color_target(handle: u64) -> ImageView {
    ImageView {
        inner: ImageViewHandle(handle),
        image: ImageHandle(handle + 1),
        format: vk::Format::B8G8R8A8_UNORM,
        extent: vk::Extent2D {
            width: 800,
            height: 600,
        },
        aspect: vk::ImageAspectFlags::COLOR,
    }
}

fn single_color_layout() -> RenderLayout {
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

///Graph with vertex/fragment/compute shaders already registered.
fn graph() -> FrameGraph<MockDevice> {
    let graph = FrameGraph::new(Arc::new(MockDevice::new())).unwrap();
    graph.register_shader(
        "vert",
        SpecializedShader::new(ShaderModule(9001), vk::ShaderStageFlags::VERTEX),
    );
    graph.register_shader(
        "frag",
        SpecializedShader::new(ShaderModule(9002), vk::ShaderStageFlags::FRAGMENT),
    );
    graph.register_shader(
        "comp",
        SpecializedShader::new(ShaderModule(9003), vk::ShaderStageFlags::COMPUTE),
    );
    graph
}

///Graphics pass without attachments reading one buffer in the fragment
/// stage.
fn buffer_read_pass(name: &str) -> GraphicsPass {
    GraphicsPass {
        name: name.into(),
        vertex_shader: "vert".into(),
        fragment_shader: "frag".into(),
        usages: vec![ResourceUsageEntry::buffer(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        )],
        render_layout: RenderLayout::default(),
        raster: Default::default(),
        bindings: Vec::new(),
        push_constant_size: 0,
    }
}

fn upload_pass() -> BufferTransferPass {
    BufferTransferPass {
        name: "upload".into(),
        usages: vec![
            ResourceUsageEntry::buffer(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            ResourceUsageEntry::buffer(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ],
    }
}

fn copy_op(pass: &str, direction: TransferDirection) -> GpuOp {
    GpuOp::new(
        pass,
        OpCommand::Transfer {
            direction,
            region: vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 1024,
            },
            extent: vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
        },
    )
}

fn draw_op(pass: &str) -> GpuOp {
    GpuOp::new(
        pass,
        OpCommand::Draw {
            vertex_count: 3,
            instance_count: 1,
        },
    )
}

#[test]
fn transfer_write_then_graphics_read_moves_ownership() {
    let graph = graph();
    graph.register_buffer("staging", buffer(100));
    graph.register_buffer("a", buffer(200));
    graph.register_buffer_transfer_pass(upload_pass());
    graph.register_graphics_pass(buffer_read_pass("read_a"));
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        copy_op("upload", TransferDirection::Stage).with_resources(["staging", "a"]),
        draw_op("read_a").with_resources(["a"]),
    ]);
    graph.build().unwrap();

    assert_eq!(
        graph.resource_state("a").unwrap().ownership,
        QueueOwnership::Owned(GFX_FAMILY)
    );

    let state = graph.device().state();
    //Exactly one transfer submission, carrying exactly one signal: the
    //ownership-transfer semaphore.
    let transfer: Vec<_> = state
        .submits
        .iter()
        .filter(|s| s.queue == QueueKind::Transfer)
        .collect();
    assert_eq!(transfer.len(), 1);
    assert_eq!(transfer[0].signals.len(), 1);
    let sem = transfer[0].signals[0];

    //Exactly one graphics submission waits on it.
    let waiting: usize = state
        .submits
        .iter()
        .filter(|s| s.queue == QueueKind::Graphics)
        .filter(|s| s.waits.iter().any(|(w, _)| *w == sem))
        .count();
    assert_eq!(waiting, 1);

    //Release on the transfer buffer, acquire on the graphics buffer.
    let ownership_barriers = state
        .commands
        .values()
        .flatten()
        .filter(|c| {
            matches!(c, MockCommand::BufferBarrier(b)
                if b.buffer == BufferHandle(200)
                    && b.src_family == TRANSFER_FAMILY
                    && b.dst_family == GFX_FAMILY)
        })
        .count();
    assert_eq!(ownership_barriers, 2);
}

#[test]
fn identical_consecutive_attachment_use_emits_one_barrier() {
    let graph = graph();
    graph.register_image("target", color_target(300));
    graph.register_graphics_pass(GraphicsPass {
        name: "draw".into(),
        vertex_shader: "vert".into(),
        fragment_shader: "frag".into(),
        usages: vec![ResourceUsageEntry::uniform(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )],
        render_layout: single_color_layout(),
        raster: Default::default(),
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        draw_op("draw")
            .with_resources(["target"])
            .with_color_attachments(["target"]),
        draw_op("draw")
            .with_resources(["target"])
            .with_color_attachments(["target"]),
    ]);
    graph.build().unwrap();

    //One layout transition at the first op, none at the second.
    let state = graph.device().state();
    let barriers = state
        .commands
        .values()
        .flatten()
        .filter(|c| matches!(c, MockCommand::ImageBarrier(b) if b.image == ImageHandle(301)))
        .count();
    assert_eq!(barriers, 1);

    //Both draws still happened.
    let draws = state
        .commands
        .values()
        .flatten()
        .filter(|c| matches!(c, MockCommand::Draw { .. }))
        .count();
    assert_eq!(draws, 2);
}

#[test]
fn attachment_only_op_still_reconciles_the_attachment() {
    let graph = graph();
    graph.register_image("target", color_target(350));
    //The pass declares no explicit usage slots; the attachment is only
    //named through the op's attachment list.
    graph.register_graphics_pass(GraphicsPass {
        name: "draw".into(),
        vertex_shader: "vert".into(),
        fragment_shader: "frag".into(),
        usages: Vec::new(),
        render_layout: single_color_layout(),
        raster: Default::default(),
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([draw_op("draw").with_color_attachments(["target"])]);
    graph.build().unwrap();

    //The attachment got its layout transition and is owned by graphics.
    let state = graph.device().state();
    let barriers: Vec<_> = state
        .commands
        .values()
        .flatten()
        .filter_map(|c| match c {
            MockCommand::ImageBarrier(b) if b.image == ImageHandle(351) => Some(b),
            _ => None,
        })
        .collect();
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let tracked = graph.resource_state("target").unwrap();
    assert_eq!(tracked.ownership, QueueOwnership::Owned(GFX_FAMILY));
    assert_eq!(tracked.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
}

#[test]
fn explicitly_listed_attachment_is_not_reconciled_twice() {
    let graph = graph();
    graph.register_image("target", color_target(370));
    graph.register_graphics_pass(GraphicsPass {
        name: "draw".into(),
        vertex_shader: "vert".into(),
        fragment_shader: "frag".into(),
        usages: vec![ResourceUsageEntry::uniform(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )],
        render_layout: single_color_layout(),
        raster: Default::default(),
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([draw_op("draw")
        .with_resources(["target"])
        .with_color_attachments(["target"])]);
    graph.build().unwrap();

    //One transition from the explicit usage slot, no second one from the
    //attachment list.
    let state = graph.device().state();
    let barriers = state
        .commands
        .values()
        .flatten()
        .filter(|c| matches!(c, MockCommand::ImageBarrier(b) if b.image == ImageHandle(371)))
        .count();
    assert_eq!(barriers, 1);
}

#[test]
fn async_compute_into_graphics_splits_and_chains() {
    let graph = graph();
    graph.register_buffer("shared", buffer(400));
    graph.register_compute_pass(ComputePass {
        name: "blur".into(),
        shader: "comp".into(),
        usages: vec![ResourceUsageEntry::buffer(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
        )],
        is_async: true,
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.register_graphics_pass(buffer_read_pass("read_shared"));
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        GpuOp::new("blur", OpCommand::Dispatch { groups: [8, 8, 1] }).with_resources(["shared"]),
        draw_op("read_shared").with_resources(["shared"]),
    ]);
    graph.build().unwrap();

    assert_eq!(
        graph.resource_state("shared").unwrap().ownership,
        QueueOwnership::Owned(GFX_FAMILY)
    );

    let state = graph.device().state();
    let compute: Vec<_> = state
        .submits
        .iter()
        .filter(|s| s.queue == QueueKind::Compute)
        .collect();
    assert_eq!(compute.len(), 1);
    assert_eq!(compute[0].signals.len(), 1);
    let sem = compute[0].signals[0];
    assert!(state
        .submits
        .iter()
        .filter(|s| s.queue == QueueKind::Graphics)
        .any(|s| s.waits.iter().any(|(w, _)| *w == sem)));
}

#[test]
fn non_async_compute_folds_into_graphics() {
    let graph = graph();
    graph.register_buffer("data", buffer(500));
    graph.register_compute_pass(ComputePass {
        name: "prepass".into(),
        shader: "comp".into(),
        usages: vec![ResourceUsageEntry::buffer(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
        )],
        is_async: false,
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        GpuOp::new("prepass", OpCommand::Dispatch { groups: [4, 1, 1] }).with_resources(["data"]),
    ]);
    graph.build().unwrap();

    let state = graph.device().state();
    assert!(state.submits.iter().all(|s| s.queue != QueueKind::Compute));
    assert_eq!(
        graph.resource_state("data").unwrap().ownership,
        QueueOwnership::Owned(GFX_FAMILY)
    );
}

#[test]
fn reregistration_is_last_writer_wins() {
    let graph = graph();
    graph.register_buffer("b", buffer(600));
    graph.register_buffer("b", buffer(700));
    graph.register_buffer("staging", buffer(601));
    graph.register_buffer_transfer_pass(upload_pass());
    graph.gather_descriptors().unwrap();

    graph.queue_ops([copy_op("upload", TransferDirection::Stage).with_resources(["staging", "b"])]);
    graph.build().unwrap();

    let state = graph.device().state();
    //Barriers and the copy hit the re-registered object, never the stale
    //one.
    let stale = state.commands.values().flatten().any(|c| {
        matches!(c, MockCommand::BufferBarrier(b) if b.buffer == BufferHandle(600))
            || matches!(c, MockCommand::CopyBuffer { dst, .. } if *dst == BufferHandle(600))
    });
    assert!(!stale);
    assert!(state
        .commands
        .values()
        .flatten()
        .any(|c| matches!(c, MockCommand::CopyBuffer { dst, .. } if *dst == BufferHandle(700))));
}

#[test]
fn depth_mismatch_fails_before_any_submission() {
    let graph = graph();
    graph.register_image("target", color_target(800));
    let mut layout = single_color_layout();
    layout.depth = Some(AttachmentLayout {
        format: vk::Format::D32_SFLOAT,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    });
    graph.register_graphics_pass(GraphicsPass {
        name: "needs_depth".into(),
        vertex_shader: "vert".into(),
        fragment_shader: "frag".into(),
        usages: vec![ResourceUsageEntry::uniform(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )],
        render_layout: layout,
        raster: Default::default(),
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([draw_op("needs_depth")
        .with_resources(["target"])
        .with_color_attachments(["target"])]);
    let err = graph.build().unwrap_err();
    assert!(matches!(
        err,
        CompileError::DepthAttachmentMismatch {
            declared: true,
            supplied: false,
            ..
        }
    ));

    let state = graph.device().state();
    assert!(state.submits.is_empty());
    assert!(state.presents.is_empty());
}

#[test]
fn unknown_names_are_fatal() {
    let graph = graph();
    graph.register_graphics_pass(buffer_read_pass("read"));
    graph.gather_descriptors().unwrap();

    graph.queue_ops([draw_op("nope").with_resources(["x"])]);
    assert!(matches!(
        graph.build().unwrap_err(),
        CompileError::UnknownPass(name) if name == "nope"
    ));

    graph.queue_ops([draw_op("read").with_resources(["ghost"])]);
    assert!(matches!(
        graph.build().unwrap_err(),
        CompileError::UnknownResource(name) if name == "ghost"
    ));
}

#[test]
fn unspecified_transfer_direction_is_fatal() {
    let graph = graph();
    graph.register_buffer("staging", buffer(900));
    graph.register_image("tex", color_target(910));
    graph.register_image_transfer_pass(ImageTransferPass {
        name: "tex_copy".into(),
        usages: vec![
            ResourceUsageEntry::buffer(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            ResourceUsageEntry::uniform(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
        ],
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        copy_op("tex_copy", TransferDirection::Unspecified).with_resources(["staging", "tex"])
    ]);
    assert!(matches!(
        graph.build().unwrap_err(),
        CompileError::UnspecifiedTransferDirection { pass } if pass == "tex_copy"
    ));
}

#[test]
fn build_without_gather_is_rejected() {
    let graph = graph();
    assert!(matches!(
        graph.build().unwrap_err(),
        CompileError::DescriptorsNotGathered
    ));
}

#[test]
fn unsupported_descriptor_type_is_fatal() {
    let graph = graph();
    let mut pass = buffer_read_pass("rt");
    pass.bindings.push(weft_graph::DescriptorBinding {
        binding: 0,
        ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        count: 1,
        stages: vk::ShaderStageFlags::FRAGMENT,
        resource: "tlas".into(),
        sampler: None,
    });
    graph.register_graphics_pass(pass);
    assert!(matches!(
        graph.gather_descriptors().unwrap_err(),
        CompileError::UnsupportedDescriptorType(ty)
            if ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
    ));
}

#[test]
fn empty_frame_still_presents() {
    let graph = graph();
    graph.gather_descriptors().unwrap();
    graph.build().unwrap();

    let state = graph.device().state();
    assert_eq!(state.presents.len(), 1);
    assert_eq!(state.acquires.len(), 1);
    //Empty producer buffer plus the swapchain transition, both graphics.
    assert_eq!(state.submits.len(), 2);
    assert!(state.submits.iter().all(|s| s.queue == QueueKind::Graphics));
}

#[test]
fn submission_is_complete_and_chained_to_present() {
    let graph = graph();
    graph.register_buffer("staging", buffer(1100));
    graph.register_buffer("a", buffer(1200));
    graph.register_buffer_transfer_pass(upload_pass());
    graph.register_graphics_pass(buffer_read_pass("read_a"));
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        copy_op("upload", TransferDirection::Stage).with_resources(["staging", "a"]),
        draw_op("read_a").with_resources(["a"]),
    ]);
    graph.build().unwrap();

    let state = graph.device().state();
    //Every buffer is submitted exactly once.
    let mut submitted: Vec<_> = state
        .submits
        .iter()
        .flat_map(|s| s.buffers.iter().copied())
        .collect();
    let total = submitted.len();
    submitted.sort();
    submitted.dedup();
    assert_eq!(submitted.len(), total);

    //The last submission is the swapchain transition: it signals the
    //presented semaphore, carries a fence, and waits on the terminal
    //graphics signal.
    let last = state.submits.last().unwrap();
    assert_eq!(last.queue, QueueKind::Graphics);
    assert!(last.fence.is_some());
    assert_eq!(last.signals, vec![state.presents[0]]);
    let (final_gfx, _) = last.waits[0];
    let producer = state
        .submits
        .iter()
        .filter(|s| s.queue == QueueKind::Graphics)
        .find(|s| s.signals.contains(&final_gfx));
    assert!(producer.is_some());

    //The transfer queue's trailing submission carries its fence.
    let transfer = state
        .submits
        .iter()
        .find(|s| s.queue == QueueKind::Transfer)
        .unwrap();
    assert!(transfer.fence.is_some());
}

#[test]
fn concurrent_builds_serialize() {
    let graph = Arc::new(graph());
    graph.gather_descriptors().unwrap();

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let graph = graph.clone();
            std::thread::spawn(move || graph.build().unwrap())
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let state = graph.device().state();
    assert_eq!(state.presents.len(), 2);
}

#[test]
fn structural_render_layouts_share_native_objects() {
    let graph = graph();
    graph.register_image("target_a", color_target(1300));
    graph.register_image("target_b", color_target(1310));
    for name in ["first", "second"] {
        graph.register_graphics_pass(GraphicsPass {
            name: name.into(),
            vertex_shader: "vert".into(),
            fragment_shader: "frag".into(),
            usages: vec![ResourceUsageEntry::uniform(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
            render_layout: single_color_layout(),
            raster: Default::default(),
            bindings: Vec::new(),
            push_constant_size: 0,
        });
    }
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        draw_op("first")
            .with_resources(["target_a"])
            .with_color_attachments(["target_a"]),
        draw_op("second")
            .with_resources(["target_b"])
            .with_color_attachments(["target_b"]),
    ]);
    graph.build().unwrap();

    let state = graph.device().state();
    //Identical layouts share one render pass; distinct attachment sets get
    //their own framebuffers.
    assert_eq!(state.render_passes_created, 1);
    assert_eq!(state.framebuffers_created, 2);
}

#[test]
fn preinitialized_buffer_view_needs_no_barrier() {
    let graph = graph();
    graph.register_buffer_view_with_state(
        "texels",
        BufferView {
            inner: BufferViewHandle(1400),
            buffer: BufferHandle(1401),
            format: vk::Format::R32_SFLOAT,
        },
        ResourceState {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::UNDEFINED,
            ownership: QueueOwnership::Owned(GFX_FAMILY),
        },
    );
    graph.register_compute_pass(ComputePass {
        name: "sample".into(),
        shader: "comp".into(),
        usages: vec![ResourceUsageEntry::buffer(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_READ,
        )],
        is_async: false,
        bindings: Vec::new(),
        push_constant_size: 0,
    });
    graph.gather_descriptors().unwrap();

    graph.queue_ops([
        GpuOp::new("sample", OpCommand::Dispatch { groups: [1, 1, 1] }).with_resources(["texels"]),
    ]);
    graph.build().unwrap();

    //The registered state already matches the pass's start state, so
    //reconciliation emits nothing for the view's parent buffer.
    let state = graph.device().state();
    let barriers = state
        .commands
        .values()
        .flatten()
        .filter(|c| matches!(c, MockCommand::BufferBarrier(b) if b.buffer == BufferHandle(1401)))
        .count();
    assert_eq!(barriers, 0);
}

#[test]
fn frame_ring_waits_before_reuse() {
    let graph = graph();
    graph.gather_descriptors().unwrap();

    graph.build().unwrap();
    graph.build().unwrap();
    //Third frame reuses slot 0 and must wait its fence first.
    graph.build().unwrap();

    let state = graph.device().state();
    assert!(!state.fence_waits.is_empty());
    assert_eq!(state.presents.len(), 3);
}
