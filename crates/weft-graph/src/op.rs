//! Ops: the per-frame work items. An op instantiates a registered pass with
//! concrete resource names plus the command to record. Ops are queued from
//! any thread and drained by the compiler in queue order, exactly once.

use std::{
    collections::VecDeque,
    sync::Mutex,
};

use ash::vk;

///Direction of a buffer/image transfer. `Unspecified` is the default and is
/// rejected at compile time, the caller must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferDirection {
    #[default]
    Unspecified,
    ///Buffer to image upload.
    Stage,
    ///Image to buffer readback.
    Download,
}

///What gets recorded for an op after barriers and binds are in place.
#[derive(Debug, Clone)]
pub enum OpCommand {
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    ///Buffer-to-buffer copy, or a buffer/image copy depending on the pass
    /// kind. `extent` is only consulted for image transfers.
    Transfer {
        direction: TransferDirection,
        region: vk::BufferCopy,
        extent: vk::Extent3D,
    },
    BuildGeometry {
        geometry: u64,
        primitive_count: u32,
    },
    Intersect {
        geometry: u64,
        extent: [u32; 3],
    },
}

///One queued work item. Resource names align positionally with the pass's
/// usage slots. Attachments always take part in state reconciliation: an
/// attachment listed in `resources` uses its pass usage slot, one that is
/// not gets the usage its render-layout slot implies.
#[derive(Debug, Clone)]
pub struct GpuOp {
    pub pass: String,
    pub resources: Vec<String>,
    pub color_attachments: Vec<String>,
    pub depth_attachment: Option<String>,
    pub push_constants: Option<Vec<u8>>,
    pub command: OpCommand,
}

impl GpuOp {
    pub fn new(pass: impl Into<String>, command: OpCommand) -> Self {
        GpuOp {
            pass: pass.into(),
            resources: Vec::new(),
            color_attachments: Vec::new(),
            depth_attachment: None,
            push_constants: None,
            command,
        }
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_color_attachments<I, S>(mut self, attachments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.color_attachments = attachments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_depth_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.depth_attachment = Some(attachment.into());
        self
    }

    pub fn with_push_constants(mut self, bytes: Vec<u8>) -> Self {
        self.push_constants = Some(bytes);
        self
    }
}

///Thread-safe FIFO of queued ops.
pub(crate) struct OpQueue {
    ops: Mutex<VecDeque<GpuOp>>,
}

impl OpQueue {
    pub fn new() -> Self {
        OpQueue {
            ops: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push<I: IntoIterator<Item = GpuOp>>(&self, ops: I) {
        self.ops.lock().unwrap().extend(ops);
    }

    ///Takes every queued op, leaving the queue empty.
    pub fn drain(&self) -> VecDeque<GpuOp> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_in_order_and_empties() {
        let queue = OpQueue::new();
        queue.push([
            GpuOp::new("a", OpCommand::Dispatch { groups: [1, 1, 1] }),
            GpuOp::new("b", OpCommand::Dispatch { groups: [1, 1, 1] }),
        ]);
        queue.push([GpuOp::new("c", OpCommand::Dispatch { groups: [1, 1, 1] })]);

        let drained: Vec<_> = queue.drain().into_iter().map(|op| op.pass).collect();
        assert_eq!(drained, ["a", "b", "c"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn transfer_direction_defaults_to_unspecified() {
        assert_eq!(TransferDirection::default(), TransferDirection::Unspecified);
    }
}
