//! Common types shared between device implementations

use ash::vk;

/// Completion token for queue work.
///
/// Every submission carries one. Serials are handed out in increasing order,
/// so "serial `s` has completed" can be answered by comparing against the
/// queue's last completed serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Serial(u64);

impl Serial {
    /// The serial before any submission. Always complete.
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Queue priority requested by a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Fence creation flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Plain fence used to track submissions.
    Plain,
    /// Fence whose payload can be exported and imported as a sync file descriptor.
    Exportable,
}

/// A command recorded into a context's command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetEvent {
        event: vk::Event,
        stage: vk::PipelineStageFlags,
    },
    WaitEvents {
        events: Vec<vk::Event>,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    FillBuffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
}

/// A semaphore the next submission waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSemaphore {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// Everything handed to the queue in one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub commands: Vec<Command>,
    pub wait_semaphores: Vec<WaitSemaphore>,
}

impl SubmitBatch {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.wait_semaphores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_ordering() {
        let first = Serial::ZERO.next();
        let second = first.next();
        assert!(Serial::ZERO < first);
        assert!(first < second);
        assert_eq!(second.value(), 2);
        assert_eq!(second.to_string(), "#2");
    }

    #[test]
    fn test_empty_batch() {
        let mut batch = SubmitBatch::default();
        assert!(batch.is_empty());
        batch.commands.push(Command::FillBuffer {
            buffer: vk::Buffer::null(),
            offset: 0,
            size: 4,
            data: 7,
        });
        assert!(!batch.is_empty());
    }
}
