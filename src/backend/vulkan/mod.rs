//! Vulkan device implementation using ash
//!
//! Events, fences and semaphores map one to one onto their Vulkan objects.
//! Sync file interop goes through `VK_KHR_external_fence_fd` and
//! `VK_KHR_external_semaphore_fd` with the `SYNC_FD` handle type.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{SyncError, SyncResult};
use ash::khr::{external_fence_fd, external_semaphore_fd};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

/// Vulkan implementation of [`SyncDevice`]
pub struct VulkanDevice {
    device: ash::Device,
    queue: vk::Queue,
    external_fence_fd_fn: external_fence_fd::Device,
    external_semaphore_fd_fn: external_semaphore_fd::Device,
    /// Pool for batch command buffers, externally synchronized.
    command_pool: Mutex<vk::CommandPool>,
    /// Command buffers in flight, keyed by the raw fence that tracks them.
    in_flight_commands: Mutex<HashMap<u64, vk::CommandBuffer>>,
    /// vkQueueSubmit requires external synchronization of the queue.
    queue_lock: Mutex<()>,
    name: String,
}

impl VulkanDevice {
    /// Device extensions that must be enabled on `device`.
    pub fn required_extensions() -> [&'static CStr; 2] {
        [external_fence_fd::NAME, external_semaphore_fd::NAME]
    }

    /// Wraps an existing device and one of its queues.
    ///
    /// The device must have been created with [`required_extensions`](Self::required_extensions).
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> SyncResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            queue_family_index,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };

        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(SyncError::device("vkCreateCommandPool"))?;

        let external_fence_fd_fn = external_fence_fd::Device::new(instance, &device);
        let external_semaphore_fd_fn = external_semaphore_fd::Device::new(instance, &device);

        log::info!("Vulkan sync device ready (queue family {})", queue_family_index);

        Ok(Self {
            device,
            queue,
            external_fence_fd_fn,
            external_semaphore_fd_fn,
            command_pool: Mutex::new(command_pool),
            in_flight_commands: Mutex::new(HashMap::new()),
            queue_lock: Mutex::new(()),
            name: format!("Vulkan (queue family {})", queue_family_index),
        })
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn record_batch(&self, batch: &SubmitBatch) -> VkResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();

        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: *pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };

        unsafe {
            let cmd = self.device.allocate_command_buffers(&alloc_info)?[0];

            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };

            let recorded = self
                .device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|()| {
                    for command in &batch.commands {
                        self.encode(cmd, command);
                    }
                    self.device.end_command_buffer(cmd)
                });

            match recorded {
                Ok(()) => Ok(cmd),
                Err(e) => {
                    self.device.free_command_buffers(*pool, &[cmd]);
                    Err(e)
                }
            }
        }
    }

    unsafe fn encode(&self, cmd: vk::CommandBuffer, command: &Command) {
        match command {
            Command::SetEvent { event, stage } => {
                self.device.cmd_set_event(cmd, *event, *stage);
            }
            Command::WaitEvents {
                events,
                src_stage,
                dst_stage,
            } => {
                self.device
                    .cmd_wait_events(cmd, events, *src_stage, *dst_stage, &[], &[], &[]);
            }
            Command::FillBuffer {
                buffer,
                offset,
                size,
                data,
            } => {
                self.device
                    .cmd_fill_buffer(cmd, *buffer, *offset, *size, *data);
            }
        }
    }

    fn free_commands_for(&self, fence: vk::Fence) {
        if let Some(cmd) = self.in_flight_commands.lock().remove(&fence.as_raw()) {
            let pool = self.command_pool.lock();
            unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
        }
    }
}

impl SyncDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let info = vk::EventCreateInfo::default();
        unsafe { self.device.create_event(&info, None) }
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) };
    }

    fn event_status(&self, event: vk::Event) -> vk::Result {
        match unsafe { self.device.get_event_status(event) } {
            Ok(true) => vk::Result::EVENT_SET,
            Ok(false) => vk::Result::EVENT_RESET,
            Err(e) => e,
        }
    }

    fn create_fence(&self, kind: FenceKind) -> VkResult<vk::Fence> {
        let mut export_info = vk::ExportFenceCreateInfo::default()
            .handle_types(vk::ExternalFenceHandleTypeFlags::SYNC_FD);

        let mut info = vk::FenceCreateInfo::default();
        if kind == FenceKind::Exportable {
            info = info.push_next(&mut export_info);
        }

        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.free_commands_for(fence);
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_status(&self, fence: vk::Fence) -> vk::Result {
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(true) => vk::Result::SUCCESS,
            Ok(false) => vk::Result::NOT_READY,
            Err(e) => e,
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => vk::Result::SUCCESS,
            Err(e) => e,
        }
    }

    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<OwnedFd> {
        let info = vk::FenceGetFdInfoKHR::default()
            .fence(fence)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD);

        let fd = unsafe { self.external_fence_fd_fn.get_fence_fd(&info)? };
        // SAFETY: a successful export hands us a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn import_fence_fd(&self, fence: vk::Fence, fd: OwnedFd) -> VkResult<()> {
        let raw = fd.into_raw_fd();
        let info = vk::ImportFenceFdInfoKHR::default()
            .fence(fence)
            .flags(vk::FenceImportFlags::TEMPORARY)
            .handle_type(vk::ExternalFenceHandleTypeFlags::SYNC_FD)
            .fd(raw);

        unsafe { self.external_fence_fd_fn.import_fence_fd(&info) }.map_err(|e| {
            // A failed import leaves ownership with us.
            drop(unsafe { OwnedFd::from_raw_fd(raw) });
            e
        })
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn import_semaphore_fd(&self, semaphore: vk::Semaphore, fd: OwnedFd) -> VkResult<()> {
        let raw = fd.into_raw_fd();
        let info = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(semaphore)
            .flags(vk::SemaphoreImportFlags::TEMPORARY)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
            .fd(raw);

        unsafe { self.external_semaphore_fd_fn.import_semaphore_fd(&info) }.map_err(|e| {
            drop(unsafe { OwnedFd::from_raw_fd(raw) });
            e
        })
    }

    fn queue_submit(
        &self,
        priority: QueuePriority,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let cmd = if batch.commands.is_empty() {
            None
        } else {
            Some(self.record_batch(batch)?)
        };

        let semaphores: Vec<vk::Semaphore> =
            batch.wait_semaphores.iter().map(|w| w.semaphore).collect();
        let stages: Vec<vk::PipelineStageFlags> =
            batch.wait_semaphores.iter().map(|w| w.stage).collect();
        let command_buffers: Vec<vk::CommandBuffer> = cmd.into_iter().collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&command_buffers);

        log::trace!(
            "vkQueueSubmit ({:?}): {} commands, {} wait semaphores",
            priority,
            batch.commands.len(),
            semaphores.len()
        );

        let result = {
            let _queue = self.queue_lock.lock();
            unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
        };

        match (result, cmd) {
            (Ok(()), Some(cmd)) if fence != vk::Fence::null() => {
                self.in_flight_commands.lock().insert(fence.as_raw(), cmd);
                Ok(())
            }
            (Ok(()), Some(cmd)) => {
                // Nothing tracks this submission; wait before freeing its commands.
                log::warn!("Untracked command submission, waiting for queue idle");
                let _queue = self.queue_lock.lock();
                unsafe {
                    self.device.queue_wait_idle(self.queue)?;
                    self.device
                        .free_command_buffers(*self.command_pool.lock(), &[cmd]);
                }
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), cmd) => {
                if let Some(cmd) = cmd {
                    unsafe {
                        self.device
                            .free_command_buffers(*self.command_pool.lock(), &[cmd]);
                    }
                }
                Err(e)
            }
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed during teardown: {}", e);
            }
            let pool = *self.command_pool.lock();
            let commands: Vec<_> = self.in_flight_commands.lock().drain().map(|(_, c)| c).collect();
            if !commands.is_empty() {
                self.device.free_command_buffers(pool, &commands);
            }
            self.device.destroy_command_pool(pool, None);
        }
    }
}
