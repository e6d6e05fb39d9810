//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Per-slot synchronization: the acquire semaphore and the slot's fence.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled when the acquired image is ready to be rendered to.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's submission has finished executing.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources. The fence starts signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let image_available = create_semaphore(device)?;
        let in_flight = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(e);
            }
        };
        Ok(Self {
            image_available,
            in_flight,
        })
    }

    /// Wait for this slot's previous submission to finish.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        device.wait_for_fences(&[self.in_flight], true, u64::MAX)?;
        Ok(())
    }

    /// Reset the fence before it is handed to a new submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_fences(&[self.in_flight])?;
        Ok(())
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Frame slots plus one render-finished semaphore per swapchain image.
///
/// Slots cycle independently of the image index the swapchain hands out, so
/// the semaphore a present waits on belongs to the image, not the slot.
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    render_finished: Vec<vk::Semaphore>,
    current_frame: usize,
}

impl FrameSyncManager {
    /// Create `image_count` frame slots and `image_count` render-finished semaphores.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, image_count: usize) -> Result<Self> {
        if image_count == 0 {
            return Err(GpuError::InvalidState(
                "frame sync needs at least one swapchain image".into(),
            ));
        }

        let mut manager = Self {
            frame_syncs: Vec::with_capacity(image_count),
            render_finished: Vec::with_capacity(image_count),
            current_frame: 0,
        };

        for _ in 0..image_count {
            let created = FrameSync::new(device).and_then(|sync| {
                manager.frame_syncs.push(sync);
                create_semaphore(device)
            });
            match created {
                Ok(semaphore) => manager.render_finished.push(semaphore),
                Err(e) => {
                    manager.destroy(device);
                    return Err(e);
                }
            }
        }

        tracing::debug!("Created sync objects for {image_count} frames in flight");
        Ok(manager)
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.current_frame]
    }

    /// Advance to the next frame slot.
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frame_syncs.len();
    }

    /// Semaphore signaled when rendering to swapchain image `image_index` completes.
    pub fn render_finished(&self, image_index: u32) -> Result<vk::Semaphore> {
        self.render_finished
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "image index {image_index} out of range for {} images",
                    self.render_finished.len()
                ))
            })
    }

    /// Every slot's fence.
    pub fn in_flight_fences(&self) -> Vec<vk::Fence> {
        self.frame_syncs.iter().map(|sync| sync.in_flight).collect()
    }

    /// Block until no slot has work executing.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&self, device: &ash::Device) -> Result<()> {
        device.wait_for_fences(&self.in_flight_fences(), true, u64::MAX)?;
        Ok(())
    }

    /// Destroy all resources.
    ///
    /// # Safety
    /// The device must be valid and all resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for sync in &self.frame_syncs {
            sync.destroy(device);
        }
        for &semaphore in &self.render_finished {
            device.destroy_semaphore(semaphore, None);
        }
    }

    #[cfg(test)]
    fn from_parts(frame_syncs: Vec<FrameSync>, render_finished: Vec<vk::Semaphore>) -> Self {
        Self {
            frame_syncs,
            render_finished,
            current_frame: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn manager(count: u64) -> FrameSyncManager {
        let syncs = (0..count)
            .map(|i| FrameSync {
                image_available: vk::Semaphore::from_raw(100 + i),
                in_flight: vk::Fence::from_raw(200 + i),
            })
            .collect();
        let finished = (0..count).map(|i| vk::Semaphore::from_raw(300 + i)).collect();
        FrameSyncManager::from_parts(syncs, finished)
    }

    #[test]
    fn advance_wraps_around_slots() {
        let mut sync = manager(3);
        let visited: Vec<usize> = (0..7)
            .map(|_| {
                let slot = sync.current_frame;
                sync.advance();
                slot
            })
            .collect();

        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn current_slot_owns_its_semaphore_and_fence() {
        let mut sync = manager(2);
        sync.advance();

        assert_eq!(sync.current().image_available.as_raw(), 101);
        assert_eq!(sync.current().in_flight.as_raw(), 201);
        assert_eq!(sync.frame_syncs.len(), 2);
    }

    #[test]
    fn render_finished_is_indexed_by_image() {
        let sync = manager(3);

        assert_eq!(sync.render_finished(2).unwrap().as_raw(), 302);
        assert!(matches!(
            sync.render_finished(3),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn every_slot_fence_is_waited_on() {
        let sync = manager(3);
        let fences: Vec<u64> = sync.in_flight_fences().iter().map(|f| f.as_raw()).collect();
        assert_eq!(fences, vec![200, 201, 202]);
    }
}
