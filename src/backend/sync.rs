// Synchronization primitives
//
// One acquire/release semaphore pair for the lifetime of the frame loop.
// With a single frame in flight and a device-idle wait per frame, no
// fences are needed.

use anyhow::Result;
use ash::vk;

use crate::frame::FrameBackend;

pub struct FrameSync {
    /// Signalled when the presentation engine hands over the image
    pub acquire: vk::Semaphore,
    /// Signalled when rendering into the image has finished
    pub release: vk::Semaphore,
}

impl FrameSync {
    pub fn new<B: FrameBackend + ?Sized>(backend: &B) -> Result<Self> {
        let acquire = backend.create_semaphore()?;
        let release = match backend.create_semaphore() {
            Ok(release) => release,
            Err(e) => {
                backend.destroy_semaphore(acquire);
                return Err(e);
            }
        };

        Ok(Self { acquire, release })
    }

    pub fn destroy<B: FrameBackend + ?Sized>(&self, backend: &B) {
        backend.destroy_semaphore(self.release);
        backend.destroy_semaphore(self.acquire);
    }
}
