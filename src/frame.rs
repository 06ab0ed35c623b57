// =============================================================================
// FRAME LOOP - acquire / submit / present ordering
// =============================================================================
//
// One frame:
//   acquire  (signal image_available)
//   submit   (wait image_available @ COLOR_ATTACHMENT_OUTPUT, signal render_finished)
//   present  (wait render_finished)
//
// Out-of-date and suboptimal results schedule a swapchain rebuild, which runs
// before the next acquire. A shader reload that fails to load keeps the
// current pipeline. Everything else the backend reports is fatal.

use anyhow::Result;
use ash::vk;

/// The semaphore pair a frame is gated by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSemaphores {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

/// Result of asking the presentation engine for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    Skipped,
}

/// GPU-side operations a frame is built from
pub trait FrameBackend {
    /// Rewrite per-frame data (uniform transform) before the image is acquired
    fn update(&mut self) -> Result<()>;

    /// Acquire the next swapchain image with an unbounded timeout
    fn acquire(&mut self, signal: vk::Semaphore) -> Result<Acquired>;

    /// Submit the prerecorded command buffer for `image_index`
    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
    ) -> Result<()>;

    /// Queue the image for presentation; true means the swapchain needs a rebuild
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool>;

    /// Reload shader code from disk for the next rebuild. On error the
    /// previously loaded code must stay in place.
    fn stage_shaders(&mut self) -> Result<()>;

    /// Wait idle and recreate everything that depends on the swapchain
    fn rebuild(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct FrameLoop {
    needs_rebuild: bool,
    reload_pending: bool,
    frames_presented: u64,
}

impl FrameLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window resize or fullscreen toggle
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Shader files changed on disk
    pub fn request_shader_reload(&mut self) {
        self.reload_pending = true;
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn draw_frame<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        semaphores: FrameSemaphores,
    ) -> Result<FrameStatus> {
        if self.reload_pending {
            self.reload_pending = false;
            match backend.stage_shaders() {
                Ok(()) => self.needs_rebuild = true,
                Err(e) => log::warn!("Shader reload failed, keeping current pipeline: {:#}", e),
            }
        }

        if self.needs_rebuild {
            backend.rebuild()?;
            self.needs_rebuild = false;
        }

        backend.update()?;

        let image_index = match backend.acquire(semaphores.image_available)? {
            Acquired::Image { index, suboptimal } => {
                // The semaphore is signaled either way, so the frame still goes out
                if suboptimal {
                    self.needs_rebuild = true;
                }
                index
            }
            Acquired::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                self.needs_rebuild = true;
                return Ok(FrameStatus::Skipped);
            }
        };

        backend.submit(
            image_index,
            semaphores.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            semaphores.render_finished,
        )?;

        if backend.present(image_index, semaphores.render_finished)? {
            log::debug!("Swapchain suboptimal or out of date on present");
            self.needs_rebuild = true;
        }

        self.frames_presented += 1;
        Ok(FrameStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Update,
        Acquire { signal: vk::Semaphore },
        Submit {
            image: u32,
            wait: vk::Semaphore,
            stage: vk::PipelineStageFlags,
            signal: vk::Semaphore,
        },
        Present { image: u32, wait: vk::Semaphore },
        StageShaders,
        Rebuild,
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Vec<Call>,
        acquire_results: VecDeque<Acquired>,
        present_results: VecDeque<bool>,
        next_image: u32,
        image_count: u32,
        fail_submit: bool,
        shader_results: VecDeque<bool>,
    }

    impl MockBackend {
        fn new(image_count: u32) -> Self {
            Self {
                image_count,
                ..Default::default()
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn update(&mut self) -> Result<()> {
            self.calls.push(Call::Update);
            Ok(())
        }

        fn acquire(&mut self, signal: vk::Semaphore) -> Result<Acquired> {
            self.calls.push(Call::Acquire { signal });
            Ok(self.acquire_results.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                Acquired::Image {
                    index,
                    suboptimal: false,
                }
            }))
        }

        fn submit(
            &mut self,
            image: u32,
            wait: vk::Semaphore,
            stage: vk::PipelineStageFlags,
            signal: vk::Semaphore,
        ) -> Result<()> {
            if self.fail_submit {
                anyhow::bail!("device lost");
            }
            self.calls.push(Call::Submit {
                image,
                wait,
                stage,
                signal,
            });
            Ok(())
        }

        fn present(&mut self, image: u32, wait: vk::Semaphore) -> Result<bool> {
            self.calls.push(Call::Present { image, wait });
            Ok(self.present_results.pop_front().unwrap_or(false))
        }

        fn stage_shaders(&mut self) -> Result<()> {
            self.calls.push(Call::StageShaders);
            if !self.shader_results.pop_front().unwrap_or(true) {
                anyhow::bail!("Invalid SPIR-V bytecode: input missing SPIR-V magic number");
            }
            Ok(())
        }

        fn rebuild(&mut self) -> Result<()> {
            self.calls.push(Call::Rebuild);
            self.next_image = 0;
            Ok(())
        }
    }

    fn semaphores() -> FrameSemaphores {
        FrameSemaphores {
            image_available: vk::Semaphore::from_raw(1),
            render_finished: vk::Semaphore::from_raw(2),
        }
    }

    /// Every presented frame must be acquire, submit, present with the
    /// semaphores chained through, and nothing else in between.
    fn assert_well_ordered(calls: &[Call], sems: FrameSemaphores) {
        let mut i = 0;
        while i < calls.len() {
            match calls[i] {
                Call::Acquire { signal } => {
                    assert_eq!(signal, sems.image_available);
                    match calls.get(i + 1) {
                        Some(&Call::Submit { image, wait, stage, signal }) => {
                            assert_eq!(wait, sems.image_available);
                            assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
                            assert_eq!(signal, sems.render_finished);
                            assert_eq!(
                                calls.get(i + 2),
                                Some(&Call::Present {
                                    image,
                                    wait: sems.render_finished
                                })
                            );
                            i += 3;
                        }
                        // Out-of-date acquire: frame dropped, rebuild comes next
                        Some(Call::Update) | Some(Call::StageShaders) | Some(Call::Rebuild) | None => {
                            i += 1
                        }
                        other => panic!("unexpected call after acquire: {:?}", other),
                    }
                }
                Call::Submit { .. } | Call::Present { .. } => {
                    panic!("{:?} without a preceding acquire at {}", calls[i], i)
                }
                Call::Update | Call::StageShaders | Call::Rebuild => i += 1,
            }
        }
    }

    #[test]
    fn steady_state_frame_order() {
        let sems = semaphores();
        let mut backend = MockBackend::new(3);
        let mut frames = FrameLoop::new();

        for _ in 0..3 {
            assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Presented);
        }

        assert_eq!(frames.frames_presented(), 3);
        assert_eq!(
            &backend.calls[..4],
            &[
                Call::Update,
                Call::Acquire {
                    signal: sems.image_available
                },
                Call::Submit {
                    image: 0,
                    wait: sems.image_available,
                    stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    signal: sems.render_finished,
                },
                Call::Present {
                    image: 0,
                    wait: sems.render_finished
                },
            ]
        );
        assert!(!backend.calls.contains(&Call::Rebuild));
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn resize_request_rebuilds_before_next_acquire() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        let mut frames = FrameLoop::new();

        frames.draw_frame(&mut backend, sems).unwrap();
        frames.request_rebuild();
        assert!(frames.needs_rebuild);
        frames.draw_frame(&mut backend, sems).unwrap();

        let rebuild_at = backend.calls.iter().position(|c| *c == Call::Rebuild).unwrap();
        assert_eq!(rebuild_at, 4);
        assert_eq!(backend.calls[rebuild_at + 1], Call::Update);
        assert!(matches!(backend.calls[rebuild_at + 2], Call::Acquire { .. }));
        assert!(!frames.needs_rebuild);
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_rebuilds() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        backend.acquire_results.push_back(Acquired::OutOfDate);
        let mut frames = FrameLoop::new();

        assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Skipped);
        assert!(frames.needs_rebuild);
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Submit { .. })));

        assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.calls[2], Call::Rebuild);
        assert_eq!(frames.frames_presented(), 1);
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        backend.acquire_results.push_back(Acquired::Image {
            index: 1,
            suboptimal: true,
        });
        let mut frames = FrameLoop::new();

        assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Presented);
        assert!(frames.needs_rebuild);
        assert!(backend.calls.contains(&Call::Present {
            image: 1,
            wait: sems.render_finished
        }));
    }

    #[test]
    fn present_reporting_stale_swapchain_schedules_rebuild() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        backend.present_results.push_back(true);
        let mut frames = FrameLoop::new();

        frames.draw_frame(&mut backend, sems).unwrap();
        assert!(frames.needs_rebuild);

        frames.draw_frame(&mut backend, sems).unwrap();
        assert_eq!(backend.calls.iter().filter(|c| **c == Call::Rebuild).count(), 1);
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn ordering_holds_under_repeated_resizes() {
        let sems = semaphores();
        let mut backend = MockBackend::new(3);
        let mut frames = FrameLoop::new();

        for frame in 0..20 {
            if frame % 3 == 0 {
                frames.request_rebuild();
            }
            if frame % 7 == 0 {
                backend.acquire_results.push_back(Acquired::OutOfDate);
            }
            if frame % 5 == 0 {
                backend.present_results.push_back(true);
            }
            frames.draw_frame(&mut backend, sems).unwrap();
        }

        assert_well_ordered(&backend.calls, sems);
        assert!(frames.frames_presented() > 0);
    }

    #[test]
    fn shader_reload_rebuilds_with_new_code() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        let mut frames = FrameLoop::new();

        frames.draw_frame(&mut backend, sems).unwrap();
        frames.request_shader_reload();
        frames.draw_frame(&mut backend, sems).unwrap();

        assert_eq!(&backend.calls[4..7], &[Call::StageShaders, Call::Rebuild, Call::Update]);
        assert!(!frames.reload_pending);
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn failed_shader_reload_keeps_rendering() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        backend.shader_results.push_back(false);
        let mut frames = FrameLoop::new();

        frames.request_shader_reload();
        assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.calls[0], Call::StageShaders);
        assert!(!backend.calls.contains(&Call::Rebuild));
        assert!(!frames.needs_rebuild);

        // The next save with valid code goes through
        frames.request_shader_reload();
        assert_eq!(frames.draw_frame(&mut backend, sems).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.calls.iter().filter(|c| **c == Call::Rebuild).count(), 1);
        assert_eq!(frames.frames_presented(), 2);
        assert_well_ordered(&backend.calls, sems);
    }

    #[test]
    fn backend_errors_are_fatal() {
        let sems = semaphores();
        let mut backend = MockBackend::new(2);
        backend.fail_submit = true;
        let mut frames = FrameLoop::new();

        assert!(frames.draw_frame(&mut backend, sems).is_err());
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Present { .. })));
        assert_eq!(frames.frames_presented(), 0);
    }
}
