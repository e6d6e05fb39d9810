//! The frame loop: acquire, update, submit, present.

use std::time::{Duration, Instant};

use prism_gpu::{AcquireOutcome, ColorUniform, PresentOutcome};

/// Window events the loop reacts to.
pub trait EventSource {
    /// Process pending events without blocking.
    fn poll_events(&mut self);

    /// Block briefly for events; used while nothing can be presented.
    fn wait_events(&mut self) {
        self.poll_events();
    }

    /// Whether the user asked to close the window.
    fn should_close(&self) -> bool;

    /// Whether the window was resized since the last call.
    fn take_resized(&mut self) -> bool;
}

/// The GPU side of a frame.
pub trait FrameBackend {
    /// Wait for the current frame slot and acquire a swapchain image.
    fn acquire_image(&mut self) -> anyhow::Result<AcquireOutcome>;

    /// Write the per-frame uniform once no submitted frame can still read it.
    fn update_uniform(&mut self, uniform: &ColorUniform) -> anyhow::Result<()>;

    /// Submit the command buffer recorded for swapchain image `image_index`.
    fn submit(&mut self, image_index: u32) -> anyhow::Result<()>;

    /// Present swapchain image `image_index`.
    fn present(&mut self, image_index: u32) -> anyhow::Result<PresentOutcome>;

    /// Rebuild everything that depends on the swapchain.
    ///
    /// Returns `false` when the surface currently has no area (minimized).
    fn rebuild_swapchain(&mut self) -> anyhow::Result<bool>;

    /// Wait until the device has finished all submitted work.
    fn wait_idle(&mut self) -> anyhow::Result<()>;
}

/// Statistics gathered over a run of the frame loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    /// Frames submitted and presented.
    pub frames: u64,
    /// Successful swapchain rebuilds.
    pub rebuilds: u32,
    /// Wall time spent in the loop.
    pub elapsed: Duration,
    pub min_fps: f64,
    pub max_fps: f64,
    fps_sum: f64,
    fps_samples: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frames: 0,
            rebuilds: 0,
            elapsed: Duration::ZERO,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            fps_samples: 0,
        }
    }
}

impl FrameStats {
    fn record_frame(&mut self, dt: f64) {
        self.frames += 1;
        if dt > 0.0 {
            let fps = 1.0 / dt;
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
            self.fps_samples += 1;
        }
    }

    /// Mean of the per-frame FPS samples. Frames with no measurable
    /// duration are not samples.
    pub fn avg_fps(&self) -> f64 {
        if self.fps_samples == 0 {
            0.0
        } else {
            self.fps_sum / self.fps_samples as f64
        }
    }
}

/// Drives an [`EventSource`] and a [`FrameBackend`] until the window closes.
pub struct FrameLoop {
    start: Instant,
    last_frame: Instant,
    needs_rebuild: bool,
    stats: FrameStats,
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLoop {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            needs_rebuild: false,
            stats: FrameStats::default(),
        }
    }

    /// Run until `events` reports a close request, then wait for the device once.
    pub fn run<E, B>(mut self, events: &mut E, backend: &mut B) -> anyhow::Result<FrameStats>
    where
        E: EventSource + ?Sized,
        B: FrameBackend + ?Sized,
    {
        while !events.should_close() {
            events.poll_events();
            if events.take_resized() {
                self.needs_rebuild = true;
            }

            if self.needs_rebuild {
                if !backend.rebuild_swapchain()? {
                    events.wait_events();
                    continue;
                }
                self.needs_rebuild = false;
                self.stats.rebuilds += 1;
            }

            self.frame(backend)?;
        }

        backend.wait_idle()?;

        self.stats.elapsed = self.start.elapsed();
        Ok(self.stats)
    }

    fn frame<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> anyhow::Result<()> {
        let (index, suboptimal) = match backend.acquire_image()? {
            AcquireOutcome::Ready { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Swapchain out of date on acquire");
                self.needs_rebuild = true;
                return Ok(());
            }
        };

        let uniform = ColorUniform::from_elapsed(self.start.elapsed().as_secs_f32());
        backend.update_uniform(&uniform)?;
        backend.submit(index)?;

        if backend.present(index)? == PresentOutcome::NeedsRebuild || suboptimal {
            self.needs_rebuild = true;
        }

        let now = Instant::now();
        self.stats
            .record_frame(now.duration_since(self.last_frame).as_secs_f64());
        self.last_frame = now;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::VecDeque;

    /// Closes after `close_after` polls; reports resizes on the listed polls.
    struct ScriptedEvents {
        polls: usize,
        close_after: usize,
        resize_on: Vec<usize>,
        resized: bool,
        waits: usize,
    }

    impl ScriptedEvents {
        fn closing_after(close_after: usize) -> Self {
            Self {
                polls: 0,
                close_after,
                resize_on: Vec::new(),
                resized: false,
                waits: 0,
            }
        }
    }

    impl EventSource for ScriptedEvents {
        fn poll_events(&mut self) {
            self.polls += 1;
            if self.resize_on.contains(&self.polls) {
                self.resized = true;
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
        }

        fn should_close(&self) -> bool {
            self.polls >= self.close_after
        }

        fn take_resized(&mut self) -> bool {
            std::mem::take(&mut self.resized)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Acquire,
        Update,
        Submit(u32),
        Present(u32),
        Rebuild,
        WaitIdle,
    }

    #[derive(Default)]
    struct RecordingBackend {
        calls: Vec<Call>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        rebuild_results: VecDeque<bool>,
        image_count: u32,
        next_image: u32,
        last_uniform: Option<ColorUniform>,
    }

    impl RecordingBackend {
        fn with_images(image_count: u32) -> Self {
            Self {
                image_count,
                ..Default::default()
            }
        }

        fn count(&self, call: fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| call(c)).count()
        }
    }

    impl FrameBackend for RecordingBackend {
        fn acquire_image(&mut self) -> anyhow::Result<AcquireOutcome> {
            self.calls.push(Call::Acquire);
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireOutcome::Ready {
                    index,
                    suboptimal: false,
                }
            }))
        }

        fn update_uniform(&mut self, uniform: &ColorUniform) -> anyhow::Result<()> {
            self.calls.push(Call::Update);
            self.last_uniform = Some(*uniform);
            Ok(())
        }

        fn submit(&mut self, image_index: u32) -> anyhow::Result<()> {
            self.calls.push(Call::Submit(image_index));
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> anyhow::Result<PresentOutcome> {
            self.calls.push(Call::Present(image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Optimal))
        }

        fn rebuild_swapchain(&mut self) -> anyhow::Result<bool> {
            self.calls.push(Call::Rebuild);
            Ok(self.rebuild_results.pop_front().unwrap_or(true))
        }

        fn wait_idle(&mut self) -> anyhow::Result<()> {
            self.calls.push(Call::WaitIdle);
            Ok(())
        }
    }

    #[test]
    fn close_on_iteration_n_runs_exactly_n_frames() {
        let mut events = ScriptedEvents::closing_after(4);
        let mut backend = RecordingBackend::with_images(2);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(stats.frames, 4);
        assert_eq!(stats.rebuilds, 0);
        let expected: Vec<Call> = [0, 1, 0, 1]
            .into_iter()
            .flat_map(|i| [Call::Acquire, Call::Update, Call::Submit(i), Call::Present(i)])
            .chain([Call::WaitIdle])
            .collect();
        assert_eq!(backend.calls, expected);
    }

    #[test]
    fn already_closed_window_only_waits_idle() {
        let mut events = ScriptedEvents::closing_after(0);
        let mut backend = RecordingBackend::with_images(3);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(stats.frames, 0);
        assert_eq!(backend.calls, vec![Call::WaitIdle]);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_once_without_submitting() {
        let mut events = ScriptedEvents::closing_after(2);
        let mut backend = RecordingBackend::with_images(2);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(
            backend.calls,
            vec![
                Call::Acquire,
                Call::Rebuild,
                Call::Acquire,
                Call::Update,
                Call::Submit(0),
                Call::Present(0),
                Call::WaitIdle,
            ]
        );
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.rebuilds, 1);
    }

    #[test]
    fn present_requesting_rebuild_rebuilds_before_next_frame() {
        let mut events = ScriptedEvents::closing_after(2);
        let mut backend = RecordingBackend::with_images(2);
        backend.presents.push_back(PresentOutcome::NeedsRebuild);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(stats.frames, 2);
        assert_eq!(stats.rebuilds, 1);
        assert_eq!(backend.calls[4], Call::Rebuild);
    }

    #[test]
    fn suboptimal_acquire_still_presents_then_rebuilds() {
        let mut events = ScriptedEvents::closing_after(2);
        let mut backend = RecordingBackend::with_images(2);
        backend.acquires.push_back(AcquireOutcome::Ready {
            index: 1,
            suboptimal: true,
        });

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(&backend.calls[..4], &[
            Call::Acquire,
            Call::Update,
            Call::Submit(1),
            Call::Present(1)
        ]);
        assert_eq!(backend.calls[4], Call::Rebuild);
        assert_eq!(stats.frames, 2);
    }

    #[test]
    fn resize_triggers_rebuild() {
        let mut events = ScriptedEvents::closing_after(3);
        events.resize_on = vec![2];
        let mut backend = RecordingBackend::with_images(3);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(stats.rebuilds, 1);
        assert_eq!(stats.frames, 3);
        assert_eq!(backend.count(|c| *c == Call::Rebuild), 1);
    }

    #[test]
    fn minimized_window_skips_frames_until_rebuild_succeeds() {
        let mut events = ScriptedEvents::closing_after(4);
        events.resize_on = vec![1];
        let mut backend = RecordingBackend::with_images(2);
        backend.rebuild_results.extend([false, false]);

        let stats = FrameLoop::new().run(&mut events, &mut backend).unwrap();

        assert_eq!(events.waits, 2);
        assert_eq!(backend.count(|c| *c == Call::Rebuild), 3);
        assert_eq!(stats.rebuilds, 1);
        assert_eq!(stats.frames, 2);
        assert_eq!(backend.count(|c| matches!(c, Call::Submit(_))), 2);
    }

    #[test]
    fn uniform_written_every_frame_is_opaque() {
        let mut events = ScriptedEvents::closing_after(1);
        let mut backend = RecordingBackend::with_images(2);

        FrameLoop::new().run(&mut events, &mut backend).unwrap();

        let uniform = backend.last_uniform.unwrap();
        assert!((uniform.color.w - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn backend_errors_stop_the_loop() {
        struct FailingSubmit(RecordingBackend);

        impl FrameBackend for FailingSubmit {
            fn acquire_image(&mut self) -> anyhow::Result<AcquireOutcome> {
                self.0.acquire_image()
            }
            fn update_uniform(&mut self, uniform: &ColorUniform) -> anyhow::Result<()> {
                self.0.update_uniform(uniform)
            }
            fn submit(&mut self, _image_index: u32) -> anyhow::Result<()> {
                anyhow::bail!("device lost")
            }
            fn present(&mut self, image_index: u32) -> anyhow::Result<PresentOutcome> {
                self.0.present(image_index)
            }
            fn rebuild_swapchain(&mut self) -> anyhow::Result<bool> {
                self.0.rebuild_swapchain()
            }
            fn wait_idle(&mut self) -> anyhow::Result<()> {
                self.0.wait_idle()
            }
        }

        let mut events = ScriptedEvents::closing_after(5);
        let mut backend = FailingSubmit(RecordingBackend::with_images(2));

        let result = FrameLoop::new().run(&mut events, &mut backend);

        assert!(result.is_err());
        assert!(!backend.0.calls.iter().any(|c| matches!(c, Call::Present(_))));
    }

    #[test]
    fn stats_average_is_zero_without_frames() {
        assert!(FrameStats::default().avg_fps().abs() < f64::EPSILON);
    }

    #[test]
    fn zero_length_frames_do_not_skew_the_average() {
        let mut stats = FrameStats::default();
        stats.record_frame(0.01);
        stats.record_frame(0.0);
        stats.record_frame(0.02);

        assert_eq!(stats.frames, 3);
        assert_relative_eq!(stats.avg_fps(), 75.0);
        assert_relative_eq!(stats.min_fps, 50.0);
        assert_relative_eq!(stats.max_fps, 100.0);
    }

    #[test]
    fn only_zero_length_frames_average_to_zero() {
        let mut stats = FrameStats::default();
        stats.record_frame(0.0);

        assert_eq!(stats.frames, 1);
        assert!(stats.avg_fps().abs() < f64::EPSILON);
    }
}
