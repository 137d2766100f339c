use image::Rgb;
use ndarray::Array4;
use nncam::capture::{CaptureThread, FrameGrabber, FrameSource};
use nncam::config::{BlendPolicy, InferenceMode, PipelineConfig, RetryPolicy};
use nncam::segmentation::{Preprocessor, SegmentationEngine, SegmentationModel};
use nncam::{Frame, Mask, Pipeline, PipelineError, PipelineState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CAMERA: [u8; 3] = [220, 30, 30];
const BACKGROUND: [u8; 3] = [10, 10, 200];

#[derive(Debug, Clone, Copy, PartialEq)]
enum SourceMode {
    /// New frame on every poll
    Live,
    /// Nothing new
    Idle,
    /// Device reports an error
    Down,
    /// 16x16 placeholder frames
    Placeholder,
}

struct SourceControl {
    mode: SourceMode,
    restarts: u32,
    stopped: bool,
}

struct ScriptedSource {
    control: Arc<Mutex<SourceControl>>,
}

fn scripted_source() -> (ScriptedSource, Arc<Mutex<SourceControl>>) {
    let control = Arc::new(Mutex::new(SourceControl {
        mode: SourceMode::Live,
        restarts: 0,
        stopped: false,
    }));
    (
        ScriptedSource {
            control: control.clone(),
        },
        control,
    )
}

impl FrameSource for ScriptedSource {
    fn poll_frame(&mut self) -> nncam::Result<Option<Frame>> {
        match self.control.lock().mode {
            SourceMode::Live => Ok(Some(Frame::solid(64, 36, CAMERA))),
            SourceMode::Idle => Ok(None),
            SourceMode::Down => Err(PipelineError::DeviceUnavailable("unplugged".into())),
            SourceMode::Placeholder => Ok(Some(Frame::solid(16, 16, [0, 0, 0]))),
        }
    }

    fn restart(&mut self) -> nncam::Result<()> {
        let mut control = self.control.lock();
        control.restarts += 1;
        if control.mode == SourceMode::Down {
            Err(PipelineError::DeviceUnavailable("still unplugged".into()))
        } else {
            Ok(())
        }
    }

    fn stop(&mut self) {
        self.control.lock().stopped = true;
    }

    fn resolution(&self) -> (u32, u32) {
        (64, 36)
    }
}

/// Returns the same probability everywhere.
struct ConstantModel {
    value: f32,
    resets: Arc<AtomicU32>,
}

impl SegmentationModel for ConstantModel {
    fn infer(&mut self, _input: Array4<f32>) -> anyhow::Result<Mask> {
        Ok(Mask::filled(8, 8, self.value))
    }

    fn reset_state(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn input_size(&self) -> (u32, u32) {
        (8, 8)
    }
}

fn constant_engine(value: f32) -> (SegmentationEngine, Arc<AtomicU32>) {
    let resets = Arc::new(AtomicU32::new(0));
    let model = ConstantModel {
        value,
        resets: resets.clone(),
    };
    (
        SegmentationEngine::with_model(Box::new(model), Preprocessor::new(8, 8)),
        resets,
    )
}

fn config(inference: InferenceMode, threshold: f32) -> PipelineConfig {
    PipelineConfig {
        output_width: 32,
        output_height: 18,
        threshold,
        blend: BlendPolicy::Hard,
        inference,
        stall_ticks: 5,
        retry: RetryPolicy {
            initial_delay_ticks: 1,
            max_delay_ticks: 8,
            max_attempts: None,
        },
        ..PipelineConfig::default()
    }
}

fn background() -> Frame {
    Frame::solid(32, 18, BACKGROUND)
}

fn all_pixels(frame: &Frame, color: [u8; 3]) -> bool {
    frame.image().pixels().all(|p| *p == Rgb(color))
}

#[test]
fn solid_camera_over_solid_background_with_half_mask() {
    let (engine, _) = constant_engine(0.5);
    let (source, _) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.4), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    pipeline.tick().unwrap();
    let frame = pipeline.render().unwrap();
    assert_eq!(frame.dimensions(), (32, 18));
    assert!(all_pixels(frame, CAMERA));
}

#[test]
fn ready_pipeline_renders_background_until_first_frame() {
    let (engine, _) = constant_engine(1.0);
    let (source, _) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert!(all_pixels(pipeline.render().unwrap(), BACKGROUND));
    pipeline.tick().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(all_pixels(pipeline.render().unwrap(), CAMERA));
}

#[test]
fn threshold_extremes() {
    for (threshold, expected) in [(0.001, CAMERA), (0.99, BACKGROUND)] {
        let (engine, _) = constant_engine(0.05);
        let (source, _) = scripted_source();
        let mut pipeline =
            Pipeline::new(config(InferenceMode::Inline, threshold), background()).unwrap();
        pipeline
            .initialize_with_engine(engine, Box::new(source))
            .unwrap();
        pipeline.tick().unwrap();
        assert!(all_pixels(pipeline.render().unwrap(), expected));
    }
}

#[test]
fn device_loss_suspends_and_recovers_without_reloading_model() {
    let (engine, resets) = constant_engine(1.0);
    let (source, control) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    for _ in 0..10 {
        pipeline.tick().unwrap();
        pipeline.render().unwrap();
    }
    assert_eq!(pipeline.state(), PipelineState::Running);
    let frames_before = pipeline.stats().frames_ingested;

    control.lock().mode = SourceMode::Down;
    for _ in 0..50 {
        pipeline.tick().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Suspended);
        // Degraded output: the last good composite, not a blank frame.
        assert!(all_pixels(pipeline.render().unwrap(), CAMERA));
    }
    assert_eq!(pipeline.stats().frames_ingested, frames_before);
    assert!(control.lock().restarts > 0);

    control.lock().mode = SourceMode::Live;
    pipeline.tick().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(all_pixels(pipeline.render().unwrap(), CAMERA));

    let stats = pipeline.stats();
    assert_eq!(stats.model_loads, 1);
    assert_eq!(stats.device_losses, 1);
    assert_eq!(stats.restart_attempts as u32, control.lock().restarts);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.current_mask().unwrap().source_sequence(), Some(frames_before + 1));
}

#[test]
fn restart_backoff_is_capped_and_attempts_bounded() {
    let (engine, _) = constant_engine(1.0);
    let (source, control) = scripted_source();
    let mut cfg = config(InferenceMode::Inline, 0.5);
    cfg.retry = RetryPolicy {
        initial_delay_ticks: 1,
        max_delay_ticks: 4,
        max_attempts: Some(3),
    };
    let mut pipeline = Pipeline::new(cfg, background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    control.lock().mode = SourceMode::Down;
    for _ in 0..200 {
        pipeline.tick().unwrap();
        pipeline.render().unwrap();
    }
    assert_eq!(pipeline.state(), PipelineState::Suspended);
    assert_eq!(control.lock().restarts, 3);

    // Polling continues after restarts stop, so the device can still return.
    control.lock().mode = SourceMode::Live;
    pipeline.tick().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
}

#[test]
fn stalled_source_suspends_after_configured_ticks() {
    let (engine, _) = constant_engine(1.0);
    let (source, control) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();
    pipeline.tick().unwrap();

    control.lock().mode = SourceMode::Idle;
    for _ in 0..4 {
        pipeline.tick().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
    }
    pipeline.tick().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Suspended);
}

#[test]
fn placeholder_frames_count_as_device_loss() {
    let (engine, _) = constant_engine(1.0);
    let (source, control) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    control.lock().mode = SourceMode::Placeholder;
    pipeline.tick().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Suspended);
    // Nothing composited yet, so the background is shown.
    assert!(all_pixels(pipeline.render().unwrap(), BACKGROUND));
    assert!(pipeline.latest_frame().is_none());
}

#[test]
fn cooperative_processing_keeps_mask_within_interval() {
    const N: u64 = 4;
    let (engine, _) = constant_engine(1.0);
    let (source, _) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    // display tick at which each frame sequence was captured
    let mut captured_at = std::collections::HashMap::new();
    for display_tick in 0..40u64 {
        if display_tick % N == 0 {
            pipeline.tick().unwrap();
            let sequence = pipeline.latest_frame().unwrap().sequence();
            captured_at.entry(sequence).or_insert(display_tick);
        }
        pipeline.render().unwrap();

        let mask_sequence = pipeline.current_mask().unwrap().source_sequence().unwrap();
        let staleness = display_tick - captured_at[&mask_sequence];
        assert!(staleness <= N - 1, "mask {} ticks old", staleness);
    }
}

/// Holds every inference until the test releases it.
struct GatedModel {
    release: crossbeam_channel::Receiver<()>,
}

impl SegmentationModel for GatedModel {
    fn infer(&mut self, _input: Array4<f32>) -> anyhow::Result<Mask> {
        self.release.recv()?;
        Ok(Mask::filled(4, 4, 1.0))
    }

    fn input_size(&self) -> (u32, u32) {
        (4, 4)
    }
}

fn wait_for_completed(pipeline: &Pipeline, count: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.stats().inferences_completed < count {
        assert!(Instant::now() < deadline, "inference never completed");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn slow_inference_never_blocks_render() {
    const N: u64 = 3;
    let display_interval = Duration::from_millis(33);
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let engine = SegmentationEngine::with_model(
        Box::new(GatedModel {
            release: release_rx,
        }),
        Preprocessor::new(4, 4),
    );
    let (source, _) = scripted_source();
    let mut pipeline =
        Pipeline::new(config(InferenceMode::Offloaded, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    let mut completed = 0;
    for tick in 1..=31u64 {
        pipeline.tick().unwrap();

        // Each inference spans N ticks, counting the one it started on.
        if tick % (N - 1) == 1 && tick > 1 {
            release_tx.send(()).unwrap();
            completed += 1;
            wait_for_completed(&pipeline, completed);
            let age = pipeline.mask_age().unwrap();
            assert!(age <= N - 1, "mask {} frames old at tick {}", age, tick);
        }

        let start = Instant::now();
        pipeline.render().unwrap();
        assert!(start.elapsed() < display_interval);
    }

    assert!(pipeline.stats().frames_dropped > 0);
    // Let the worker finish so dispose can join it.
    drop(release_tx);
    pipeline.dispose();
    assert_eq!(pipeline.state(), PipelineState::Disposed);
}

#[test]
fn failed_model_load_leaves_pipeline_uninitialized() {
    let (source, _) = scripted_source();
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    let resources = nncam::segmentation::ResourceBundle::from_model_path("/missing/model.onnx");
    let err = pipeline.initialize(&resources, Box::new(source)).unwrap_err();
    assert!(matches!(err, PipelineError::ResourceLoadFailed(_)));
    assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    assert!(matches!(
        pipeline.render().unwrap_err(),
        PipelineError::InvalidState { .. }
    ));
}

#[test]
fn dispose_is_idempotent_and_terminal() {
    let (engine, _) = constant_engine(1.0);
    let (source, control) = scripted_source();
    let mut pipeline =
        Pipeline::new(config(InferenceMode::Offloaded, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();
    pipeline.tick().unwrap();

    pipeline.dispose();
    pipeline.dispose();
    assert_eq!(pipeline.state(), PipelineState::Disposed);
    assert!(control.lock().stopped);
    assert!(pipeline.tick().is_err());
    assert!(pipeline.render().is_err());

    let (engine, _) = constant_engine(1.0);
    let (source, _) = scripted_source();
    assert!(pipeline
        .initialize_with_engine(engine, Box::new(source))
        .is_err());
}

#[test]
fn matte_view_renders_mask_as_grayscale() {
    let (engine, _) = constant_engine(1.0);
    let (source, _) = scripted_source();
    let mut cfg = config(InferenceMode::Inline, 0.5);
    cfg.view = nncam::RenderView::Matte;
    let mut pipeline = Pipeline::new(cfg, background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    pipeline.tick().unwrap();
    let frame = pipeline.render().unwrap();
    assert_eq!(frame.dimensions(), (32, 18));
    assert!(all_pixels(frame, [255, 255, 255]));
}

#[test]
fn invalid_threshold_is_rejected_at_construction() {
    let err = Pipeline::new(config(InferenceMode::Inline, 1.0), background())
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::InvalidThreshold(_)));
}

#[test]
fn dispose_from_every_state() {
    let mut uninitialized =
        Pipeline::new(config(InferenceMode::Offloaded, 0.5), background()).unwrap();
    uninitialized.dispose();
    uninitialized.dispose();
    assert_eq!(uninitialized.state(), PipelineState::Disposed);

    for mode in [None, Some(SourceMode::Down)] {
        let (engine, _) = constant_engine(1.0);
        let (source, control) = scripted_source();
        let mut pipeline =
            Pipeline::new(config(InferenceMode::Offloaded, 0.5), background()).unwrap();
        pipeline
            .initialize_with_engine(engine, Box::new(source))
            .unwrap();
        let expected = match mode {
            None => PipelineState::Ready,
            Some(mode) => {
                control.lock().mode = mode;
                pipeline.tick().unwrap();
                PipelineState::Suspended
            }
        };
        assert_eq!(pipeline.state(), expected);

        pipeline.dispose();
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Disposed);
        assert!(control.lock().stopped);
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Driver call that blocks until the test feeds it a frame.
struct StallingGrabber {
    feed: crossbeam_channel::Receiver<Frame>,
}

impl FrameGrabber for StallingGrabber {
    fn grab(&mut self) -> nncam::Result<Frame> {
        self.feed
            .recv()
            .map_err(|_| PipelineError::DeviceUnavailable("unplugged".into()))
    }
}

struct ThreadedSource(CaptureThread);

impl FrameSource for ThreadedSource {
    fn poll_frame(&mut self) -> nncam::Result<Option<Frame>> {
        self.0.poll()
    }

    fn stop(&mut self) {
        self.0.stop();
    }

    fn resolution(&self) -> (u32, u32) {
        (64, 36)
    }
}

#[test]
fn blocked_capture_driver_still_stalls_and_renders() {
    let display_interval = Duration::from_millis(33);
    let (feed_tx, feed_rx) = crossbeam_channel::unbounded();
    let capture = CaptureThread::spawn("stalling-capture", move || {
        Ok(StallingGrabber { feed: feed_rx })
    })
    .unwrap();
    let (engine, _) = constant_engine(1.0);
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(ThreadedSource(capture)))
        .unwrap();

    feed_tx.send(Frame::solid(64, 36, CAMERA)).unwrap();
    wait_until(|| {
        pipeline.tick().unwrap();
        pipeline.stats().frames_ingested == 1
    });
    assert_eq!(pipeline.state(), PipelineState::Running);
    let losses = pipeline.stats().device_losses;

    // The grabber is now stuck in the driver; nothing else arrives.
    for _ in 0..5 {
        let start = Instant::now();
        pipeline.tick().unwrap();
        let frame = pipeline.render().unwrap();
        assert!(start.elapsed() < display_interval);
        assert!(all_pixels(frame, CAMERA));
    }
    assert_eq!(pipeline.state(), PipelineState::Suspended);
    assert_eq!(pipeline.stats().device_losses, losses + 1);

    let start = Instant::now();
    pipeline.dispose();
    assert!(start.elapsed() < display_interval);
    drop(feed_tx);
}

#[test]
fn setters_validate_and_stop_after_dispose() {
    let mut pipeline = Pipeline::new(config(InferenceMode::Inline, 0.5), background()).unwrap();
    assert!(matches!(
        pipeline.set_threshold(7.5),
        Err(PipelineError::InvalidThreshold(_))
    ));
    assert_eq!(pipeline.config().threshold, 0.5);
    pipeline.set_threshold(0.3).unwrap();
    assert_eq!(pipeline.config().threshold, 0.3);

    let (engine, _) = constant_engine(0.35);
    let (source, _) = scripted_source();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();
    pipeline.tick().unwrap();
    assert!(all_pixels(pipeline.render().unwrap(), CAMERA));

    pipeline.dispose();
    assert!(matches!(
        pipeline.set_threshold(0.4),
        Err(PipelineError::InvalidState { .. })
    ));
    assert!(matches!(
        pipeline.set_background(Frame::solid(8, 8, CAMERA)),
        Err(PipelineError::InvalidState { .. })
    ));
    assert_eq!(pipeline.config().threshold, 0.3);
}

/// Crashes the inference thread on its first frame.
struct PanickingModel;

impl SegmentationModel for PanickingModel {
    fn infer(&mut self, _input: Array4<f32>) -> anyhow::Result<Mask> {
        panic!("model crashed");
    }

    fn input_size(&self) -> (u32, u32) {
        (4, 4)
    }
}

#[test]
fn dead_inference_thread_shows_up_as_failures() {
    let engine = SegmentationEngine::with_model(Box::new(PanickingModel), Preprocessor::new(4, 4));
    let (source, _) = scripted_source();
    let mut pipeline =
        Pipeline::new(config(InferenceMode::Offloaded, 0.5), background()).unwrap();
    pipeline
        .initialize_with_engine(engine, Box::new(source))
        .unwrap();

    wait_until(|| {
        pipeline.tick().unwrap();
        pipeline.stats().inference_failures >= 2
    });

    // Still rendering with the last mask (all background, none ever completed).
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(all_pixels(pipeline.render().unwrap(), BACKGROUND));
    assert_eq!(pipeline.stats().inferences_completed, 0);
    pipeline.dispose();
}

/// Fails every second call.
struct FlakyModel {
    calls: u32,
}

impl SegmentationModel for FlakyModel {
    fn infer(&mut self, _input: Array4<f32>) -> anyhow::Result<Mask> {
        self.calls += 1;
        if self.calls % 2 == 0 {
            anyhow::bail!("output tensor contained NaN");
        }
        Ok(Mask::filled(8, 8, 1.0))
    }

    fn input_size(&self) -> (u32, u32) {
        (8, 8)
    }
}

#[test]
fn failed_inference_keeps_previous_mask() {
    for mode in [InferenceMode::Inline, InferenceMode::Offloaded] {
        let engine = SegmentationEngine::with_model(
            Box::new(FlakyModel { calls: 0 }),
            Preprocessor::new(8, 8),
        );
        let (source, _) = scripted_source();
        let mut pipeline = Pipeline::new(config(mode, 0.5), background()).unwrap();
        pipeline
            .initialize_with_engine(engine, Box::new(source))
            .unwrap();

        for tick in 1..=6u64 {
            pipeline.tick().unwrap();
            wait_until(|| {
                let stats = pipeline.stats();
                stats.inferences_completed + stats.inference_failures == tick
            });

            // Odd frames succeed; after an even one the odd mask stays current.
            let expected = if tick % 2 == 1 { tick } else { tick - 1 };
            let mask = pipeline.current_mask().unwrap();
            assert_eq!(mask.source_sequence(), Some(expected), "{:?}", mode);
            assert!(all_pixels(pipeline.render().unwrap(), CAMERA));
            assert_eq!(pipeline.state(), PipelineState::Running);
        }

        let stats = pipeline.stats();
        assert_eq!(stats.inferences_completed, 3);
        assert_eq!(stats.inference_failures, 3);
    }
}
