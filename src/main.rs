use anyhow::{Context, Result};
use clap::Parser;
use nncam::capture::{self, WebcamCapture, DEFAULT_CAPTURE_SIZE};
use nncam::config::{BlendPolicy, InferenceMode, PipelineConfig, RenderView, RetryPolicy};
use nncam::output::{OutputSink, V4L2Output};
use nncam::segmentation::ResourceBundle;
use nncam::{Frame, Origin, Pipeline};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = DEFAULT_CAPTURE_SIZE.0)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = DEFAULT_CAPTURE_SIZE.1)]
    capture_height: u32,

    /// The camera delivers rows bottom-up; flip them on capture
    #[arg(long)]
    flip_vertical: bool,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Run capture and inference every N rendered frames
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    process_interval: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Segmentation model: an ONNX file or a JSON resource manifest
    #[arg(long)]
    model: PathBuf,

    /// Foreground cutoff in [0.001, 0.99]; mask values at or above it show the camera
    #[arg(long, default_value_t = nncam::config::DEFAULT_THRESHOLD)]
    threshold: f32,

    /// Soften the cutoff over this many mask units above the threshold
    #[arg(long)]
    feather: Option<f32>,

    /// Gaussian blur applied to the upscaled mask
    #[arg(long)]
    smooth_sigma: Option<f32>,

    /// Background image composited behind the foreground
    #[arg(long)]
    background: Option<PathBuf>,

    /// Background color (hex RRGGBB) when no image is given
    #[arg(long, default_value = "00b140", value_parser = parse_color)]
    background_color: [u8; 3],

    /// Run inference on the capture thread instead of a worker thread
    #[arg(long)]
    inline_inference: bool,

    /// Ticks without a new frame before the camera counts as lost
    #[arg(long, default_value_t = 30)]
    stall_ticks: u32,

    /// Give up restarting a lost camera after this many attempts
    #[arg(long)]
    retry_max_attempts: Option<u32>,

    /// Stop after rendering this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Show matte visualization (grayscale silhouette) instead of the composite
    #[arg(long)]
    show_matte: bool,
}

fn parse_color(value: &str) -> std::result::Result<[u8; 3], String> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 {
        return Err(format!("expected RRGGBB, got {:?}", value));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("{:?}: {}", value, e))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            output_width: self.output_width,
            output_height: self.output_height,
            threshold: self.threshold,
            blend: match self.feather {
                Some(feather) => BlendPolicy::Smooth { feather },
                None => BlendPolicy::Hard,
            },
            smooth_sigma: self.smooth_sigma,
            inference: if self.inline_inference {
                InferenceMode::Inline
            } else {
                InferenceMode::Offloaded
            },
            stall_ticks: self.stall_ticks,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                ..RetryPolicy::default()
            },
            view: if self.show_matte {
                RenderView::Matte
            } else {
                RenderView::Composite
            },
        }
    }

    fn load_background(&self) -> Result<Frame> {
        match &self.background {
            Some(path) => {
                let image = image::open(path)
                    .with_context(|| format!("Failed to load background {}", path.display()))?;
                Ok(Frame::new(image.to_rgb8()))
            }
            None => Ok(Frame::solid(
                self.output_width,
                self.output_height,
                self.background_color,
            )),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("nncam starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", args.fps);

    let background = args.load_background()?;
    let mut pipeline = Pipeline::new(args.pipeline_config(), background)
        .context("Invalid pipeline configuration")?;

    let resources = ResourceBundle::load(&args.model).context("Failed to load model resources")?;

    // A missing camera is not fatal: the pipeline starts suspended and retries
    let origin = if args.flip_vertical {
        Origin::BottomLeft
    } else {
        Origin::TopLeft
    };
    let camera = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
        origin,
        capture::platform_access(args.input_device),
    );

    let mut output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    tracing::info!("Loading segmentation model from {}", resources.model.display());
    pipeline
        .initialize(&resources, Box::new(camera))
        .context("Failed to initialize pipeline")?;
    tracing::info!("Segmentation model loaded successfully");

    let result = run_pipeline(
        &mut pipeline,
        &mut output,
        args.fps,
        args.process_interval,
        args.frames,
    );
    pipeline.dispose();
    result
}

fn run_pipeline<O: OutputSink>(
    pipeline: &mut Pipeline,
    output: &mut O,
    target_fps: u32,
    process_interval: u32,
    frame_limit: Option<u64>,
) -> Result<()> {
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps.max(1) as f32);
    let mut frame_count = 0u64;
    let mut total_tick_time = Duration::ZERO;
    let mut total_render_time = Duration::ZERO;
    let mut total_output_time = Duration::ZERO;

    tracing::info!("Starting main pipeline loop");
    tracing::info!("Press Ctrl+C to stop");

    while frame_limit.map_or(true, |limit| frame_count < limit) {
        let loop_start = Instant::now();

        // Processing tick: capture + inference submission
        if frame_count % process_interval as u64 == 0 {
            let tick_start = Instant::now();
            pipeline.tick().context("Pipeline tick failed")?;
            total_tick_time += tick_start.elapsed();
        }

        // Render tick: never waits for inference
        let render_start = Instant::now();
        let frame = pipeline.render().context("Failed to render frame")?;
        total_render_time += render_start.elapsed();

        let output_start = Instant::now();
        output
            .write_frame(frame)
            .context("Failed to write frame")?;
        total_output_time += output_start.elapsed();

        frame_count += 1;

        // Log stats every 30 frames
        if frame_count % 30 == 0 {
            let avg_tick_ms = total_tick_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let avg_render_ms = total_render_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let avg_output_ms = total_output_time.as_secs_f64() * 1000.0 / frame_count as f64;
            let total_ms = avg_tick_ms + avg_render_ms + avg_output_ms;
            let stats = pipeline.stats();

            tracing::info!(
                "Frame {} [{}]: tick={:.1}ms, render={:.1}ms, output={:.1}ms, total={:.1}ms, fps={:.1}, inferred={}, dropped={}, mask_age={:?}",
                frame_count,
                pipeline.state(),
                avg_tick_ms,
                avg_render_ms,
                avg_output_ms,
                total_ms,
                1000.0 / total_ms.max(f64::EPSILON),
                stats.inferences_completed,
                stats.frames_dropped,
                pipeline.mask_age()
            );
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    tracing::info!("Rendered {} frames", frame_count);
    Ok(())
}
