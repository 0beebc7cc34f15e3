//! # FRAMELATCH Demo
//!
//! Runs the whole hand-off pipeline against a software display:
//! a producer thread renders frames, the compositor latches and posts
//! them, and the poster flips on its own vsync clock.
//!
//! ```bash
//! # Defaults: 120 frames at 60Hz, double buffered
//! ./framelatch_demo
//!
//! # From a config file, more verbose
//! RUST_LOG=debug ./framelatch_demo --config framelatch.toml
//!
//! # Override the frame count
//! ./framelatch_demo --frames 600
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use framelatch::core::{BufferQueue, HeapAllocator, PixelFormat, SlotTable};
use framelatch::display::{DisplayMode, DisplayPoster, HandoffSurface, SoftwarePoster};
use framelatch::{Compositor, FrameProducer, FramelatchConfig, HandoffEvent};
use tracing_subscriber::EnvFilter;

const DISPLAY_MODE: DisplayMode = DisplayMode {
    width: 1280,
    height: 720,
    format: PixelFormat::Rgbx8888,
    refresh_hz: 60,
};

struct Args {
    config: Option<String>,
    frames: Option<u64>,
}

fn print_usage() {
    println!("Usage: framelatch_demo [--config <path>] [--frames <n>]");
    println!();
    println!("  --config <path>  TOML file with [surface], [compositor], [producer]");
    println!("  --frames <n>     Frames to produce (overrides the config)");
    println!("  --help           Show this message");
}

fn parse_args() -> Result<Option<Args>, String> {
    let mut args = Args {
        config: None,
        frames: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(iter.next().ok_or("--config needs a path")?);
            }
            "--frames" => {
                let value = iter.next().ok_or("--frames needs a number")?;
                let frames = value
                    .parse()
                    .map_err(|_| format!("--frames: '{value}' is not a number"))?;
                args.frames = Some(frames);
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(Some(args))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(message) => {
            eprintln!("error: {message}");
            print_usage();
            std::process::exit(2);
        }
    };

    let mut config = match &args.config {
        Some(path) => match FramelatchConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("   ✗ FATAL: {err}");
                std::process::exit(1);
            }
        },
        None => FramelatchConfig::default(),
    };
    if let Some(frames) = args.frames {
        config.producer.frames = frames;
    }

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    FRAMELATCH DEMO v0.1.0");
    println!("═══════════════════════════════════════════════════════════════════");
    println!();
    println!("  Display:  {}x{} {} @ {}Hz", DISPLAY_MODE.width, DISPLAY_MODE.height, DISPLAY_MODE.format, DISPLAY_MODE.refresh_hz);
    println!("  Buffers:  {}", config.surface.max_buffer_count);
    println!("  Frames:   {}", config.producer.frames);
    println!();

    // === PIPELINE ===
    let queue = Arc::new(BufferQueue::new(Arc::new(HeapAllocator::new())));
    let poster = Arc::new(SoftwarePoster::with_display(config.surface.display, DISPLAY_MODE));
    let surface = match HandoffSurface::new(
        &config.surface,
        Arc::clone(&queue) as Arc<dyn SlotTable>,
        Arc::clone(&poster) as Arc<dyn DisplayPoster>,
    ) {
        Ok(surface) => Arc::new(surface),
        Err(err) => {
            eprintln!("   ✗ FATAL: failed to create surface: {err}");
            std::process::exit(1);
        }
    };

    let mut compositor = Compositor::new(config.compositor.clone(), Arc::clone(&surface), Arc::clone(&poster));
    queue.set_consumer_listener(compositor.listener());
    let events = compositor.sender();

    let compositor_thread = match thread::Builder::new()
        .name(String::from("compositor"))
        .spawn(move || compositor.run())
    {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("   ✗ FATAL: failed to spawn compositor: {err}");
            std::process::exit(1);
        }
    };

    // === PRODUCER LOOP ===
    let mut producer = FrameProducer::new(Arc::clone(&queue), &config.producer);
    let start = Instant::now();
    let outcome = producer.run(
        &config.producer,
        (DISPLAY_MODE.width, DISPLAY_MODE.height),
        |_| {
            events.send(HandoffEvent::CompositionComplete);
        },
    );

    // Let the last frame reach the screen before stopping.
    thread::sleep(config.compositor.vsync_interval().unwrap_or_default() * 2);
    events.send_blocking(HandoffEvent::Shutdown);
    let stats = match compositor_thread.join() {
        Ok(stats) => stats,
        Err(_) => {
            eprintln!("   ✗ FATAL: compositor thread panicked");
            std::process::exit(1);
        }
    };

    let run = match outcome {
        Ok(run) => run,
        Err(err) => {
            eprintln!("   ✗ FATAL: producer stalled: {err}");
            let mut dump = String::new();
            surface.dump(&mut dump);
            eprintln!("{dump}");
            std::process::exit(1);
        }
    };

    let mut dump = String::new();
    surface.dump(&mut dump);
    let poster_stats = poster.stats();
    let elapsed = start.elapsed();

    println!();
    println!("═══════════════════════════════════════════════════════════════════");
    println!("                         SUMMARY");
    println!("═══════════════════════════════════════════════════════════════════");
    println!("  Produced:        {}", producer.frames_produced());
    println!("  Dropped:         {}", run.failures);
    println!("  Abandoned:       {}", run.abandoned);
    println!("  Posted:          {}", stats.frames_posted);
    println!("  Flipped:         {}", poster_stats.flips);
    println!("  Late frames:     {}", stats.late_frames);
    println!("  Idle vsyncs:     {}", stats.idle_vsyncs);
    println!("  Slots freed:     {}", stats.slots_freed);
    println!("  Errors:          {}", stats.errors);
    println!("  Max dispatch:    {}µs", stats.max_dispatch_us);
    println!("  Elapsed:         {:.2}s", elapsed.as_secs_f64());
    println!();
    for line in dump.lines() {
        println!("  {line}");
    }
}
