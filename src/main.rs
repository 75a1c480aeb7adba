mod alert;
mod camera;
mod config;
mod debouncer;
mod detector;
mod image_processing;
mod publisher;

use alert::AudioPlayer;
use anyhow::Result;
use camera::CameraSettings;
use clap::Parser;
use config::Config;
use debouncer::{Class, Debouncer, RateMeter, Verdict};
use detector::{to_sample, Detector};
use image_processing::FrameRing;
use publisher::Publisher;
use std::path::PathBuf;
use tokio::{
    task,
    time::{self, Instant, MissedTickBehavior},
};

/// Watches a camera for people smoking in a no-smoking area.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log events instead of publishing them over MQTT
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let detector = Detector::load(
        &config.onnx_model_file,
        config.input_width,
        config.input_height,
    )?
    .with_thresholds(config.confidence_threshold, config.nms_threshold);
    log::info!("ONNX model loaded: {}", config.onnx_model_file.display());

    let mut audio = AudioPlayer::new(
        &config.audio_player,
        &config.guide_sound,
        &config.warning_sound,
    )?;

    let mut publisher = if args.dry_run {
        Publisher::dry_run(&config)
    } else {
        Publisher::connect(&config)
    };
    publisher.register(config.heartbeat_interval()).await?;

    let (mut frames, capture) = camera::spawn_capture(CameraSettings {
        index: config.camera_index,
        width: config.camera_width,
        height: config.camera_height,
        fps: config.camera_fps,
        max_errors: config.max_capture_errors,
    })
    .await?;

    let mut debouncer = Debouncer::new(&config.debounce_settings());
    let mut rate = RateMeter::new(Instant::now());
    let mut previous = Verdict::default();
    let mut clip = FrameRing::new(config.clip_frames);

    let mut ticker = time::interval(config.loop_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    log::info!("detection started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        match frames.has_changed() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => {
                log::error!("camera capture stopped");
                break;
            }
        }
        let frame = match frames.borrow_and_update().clone() {
            Some(frame) => frame,
            None => continue,
        };

        let now = Instant::now();
        let detections = match task::block_in_place(|| detector.detect(&frame)) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("detection failed: {:#}", err);
                continue;
            }
        };

        for detection in &detections {
            log::trace!(
                "{} {:.2} at {:?}",
                detection.class,
                detection.confidence,
                detection.bbox
            );
        }
        let sample = to_sample(now, &detections);
        clip.push(frame.clone());

        let fps = rate.tick(now);
        let verdict = debouncer.tick(&sample, fps, audio.is_idle());
        if !sample.is_empty() {
            let seen: Vec<&str> = sample.classes().map(|class| class.name()).collect();
            log::debug!(
                "detected: {} ({} person samples in window, {:.1} fps)",
                seen.join(" "),
                debouncer.window(Class::Person).len(),
                fps
            );
        }

        if verdict.warning != previous.warning || verdict.guide != previous.guide {
            if verdict.warning {
                log::warn!("smoking detected");
            } else if verdict.guide {
                log::info!("person in no-smoking area");
            } else {
                log::info!("area clear");
            }
        }

        if let Some(alert) = verdict.audio {
            log::info!(
                "{:?} alert ({} {:.2})",
                alert.kind,
                alert.class,
                alert.confidence
            );
            if let Err(err) = audio.play(alert.kind) {
                log::warn!("audio alert failed: {:#}", err);
            }
        }

        if let Some(alert) = verdict.upload {
            let reported =
                task::block_in_place(|| publisher.report(&alert, &sample, &frame, &clip, fps));
            if let Err(err) = reported {
                log::warn!("event upload failed: {:#}", err);
            }
        }

        previous = verdict;
    }

    audio.stop().await;
    log::info!(
        "{} events reported, last measured rate {:.1} fps",
        publisher.detection_count(),
        rate.rate()
    );
    publisher.shutdown().await;
    if let Some(exit) = task::block_in_place(|| capture.shutdown()) {
        log::debug!("capture thread exited: {:?}", exit);
    }

    Ok(())
}
