use crate::image_processing::FrameBuffer;
use anyhow::{anyhow, Context, Result};
use nokhwa::{Camera, CameraFormat, FrameFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};
use tokio::time::Duration;

const ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Latest captured frame; `None` until the first frame arrives.
pub type FrameSnapshot = Option<Arc<FrameBuffer>>;

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<FrameBuffer>;
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<FrameBuffer> {
        Ok(self.frame()?)
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub max_errors: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    Stopped,
    ReceiverClosed,
    TooManyErrors,
}

/// Owns the capture thread. Dropping it asks the thread to stop.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<CaptureExit>>,
}

impl CaptureHandle {
    pub fn shutdown(mut self) -> Option<CaptureExit> {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Opens the camera on a dedicated thread and publishes every frame into a
/// watch channel. Readers always see the most recent frame only.
pub async fn spawn_capture(
    settings: CameraSettings,
) -> Result<(watch::Receiver<FrameSnapshot>, CaptureHandle)> {
    let (tx, rx) = watch::channel(None);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let thread = thread::Builder::new()
        .name("camera-capture".to_string())
        .spawn(move || {
            let camera = match open_camera(&settings) {
                Ok(camera) => {
                    let _ = ready_tx.send(Ok(()));
                    camera
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return CaptureExit::Stopped;
                }
            };
            let exit = capture_loop(camera, &tx, &thread_stop, settings.max_errors);
            log::info!("camera capture finished: {:?}", exit);
            exit
        })
        .context("failed to spawn capture thread")?;

    ready_rx
        .await
        .map_err(|_| anyhow!("capture thread exited before opening the camera"))??;

    Ok((
        rx,
        CaptureHandle {
            stop,
            thread: Some(thread),
        },
    ))
}

fn open_camera(settings: &CameraSettings) -> Result<Camera> {
    let mut camera = Camera::new(
        settings.index,
        Some(CameraFormat::new_from(
            settings.width,
            settings.height,
            FrameFormat::MJPEG,
            settings.fps,
        )),
    )
    .with_context(|| format!("could not open camera {}", settings.index))?;
    camera
        .open_stream()
        .context("could not open camera stream")?;
    log::info!(
        "camera {} ready ({}x{} @ {} fps)",
        settings.index,
        settings.width,
        settings.height,
        settings.fps
    );
    Ok(camera)
}

/// Pulls frames until stopped, until nobody listens, or until
/// `max_errors` consecutive reads fail.
pub fn capture_loop<S: FrameSource>(
    mut source: S,
    tx: &watch::Sender<FrameSnapshot>,
    stop: &AtomicBool,
    max_errors: u32,
) -> CaptureExit {
    let mut errors = 0;

    while !stop.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(frame) => {
                errors = 0;
                if tx.send(Some(Arc::new(frame))).is_err() {
                    return CaptureExit::ReceiverClosed;
                }
            }
            Err(err) => {
                errors += 1;
                log::warn!("frame capture failed ({}/{}): {:#}", errors, max_errors, err);
                if errors >= max_errors {
                    return CaptureExit::TooManyErrors;
                }
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    CaptureExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct Scripted {
        frames: u8,
        produced: u8,
    }

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<FrameBuffer> {
            if self.produced < self.frames {
                self.produced += 1;
                Ok(FrameBuffer::from_pixel(2, 2, Rgb([self.produced, 0, 0])))
            } else {
                Err(anyhow!("device unplugged"))
            }
        }
    }

    #[test]
    fn last_frame_wins() {
        let (tx, rx) = watch::channel(None);
        let stop = AtomicBool::new(false);

        let exit = capture_loop(Scripted { frames: 5, produced: 0 }, &tx, &stop, 2);

        assert_eq!(exit, CaptureExit::TooManyErrors);
        let snapshot = rx.borrow().clone().expect("a frame was published");
        assert_eq!(snapshot.get_pixel(0, 0), &Rgb([5, 0, 0]));
    }

    #[test]
    fn stops_when_requested() {
        let (tx, rx) = watch::channel(None);
        let stop = AtomicBool::new(true);

        let exit = capture_loop(Scripted { frames: 5, produced: 0 }, &tx, &stop, 2);

        assert_eq!(exit, CaptureExit::Stopped);
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let (tx, rx) = watch::channel(None);
        drop(rx);
        let stop = AtomicBool::new(false);

        let exit = capture_loop(Scripted { frames: 5, produced: 0 }, &tx, &stop, 2);

        assert_eq!(exit, CaptureExit::ReceiverClosed);
    }
}
