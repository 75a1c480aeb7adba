use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, ImageBuffer, ImageOutputFormat, ImageResult, Rgb};
use ndarray::Array4;
use std::collections::VecDeque;
use std::sync::Arc;

/// Playback rate for clips when no frame rate has been measured yet.
const FALLBACK_CLIP_FPS: f32 = 10.0;

pub type Frame = Vec<u8>;
pub type FrameBuffer = ImageBuffer<Rgb<u8>, Frame>;

/// Converts RGB pixels to a `[1, 3, height, width]` tensor scaled to 0..=1
pub fn image_buffer_to_input(frame_buffer: &FrameBuffer, width: u32, height: u32) -> Array4<f32> {
    let resized;
    let pixels = if frame_buffer.dimensions() == (width, height) {
        frame_buffer
    } else {
        resized = image::imageops::resize(
            frame_buffer,
            width,
            height,
            image::imageops::FilterType::Nearest,
        );
        &resized
    };

    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| pixels[(x as _, y as _)][c] as f32 / 255.0,
    )
}

/// Encodes a frame for snapshots and event payloads
pub fn encode_jpeg(frame_buffer: &FrameBuffer, quality: u8) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(frame_buffer.clone())
        .write_to(&mut bytes, ImageOutputFormat::Jpeg(quality))?;
    Ok(bytes)
}

/// The most recent frames, oldest first. Pushing past capacity drops the oldest.
#[derive(Debug, Clone)]
pub struct FrameRing {
    capacity: usize,
    frames: VecDeque<Arc<FrameBuffer>>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        FrameRing {
            capacity,
            frames: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, frame: Arc<FrameBuffer>) {
        if self.capacity == 0 {
            return;
        }
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameBuffer> + '_ {
        self.frames.iter().map(|frame| frame.as_ref())
    }
}

/// Encodes frames as an animated GIF played back at `fps`.
pub fn encode_gif<'a, I>(frames: I, fps: f32) -> ImageResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a FrameBuffer>,
{
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        FALLBACK_CLIP_FPS
    };
    let delay_ms = ((1000.0 / fps).round() as u32).max(10);

    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        encoder.encode_frames(frames.into_iter().map(|frame| {
            let rgba = DynamicImage::ImageRgb8(frame.clone()).to_rgba8();
            image::Frame::from_parts(rgba, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1))
        }))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifDecoder;
    use image::AnimationDecoder;
    use std::io::Cursor;

    #[test]
    fn input_is_channel_first_and_normalized() {
        let mut frame = FrameBuffer::new(2, 2);
        frame.put_pixel(0, 0, Rgb([255, 0, 0]));
        frame.put_pixel(1, 0, Rgb([0, 255, 0]));
        frame.put_pixel(0, 1, Rgb([0, 0, 255]));
        frame.put_pixel(1, 1, Rgb([51, 102, 153]));

        let input = image_buffer_to_input(&frame, 2, 2);

        assert_eq!(input.shape(), &[1, 3, 2, 2]);
        assert_eq!(input[[0, 0, 0, 0]], 1.0);
        assert_eq!(input[[0, 1, 0, 1]], 1.0);
        assert_eq!(input[[0, 2, 1, 0]], 1.0);
        assert_eq!(input[[0, 0, 0, 1]], 0.0);
        assert!((input[[0, 1, 1, 1]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn input_is_resized_to_model_size() {
        let frame = FrameBuffer::from_pixel(64, 48, Rgb([255, 255, 255]));
        let input = image_buffer_to_input(&frame, 32, 32);

        assert_eq!(input.shape(), &[1, 3, 32, 32]);
        assert!(input.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn jpeg_has_soi_marker() {
        let frame = FrameBuffer::from_pixel(16, 16, Rgb([10, 20, 30]));
        let bytes = encode_jpeg(&frame, 85).expect("encode jpeg");

        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn ring_keeps_only_the_newest_frames() {
        let mut ring = FrameRing::new(3);
        for shade in 1..=5u8 {
            ring.push(Arc::new(FrameBuffer::from_pixel(1, 1, Rgb([shade, 0, 0]))));
            assert!(ring.len() <= 3);
        }

        let shades: Vec<u8> = ring.iter().map(|frame| frame.get_pixel(0, 0)[0]).collect();
        assert_eq!(shades, vec![3, 4, 5]);
    }

    #[test]
    fn zero_capacity_ring_stays_empty() {
        let mut ring = FrameRing::new(0);
        ring.push(Arc::new(FrameBuffer::new(1, 1)));
        assert!(ring.is_empty());
    }

    #[test]
    fn gif_clip_holds_frames_in_order() {
        let mut ring = FrameRing::new(3);
        for color in [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]] {
            ring.push(Arc::new(FrameBuffer::from_pixel(8, 8, Rgb(color))));
        }

        let bytes = encode_gif(ring.iter(), 0.0).expect("encode gif");
        assert_eq!(&bytes[..6], b"GIF89a");

        let frames = GifDecoder::new(Cursor::new(bytes))
            .expect("decode gif")
            .into_frames()
            .collect_frames()
            .expect("gif frames");
        assert_eq!(frames.len(), 3);

        let dominant: Vec<usize> = frames[..2]
            .iter()
            .map(|frame| {
                let pixel = frame.buffer().get_pixel(4, 4);
                (0..3).max_by_key(|c| pixel[*c]).unwrap_or(0)
            })
            .collect();
        assert_eq!(dominant, vec![1, 2]);
        let last = frames[2].buffer().get_pixel(4, 4);
        assert!(last[0] > 200 && last[1] > 200 && last[2] > 200);
    }
}
