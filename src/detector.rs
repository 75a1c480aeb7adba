use crate::debouncer::{Class, Sample};
use crate::image_processing::{image_buffer_to_input, FrameBuffer};
use anyhow::{anyhow, Context, Result};
use ndarray::{s, ArrayView2};
use std::path::Path;
use tokio::time::Instant;
use tract_onnx::prelude::*;

type OnnxModel = TypedRunnableModel<TypedModel>;

/// Axis-aligned box in model input pixels, top-left anchored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        BBox {
            xmin: cx - width / 2.0,
            ymin: cy - height / 2.0,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let l = self.xmin.max(other.xmin);
        let r = (self.xmin + self.width).min(other.xmin + other.width);
        let t = self.ymin.max(other.ymin);
        let b = (self.ymin + self.height).min(other.ymin + other.height);
        let intersection = (r - l).max(0.0) * (b - t).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class: Class,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Collapses one frame's detections into a debouncer sample.
pub fn to_sample(at: Instant, detections: &[Detection]) -> Sample {
    detections.iter().fold(Sample::new(at), |sample, d| {
        sample.with(d.class, d.confidence)
    })
}

/// Decodes a YOLOv8 head laid out as `[4 + classes, anchors]`.
///
/// Each anchor keeps its best class when that score is above
/// `confidence_threshold`, then overlapping boxes are suppressed regardless of
/// class. Class ids the label set doesn't know are dropped last.
pub fn postprocess(
    output: ArrayView2<f32>,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let (rows, anchors) = output.dim();
    if rows <= 4 {
        return Vec::new();
    }

    let mut candidates: Vec<(usize, f32, BBox)> = Vec::new();
    for anchor in 0..anchors {
        let column = output.slice(s![.., anchor]);
        let best = column
            .slice(s![4..])
            .iter()
            .cloned()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (idx, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((idx, score)),
            });

        if let Some((class_id, score)) = best {
            if score > confidence_threshold {
                let bbox = BBox::from_center(column[0], column[1], column[2], column[3]);
                candidates.push((class_id, score, bbox));
            }
        }
    }

    non_max_suppression(&mut candidates, nms_threshold);

    candidates
        .into_iter()
        .filter_map(|(class_id, confidence, bbox)| {
            Class::from_index(class_id).map(|class| Detection {
                class,
                confidence,
                bbox,
            })
        })
        .collect()
}

fn non_max_suppression(xs: &mut Vec<(usize, f32, BBox)>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept = 0;
    for index in 0..xs.len() {
        let overlaps = (0..kept).any(|prev| xs[prev].2.iou(&xs[index].2) > iou_threshold);
        if !overlaps {
            xs.swap(kept, index);
            kept += 1;
        }
    }
    xs.truncate(kept);
}

/// ONNX object detector running on the CPU.
pub struct Detector {
    model: OnnxModel,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl Detector {
    pub fn load<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Detector {
            model,
            width,
            height,
            confidence_threshold: 0.4,
            nms_threshold: 0.4,
        })
    }

    pub fn with_thresholds(mut self, confidence_threshold: f32, nms_threshold: f32) -> Self {
        self.confidence_threshold = confidence_threshold;
        self.nms_threshold = nms_threshold;
        self
    }

    pub fn detect(&self, frame_buffer: &FrameBuffer) -> Result<Vec<Detection>> {
        let input = image_buffer_to_input(frame_buffer, self.width, self.height);
        let shape = input.shape().to_vec();
        let tensor = Tensor::from_shape(&shape, &input.into_raw_vec())?;

        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .get(0)
            .ok_or_else(|| anyhow!("model produced no outputs"))?;

        let dims = output.shape();
        if dims.len() != 3 || dims[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", dims));
        }
        let (rows, anchors) = (dims[1], dims[2]);
        let data = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;
        let view = ArrayView2::from_shape((rows, anchors), data)?;

        Ok(postprocess(
            view,
            self.confidence_threshold,
            self.nms_threshold,
        ))
    }
}
