use ndarray::{Array4, ArrayView3, ArrayViewD, Ix3};
use opencv::core::Mat;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use thiserror::Error;

use super::geometry::BoundingBox;
use crate::config::ModelConfig;

const YOLO_INPUT_SIZE: u32 = 640;
const OUTPUT_NAME: &str = "output0";
const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model runtime: {0}")]
    Runtime(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("unexpected model output: {0}")]
    Output(String),
}

fn runtime<E: std::fmt::Display>(e: E) -> DetectorError {
    DetectorError::Runtime(e.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub confidence: f32,
}

/// Class id to label name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn coco() -> Self {
        Self::new(COCO_CLASSES.iter().map(|s| s.to_string()).collect())
    }

    pub fn label(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

/// Produces boxes in frame coordinates for a BGR frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectorError>;

    fn labels(&self) -> &LabelMap;
}

pub struct ObjectDetector {
    session: Session,
    confidence_threshold: f32,
    iou_threshold: f32,
    allowed_classes: Vec<String>,
    labels: LabelMap,
}

impl ObjectDetector {
    pub fn new(model: &ModelConfig) -> Result<Self, DetectorError> {
        let builder = Session::builder()
            .map_err(runtime)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime)?
            .with_intra_threads(4)
            .map_err(runtime)?;

        let session = if model.path.starts_with("http://") || model.path.starts_with("https://") {
            builder.commit_from_url(&model.path).map_err(runtime)?
        } else {
            builder.commit_from_file(&model.path).map_err(runtime)?
        };

        let labels = if model.labels.is_empty() {
            LabelMap::coco()
        } else {
            LabelMap::new(model.labels.clone())
        };

        tracing::info!(model = %model.name, path = %model.path, "detection model loaded");

        Ok(Self {
            session,
            confidence_threshold: model.confidence,
            iou_threshold: model.iou,
            allowed_classes: model.classes.clone(),
            labels,
        })
    }

    fn preprocess(&self, frame: &Mat) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        use opencv::core::{Size, BORDER_CONSTANT};
        use opencv::imgproc;
        use opencv::prelude::*;

        let rows = frame.rows() as f32;
        let cols = frame.cols() as f32;
        let input_size = YOLO_INPUT_SIZE as f32;

        let scale = (input_size / cols).min(input_size / rows);
        let new_w = (cols * scale).round() as i32;
        let new_h = (rows * scale).round() as i32;

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(new_w, new_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let pad_x = (YOLO_INPUT_SIZE as i32 - new_w) / 2;
        let pad_y = (YOLO_INPUT_SIZE as i32 - new_h) / 2;

        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y,
            YOLO_INPUT_SIZE as i32 - new_h - pad_y,
            pad_x,
            YOLO_INPUT_SIZE as i32 - new_w - pad_x,
            BORDER_CONSTANT,
            opencv::core::Scalar::new(114.0, 114.0, 114.0, 0.0),
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb.data_bytes()?;
        let side = YOLO_INPUT_SIZE as usize;
        if data.len() < side * side * 3 {
            return Err(DetectorError::Output("letterboxed frame too small".into()));
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let idx = (y * side + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        Ok((
            tensor,
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
                width: cols,
                height: rows,
            },
        ))
    }
}

impl Detector for ObjectDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectorError> {
        use opencv::prelude::*;

        if frame.rows() == 0 || frame.cols() == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, letterbox) = self.preprocess(frame)?;

        let tensor_ref = TensorRef::from_array_view(input_tensor.view())
            .map_err(runtime)?
            .into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref]).map_err(runtime)?;

        let Some(predictions) = outputs.get(OUTPUT_NAME) else {
            return Err(DetectorError::Output(format!("missing '{OUTPUT_NAME}' tensor")));
        };
        let predictions = predictions
            .try_extract_array::<f32>()
            .map_err(runtime)?
            .to_owned();
        drop(outputs);

        let candidates = decode_predictions(
            &predictions.view(),
            self.confidence_threshold,
            &letterbox,
        )?;
        let candidates = candidates
            .into_iter()
            .filter(|d| {
                self.allowed_classes.is_empty()
                    || self.allowed_classes.contains(&self.labels.label(d.class_id))
            })
            .collect();

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }

    fn labels(&self) -> &LabelMap {
        &self.labels
    }
}

/// Mapping from model input space back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: f32,
    height: f32,
}

impl Letterbox {
    fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let x1 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.width);
        let y1 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.height);
        let x2 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.width);
        let y2 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.height);
        BoundingBox::new(x1, y1, x2, y2)
    }
}

/// Decodes a `[1, 4 + classes, anchors]` tensor whose first four rows are
/// `cx, cy, w, h` in input pixels and the rest are per-class scores.
fn decode_predictions(
    predictions: &ArrayViewD<f32>,
    confidence_threshold: f32,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, DetectorError> {
    let preds: ArrayView3<f32> = predictions
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| DetectorError::Output(e.to_string()))?;
    let (_, rows, anchors) = preds.dim();
    if rows <= 4 {
        return Err(DetectorError::Output(format!("{rows} rows per anchor")));
    }
    let num_classes = rows - 4;

    let mut detections = Vec::new();
    for i in 0..anchors {
        let mut max_score = 0.0f32;
        let mut max_class = 0usize;
        for c in 0..num_classes {
            let score = preds[[0, 4 + c, i]];
            if score > max_score {
                max_score = score;
                max_class = c;
            }
        }
        if max_score < confidence_threshold {
            continue;
        }
        let bbox = letterbox.unmap(
            preds[[0, 0, i]],
            preds[[0, 1, i]],
            preds[[0, 2, i]],
            preds[[0, 3, i]],
        );
        detections.push(Detection {
            bbox,
            class_id: max_class,
            confidence: max_score,
        });
    }
    Ok(detections)
}

/// Greedy per-class suppression, highest confidence first.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn identity() -> Letterbox {
        Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            width: 640.0,
            height: 640.0,
        }
    }

    fn det(x1: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, 0.0, x1 + 10.0, 10.0),
            class_id,
            confidence,
        }
    }

    #[test]
    fn test_label_map() {
        let coco = LabelMap::coco();
        assert_eq!(coco.label(0), "person");
        assert_eq!(coco.label(2), "car");
        assert_eq!(coco.label(500), "class_500");
        assert_eq!(LabelMap::new(vec!["forklift".into()]).label(0), "forklift");
    }

    #[test]
    fn test_decode_predictions() {
        // two classes, three anchors
        let mut preds = Array3::<f32>::zeros((1, 6, 3));
        for (i, (cx, score0, score1)) in [(100.0, 0.9, 0.1), (200.0, 0.2, 0.3), (300.0, 0.1, 0.8)]
            .into_iter()
            .enumerate()
        {
            preds[[0, 0, i]] = cx;
            preds[[0, 1, i]] = 50.0;
            preds[[0, 2, i]] = 20.0;
            preds[[0, 3, i]] = 40.0;
            preds[[0, 4, i]] = score0;
            preds[[0, 5, i]] = score1;
        }
        let out = decode_predictions(&preds.into_dyn().view(), 0.5, &identity()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_id, 0);
        assert_eq!(out[0].bbox, BoundingBox::new(90.0, 30.0, 110.0, 70.0));
        assert_eq!(out[1].class_id, 1);
    }

    #[test]
    fn test_letterbox_unmap_clamps() {
        let lb = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 140.0,
            width: 1280.0,
            height: 720.0,
        };
        let b = lb.unmap(320.0, 320.0, 100.0, 100.0);
        assert_eq!(b, BoundingBox::new(540.0, 260.0, 740.0, 460.0));
        let edge = lb.unmap(0.0, 140.0, 40.0, 40.0);
        assert_eq!(edge.x1, 0.0);
        assert_eq!(edge.y1, 0.0);
    }

    #[test]
    fn test_nms_is_per_class() {
        let kept = non_max_suppression(
            vec![det(0.0, 0, 0.6), det(1.0, 0, 0.9), det(1.0, 1, 0.7), det(100.0, 0, 0.5)],
            0.45,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 1));
        assert!(kept.iter().all(|d| d.confidence != 0.6));
    }
}
