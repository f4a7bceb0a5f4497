use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gembot_core::types::SegmentOutcome;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Rgba, RgbaImage};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::image_context::ImageContextCache;
use crate::llm_gateway::{
    Content, GenerateConfig, GenerateRequest, LlmBackend, LlmError, Part, ResponseFormat,
};
use crate::truncate_for_log;

const SEGMENT_PROMPT_TEMPLATE: &str = include_str!("../../../prompts/segment_prompt.md");
const BOX_SCALE: f64 = 1000.0;

const NO_IMAGE_MESSAGE: &str = "请先发送一张图片，然后再告诉我要抠出什么。";
const NOTHING_FOUND_MESSAGE: &str = "没有在图片中找到符合描述的物体。";
const SEGMENT_ERROR_MESSAGE: &str = "抠图时出了点问题，请稍后再试。";

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\s*```\s*$")
        .expect("invalid code fence regex")
});

#[derive(Debug, Error)]
enum SegmentError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("llm: {0}")]
    Llm(#[from] LlmError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("blocking task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Cuts objects out of the image most recently sent to a chat.
#[async_trait]
pub(crate) trait SegmentationTool: Send + Sync {
    /// Never fails; problems are reported through the outcome status.
    async fn segment(&self, chat_id: &str, instruction: &str) -> SegmentOutcome;
}

pub(crate) struct ImageSegmenter {
    backend: Arc<dyn LlmBackend>,
    images: Arc<ImageContextCache>,
    model: String,
    output_dir: PathBuf,
    max_upload_dimension: u32,
}

impl ImageSegmenter {
    pub(crate) fn new(
        backend: Arc<dyn LlmBackend>,
        images: Arc<ImageContextCache>,
        model: impl Into<String>,
        output_dir: PathBuf,
        max_upload_dimension: u32,
    ) -> Self {
        Self {
            backend,
            images,
            model: model.into(),
            output_dir,
            max_upload_dimension,
        }
    }

    async fn run(&self, chat_id: &str, instruction: &str) -> Result<SegmentOutcome, SegmentError> {
        let Some(source) = self.images.get(chat_id) else {
            info!("segment skipped, no image context chat_id={}", chat_id);
            return Ok(SegmentOutcome::failure(NO_IMAGE_MESSAGE));
        };

        let upload_source = source.clone();
        let max_dim = self.max_upload_dimension;
        let upload_b64 =
            tokio::task::spawn_blocking(move || encode_png_for_upload(&upload_source, max_dim))
                .await??;

        let prompt = SEGMENT_PROMPT_TEMPLATE.replace("__INSTRUCTION__", instruction.trim());
        let req = GenerateRequest {
            purpose: "segment_image",
            model: self.model.clone(),
            contents: vec![Content::user(vec![
                Part::text(prompt),
                Part::inline("image/png", upload_b64),
            ])],
            config: GenerateConfig {
                response_format: ResponseFormat::Json,
                ..GenerateConfig::default()
            },
        };
        let resp = self.backend.generate(req).await?;

        let detections = match parse_detections(resp.text_or_empty()) {
            Ok(items) => items,
            Err(reason) => {
                warn!(
                    "segment response unusable chat_id={} reason={} raw={}",
                    chat_id,
                    reason,
                    truncate_for_log(resp.text_or_empty())
                );
                return Ok(SegmentOutcome::failure(NOTHING_FOUND_MESSAGE));
            }
        };
        if detections.is_empty() {
            return Ok(SegmentOutcome::failure(NOTHING_FOUND_MESSAGE));
        }

        let output_dir = self.output_dir.clone();
        let files =
            tokio::task::spawn_blocking(move || render_cutouts(&source, &detections, &output_dir))
                .await??;
        if files.is_empty() {
            return Ok(SegmentOutcome::failure(NOTHING_FOUND_MESSAGE));
        }
        info!("segment done chat_id={} files={}", chat_id, files.len());
        Ok(SegmentOutcome::success(
            format!("成功抠出 {} 个物体。", files.len()),
            files,
        ))
    }
}

#[async_trait]
impl SegmentationTool for ImageSegmenter {
    async fn segment(&self, chat_id: &str, instruction: &str) -> SegmentOutcome {
        match self.run(chat_id, instruction).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("segment failed chat_id={} err={}", chat_id, err);
                SegmentOutcome::error(SEGMENT_ERROR_MESSAGE)
            }
        }
    }
}

/// PNG of the image at `path`, shrunk to fit `max_dim` on both sides, base64 encoded.
/// The file on disk is left untouched. `max_dim == 0` disables shrinking.
pub(crate) fn encode_png_for_upload(
    path: &Path,
    max_dim: u32,
) -> Result<String, image::ImageError> {
    let img = downscale_for_upload(image::open(path)?, max_dim);
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut buf, ImageFormat::Png)?;
    Ok(STANDARD.encode(buf.into_inner()))
}

fn downscale_for_upload(img: DynamicImage, max_dim: u32) -> DynamicImage {
    if max_dim == 0 || (img.width() <= max_dim && img.height() <= max_dim) {
        return img;
    }
    img.resize(max_dim, max_dim, FilterType::Triangle)
}

/// One object reported by the model, already normalized.
#[derive(Debug, Clone)]
struct Detection {
    /// `[y0, x0, y1, x1]` on the 0-1000 scale.
    box_2d: [f64; 4],
    mask_png: Vec<u8>,
    label: String,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    box_2d: Vec<f64>,
    mask: MaskField,
    label: String,
}

// Some model versions wrap the mask in a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaskField {
    One(String),
    Many(Vec<String>),
}

fn strip_code_fence(raw: &str) -> &str {
    match CODE_FENCE_RE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

/// Decodes the model's JSON into usable detections. Malformed items are
/// dropped one by one; only an unreadable document is an error.
fn parse_detections(raw: &str) -> Result<Vec<Detection>, String> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err("empty response".to_string());
    }
    let value: Value = serde_json::from_str(body).map_err(|err| format!("invalid json: {err}"))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => return Err("expected a json list".to_string()),
    };

    let mut out = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match normalize_detection(item) {
            Ok(det) => out.push(det),
            Err(reason) => warn!("segment item skipped index={} reason={}", index, reason),
        }
    }
    Ok(out)
}

fn normalize_detection(item: Value) -> Result<Detection, String> {
    let raw: RawDetection =
        serde_json::from_value(item).map_err(|err| format!("missing or mistyped field: {err}"))?;

    let box_2d: [f64; 4] = raw
        .box_2d
        .try_into()
        .map_err(|v: Vec<f64>| format!("box_2d has {} values", v.len()))?;
    if box_2d.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > BOX_SCALE) {
        return Err(format!("box_2d out of range: {box_2d:?}"));
    }

    let encoded = match raw.mask {
        MaskField::One(s) => s,
        MaskField::Many(list) => list
            .into_iter()
            .next()
            .ok_or_else(|| "mask list is empty".to_string())?,
    };
    let payload = match encoded.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded.as_str(),
    };
    let mask_png = STANDARD
        .decode(payload.trim())
        .map_err(|err| format!("mask base64: {err}"))?;

    Ok(Detection {
        box_2d,
        mask_png,
        label: raw.label,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Box in pixels of an image `width` x `height`; `None` when empty.
fn pixel_box(box_2d: [f64; 4], width: u32, height: u32) -> Option<PixelRect> {
    let to_px = |v: f64, dim: u32| ((v / BOX_SCALE * f64::from(dim)).round() as u32).min(dim);
    let [y0, x0, y1, x1] = box_2d;
    let (y0, y1) = (to_px(y0, height), to_px(y1, height));
    let (x0, x1) = (to_px(x0, width), to_px(x1, width));
    if y0 >= y1 || x0 >= x1 {
        return None;
    }
    Some(PixelRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

/// Full-size RGBA cutout: the original seen through `mask` placed at `rect`,
/// transparent everywhere else.
fn composite_cutout(original: &RgbaImage, mask: &GrayImage, rect: PixelRect) -> RgbaImage {
    let (width, height) = original.dimensions();
    let fitted = imageops::resize(mask, rect.width, rect.height, FilterType::Triangle);
    let mut full_mask = GrayImage::new(width, height);
    imageops::replace(&mut full_mask, &fitted, i64::from(rect.x), i64::from(rect.y));

    let mut out = RgbaImage::new(width, height);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let m = full_mask.get_pixel(x, y)[0];
        if m == 0 {
            continue;
        }
        let src = original.get_pixel(x, y);
        *px = Rgba(src.0.map(|c| blend(c, m)));
    }
    out
}

fn blend(channel: u8, mask: u8) -> u8 {
    ((u16::from(channel) * u16::from(mask) + 127) / 255) as u8
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label.chars().filter(|c| c.is_alphanumeric()).collect();
    if cleaned.is_empty() {
        "object".to_string()
    } else {
        cleaned
    }
}

fn render_cutouts(
    source: &Path,
    detections: &[Detection],
    output_dir: &Path,
) -> Result<Vec<PathBuf>, SegmentError> {
    let original = image::open(source)?.to_rgba8();
    let (width, height) = original.dimensions();
    fs::create_dir_all(output_dir)?;

    let mut files: Vec<PathBuf> = Vec::new();
    for (index, det) in detections.iter().enumerate() {
        let Some(rect) = pixel_box(det.box_2d, width, height) else {
            warn!("segment item skipped index={} reason=degenerate box {:?}", index, det.box_2d);
            continue;
        };
        let mask = match image::load_from_memory(&det.mask_png) {
            Ok(m) => m.to_luma8(),
            Err(err) => {
                warn!("segment item skipped index={} reason=mask decode: {}", index, err);
                continue;
            }
        };
        let cutout = composite_cutout(&original, &mask, rect);
        let file = output_dir.join(format!("{}_{}.png", sanitize_label(&det.label), files.len()));
        cutout.save_with_format(&file, ImageFormat::Png)?;
        info!("segment cutout saved path={}", file.display());
        files.push(file);
    }
    Ok(files)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Returns a fixed outcome and records every `(chat_id, instruction)` pair.
    pub(crate) struct RecordingTool {
        outcome: SegmentOutcome,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingTool {
        pub(crate) fn new(outcome: SegmentOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SegmentationTool for RecordingTool {
        async fn segment(&self, chat_id: &str, instruction: &str) -> SegmentOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((chat_id.to_string(), instruction.to_string()));
            self.outcome.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gembot_core::types::SegmentStatus;
    use image::Luma;
    use serde_json::json;

    use super::*;
    use crate::llm_gateway::testing::{ScriptedBackend, text_response, transport_error};

    fn mask_b64(width: u32, height: u32) -> String {
        let mask = GrayImage::from_pixel(width, height, Luma([255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(mask)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf.into_inner())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        output_dir: PathBuf,
        images: Arc<ImageContextCache>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.png");
        RgbaImage::from_fn(40, 20, |x, y| Rgba([x as u8 * 5, y as u8 * 10, 200, 255]))
            .save(&source)
            .unwrap();
        let images = Arc::new(ImageContextCache::new(3000));
        images.update("B", source, Utc::now());
        Fixture {
            output_dir: dir.path().join("out"),
            _dir: dir,
            images,
        }
    }

    fn segmenter(fx: &Fixture, backend: Arc<ScriptedBackend>) -> ImageSegmenter {
        ImageSegmenter::new(backend, fx.images.clone(), "seg-model", fx.output_dir.clone(), 1024)
    }

    #[tokio::test]
    async fn missing_image_asks_for_one_without_calling_backend() {
        let fx = fixture();
        let backend = ScriptedBackend::new(vec![]);
        let outcome = segmenter(&fx, backend.clone()).segment("nobody", "cut out the cat").await;
        assert_eq!(outcome.status, SegmentStatus::Failure);
        assert_eq!(outcome.message, NO_IMAGE_MESSAGE);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn cutout_keeps_position_and_original_size() {
        let fx = fixture();
        let reply = format!(
            "```json\n{}\n```",
            json!([{
                "box_2d": [0, 0, 500, 500],
                "mask": format!("data:image/png;base64,{}", mask_b64(20, 10)),
                "label": "cat!"
            }])
        );
        let backend = ScriptedBackend::new(vec![text_response(&reply)]);
        let outcome = segmenter(&fx, backend.clone()).segment("B", "cut out the cat").await;

        assert_eq!(outcome.status, SegmentStatus::Success);
        assert_eq!(outcome.generated_files, vec![fx.output_dir.join("cat_0.png")]);
        let cutout = image::open(&outcome.generated_files[0]).unwrap().to_rgba8();
        assert_eq!(cutout.dimensions(), (40, 20));
        assert_eq!(*cutout.get_pixel(5, 5), Rgba([25, 50, 200, 255]));
        assert_eq!(cutout.get_pixel(30, 15)[3], 0);

        let req = &backend.requests()[0];
        assert_eq!(req.model, "seg-model");
        assert_eq!(req.config.response_format, ResponseFormat::Json);
        assert!(req.config.tools.is_empty());
        assert!(req.contents[0].parts[1].inline_data.is_some());
        assert!(req.contents[0].parts[0].text.as_deref().unwrap().contains("cut out the cat"));
    }

    #[tokio::test]
    async fn out_of_range_box_alone_is_a_failure() {
        let fx = fixture();
        let reply = json!([{"box_2d": [0, 0, 2000, 2000], "mask": mask_b64(4, 4), "label": "cat"}]);
        let backend = ScriptedBackend::new(vec![text_response(&reply.to_string())]);
        let outcome = segmenter(&fx, backend).segment("B", "cut out the cat").await;
        assert_eq!(outcome.status, SegmentStatus::Failure);
        assert!(outcome.generated_files.is_empty());
    }

    #[tokio::test]
    async fn bad_items_are_skipped_individually() {
        let fx = fixture();
        let reply = json!([
            {"box_2d": [500, 500, 500, 900], "mask": mask_b64(4, 4), "label": "flat"},
            {"box_2d": [0, 0, 100, 100], "mask": "!!not base64!!", "label": "broken"},
            {"box_2d": [0, 0, 100, 100], "mask": STANDARD.encode(b"not a png"), "label": "junk"},
            {"box_2d": [0, 0, 100, 100], "mask": [], "label": "empty"},
            {"box_2d": [0, 0, 100], "mask": mask_b64(4, 4), "label": "short"},
            {"mask": mask_b64(4, 4), "label": "nobox"},
            {"box_2d": [250, 250, 750, 750], "mask": [mask_b64(4, 4)], "label": "dog"}
        ]);
        let backend = ScriptedBackend::new(vec![text_response(&reply.to_string())]);
        let outcome = segmenter(&fx, backend).segment("B", "everything").await;
        assert_eq!(outcome.status, SegmentStatus::Success);
        assert_eq!(outcome.generated_files, vec![fx.output_dir.join("dog_0.png")]);
    }

    #[tokio::test]
    async fn unreadable_output_and_backend_errors() {
        let fx = fixture();
        let backend = ScriptedBackend::new(vec![
            text_response("I could not find a cat."),
            text_response(""),
            transport_error(),
        ]);
        let seg = segmenter(&fx, backend);
        assert_eq!(seg.segment("B", "cat").await.status, SegmentStatus::Failure);
        assert_eq!(seg.segment("B", "cat").await.status, SegmentStatus::Failure);
        let outcome = seg.segment("B", "cat").await;
        assert_eq!(outcome.status, SegmentStatus::Error);
        assert_eq!(outcome.message, SEGMENT_ERROR_MESSAGE);
    }

    #[test]
    fn pixel_box_rounds_against_original_size() {
        assert_eq!(
            pixel_box([100.0, 250.0, 505.0, 1000.0], 40, 20),
            Some(PixelRect { x: 10, y: 2, width: 30, height: 8 })
        );
        assert_eq!(pixel_box([0.0, 0.0, 10.0, 1000.0], 40, 20), None);
    }

    #[test]
    fn downscale_preserves_aspect_ratio() {
        let big = DynamicImage::new_rgb8(3000, 1500);
        let small = downscale_for_upload(big, 1024);
        assert_eq!((small.width(), small.height()), (1024, 512));
        let tiny = downscale_for_upload(DynamicImage::new_rgb8(300, 200), 1024);
        assert_eq!((tiny.width(), tiny.height()), (300, 200));
    }

    #[test]
    fn labels_and_fences_are_cleaned() {
        assert_eq!(sanitize_label("red car/../x"), "redcarx");
        assert_eq!(sanitize_label("小猫"), "小猫");
        assert_eq!(sanitize_label("???"), "object");
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  [1] "), "[1]");
    }
}
