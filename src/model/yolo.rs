// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/model/yolo.rs - ONNX Runtime 上的 YOLO 路标检测模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # YOLO 检测模型
//!
//! 支持两种常见的 ONNX 导出格式：
//!
//! - Ultralytics 检测头 `[1, 4 + nc, N]`，输出 `cx, cy, w, h` 与各类别分数，需要 NMS；
//! - 端到端检测头 `[1, N, 6]`，输出 `x1, y1, x2, y2, score, class`，无需 NMS。
//!
//! ## URL 格式
//!
//! `yolo:///path/to/model.onnx?conf=0.25&iou=0.7&labels=/path/to/labels.txt&threads=4`
//!
//! 未指定 `labels` 时从模型元数据的 `names` 字段读取类别名称。

use std::collections::HashMap;
use std::sync::LazyLock;

use image::RgbImage;
use ndarray::Array4;
use ort::{
  inputs,
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  bbox::BBox,
  model::{Detection, Model},
};

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_DEFAULT_CONFIDENCE: f32 = 0.25;
const YOLO_DEFAULT_NMS_IOU: f32 = 0.7;
const YOLO_MAX_DETECTIONS: usize = 300;
const YOLO_DEFAULT_THREADS: usize = 4;

static NAMES_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(\d+)\s*:\s*['"]([^'"]*)['"]"#).expect("names 正则表达式无效")
});

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(String),
  #[error("类别文件读取错误: {0}")]
  LabelsError(#[from] std::io::Error),
  #[error("不支持的输出形状: {0:?}")]
  UnsupportedOutput(Vec<usize>),
}

impl YoloError {
  fn ort(e: impl std::fmt::Display) -> Self {
    YoloError::OrtError(e.to_string())
  }
}

pub struct YoloBuilder {
  model_path: String,
  labels_path: Option<String>,
  confidence_threshold: f32,
  nms_threshold: f32,
  threads: usize,
}

impl FromUrlWithScheme for YoloBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloBuilder {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = YoloBuilder::new(crate::decode_url_path(url));
    if let Some(conf) = query.get("conf").and_then(|v| v.parse().ok()) {
      builder = builder.confidence(conf);
    }
    if let Some(iou) = query.get("iou").and_then(|v| v.parse().ok()) {
      builder = builder.nms_threshold(iou);
    }
    if let Some(threads) = query.get("threads").and_then(|v| v.parse().ok()) {
      builder.threads = threads;
    }
    builder.labels_path = query.get("labels").cloned();
    Ok(builder)
  }
}

impl YoloBuilder {
  pub fn new(model_path: impl Into<String>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      confidence_threshold: YOLO_DEFAULT_CONFIDENCE,
      nms_threshold: YOLO_DEFAULT_NMS_IOU,
      threads: YOLO_DEFAULT_THREADS,
    }
  }

  pub fn confidence(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn labels(mut self, path: impl Into<String>) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn build(self) -> Result<Yolo, YoloError> {
    if self.model_path.is_empty() {
      return Err(YoloError::ModelPathError("模型路径为空".to_string()));
    }

    info!("加载模型文件: {}", self.model_path);
    let session = Session::builder()
      .map_err(YoloError::ort)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(YoloError::ort)?
      .with_intra_threads(self.threads)
      .map_err(YoloError::ort)?
      .commit_from_file(&self.model_path)
      .map_err(YoloError::ort)?;

    let (input_width, input_height) = session
      .inputs
      .first()
      .and_then(|input| input.input_type.tensor_shape())
      .map(|shape| {
        let dims: Vec<i64> = shape.iter().copied().collect();
        let dim = |i: usize| {
          dims
            .get(i)
            .copied()
            .filter(|&d| d > 0)
            .map(|d| d as u32)
            .unwrap_or(YOLO_DEFAULT_INPUT_SIZE)
        };
        (dim(3), dim(2))
      })
      .unwrap_or((YOLO_DEFAULT_INPUT_SIZE, YOLO_DEFAULT_INPUT_SIZE));
    debug!("模型输入尺寸: {}x{}", input_width, input_height);

    let labels = match &self.labels_path {
      Some(path) => {
        let content = std::fs::read_to_string(path)?;
        parse_labels_file(&content)
      }
      None => {
        let names = session
          .metadata()
          .and_then(|meta| meta.custom("names"))
          .map_err(YoloError::ort)?;
        match names {
          Some(names) => parse_names_metadata(&names),
          None => {
            warn!("模型元数据中没有类别名称，将使用类别编号");
            Vec::new()
          }
        }
      }
    };
    info!("模型加载完成，类别数: {}", labels.len());

    Ok(Yolo {
      session,
      input_width,
      input_height,
      labels,
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
    })
  }
}

/// YOLO 检测模型
pub struct Yolo {
  session: Session,
  input_width: u32,
  input_height: u32,
  labels: Vec<String>,
  confidence_threshold: f32,
  nms_threshold: f32,
}

impl Yolo {
  pub fn labels(&self) -> &[String] {
    &self.labels
  }

  /// 等比缩放后居中填充到模型输入尺寸，归一化为 NCHW
  fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::new(
      image.width(),
      image.height(),
      self.input_width,
      self.input_height,
    );
    let resized = image::imageops::resize(
      image,
      letterbox.new_width,
      letterbox.new_height,
      image::imageops::FilterType::Triangle,
    );

    let mut input = Array4::<f32>::from_elem(
      (1, 3, self.input_height as usize, self.input_width as usize),
      LETTERBOX_FILL,
    );
    for (x, y, pixel) in resized.enumerate_pixels() {
      let (x, y) = ((x + letterbox.pad_x) as usize, (y + letterbox.pad_y) as usize);
      for c in 0..3 {
        input[[0, c, y, x]] = pixel[c] as f32 / 255.0;
      }
    }
    (input, letterbox)
  }
}

impl Model for Yolo {
  type Input = RgbImage;
  type Output = Vec<Detection>;
  type Error = YoloError;

  fn infer(&mut self, image: &RgbImage) -> Result<Self::Output, Self::Error> {
    let (input, letterbox) = self.preprocess(image);

    debug!("执行模型推理");
    let (shape, data) = {
      let input_ref = TensorRef::from_array_view(&input).map_err(YoloError::ort)?;
      let outputs = self
        .session
        .run(inputs![input_ref])
        .map_err(YoloError::ort)?;
      let output = outputs[0]
        .try_extract_array::<f32>()
        .map_err(YoloError::ort)?;
      (
        output.shape().to_vec(),
        output.iter().copied().collect::<Vec<f32>>(),
      )
    };
    debug!("模型输出形状: {:?}", shape);

    let decode = DecodeParams {
      letterbox,
      frame_width: image.width(),
      frame_height: image.height(),
      confidence_threshold: self.confidence_threshold,
    };

    let candidates = match OutputLayout::from_shape(&shape)? {
      OutputLayout::Ultralytics { channels, anchors } => {
        let candidates = decode_ultralytics(&data, channels, anchors, &decode);
        nms(candidates, self.nms_threshold)
      }
      OutputLayout::EndToEnd { rows } => decode_end_to_end(&data, rows, &decode),
    };

    let detections = candidates
      .into_iter()
      .take(YOLO_MAX_DETECTIONS)
      .map(|c| {
        let label = self
          .labels
          .get(c.class_id)
          .cloned()
          .unwrap_or_else(|| format!("class{}", c.class_id));
        Detection::new(BBox::from_xyxy(c.xyxy), label, c.score)
      })
      .collect::<Vec<_>>();

    debug!("检测到 {} 个物体", detections.len());
    Ok(detections)
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputLayout {
  Ultralytics { channels: usize, anchors: usize },
  EndToEnd { rows: usize },
}

impl OutputLayout {
  fn from_shape(shape: &[usize]) -> Result<Self, YoloError> {
    match shape {
      [1, rows, 6] if *rows != 6 => Ok(OutputLayout::EndToEnd { rows: *rows }),
      [1, channels, anchors] if *channels > 4 => Ok(OutputLayout::Ultralytics {
        channels: *channels,
        anchors: *anchors,
      }),
      _ => Err(YoloError::UnsupportedOutput(shape.to_vec())),
    }
  }
}

/// 填充区域的灰度值，与 Ultralytics 一致
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// 等比缩放与居中填充的几何参数
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
  scale: f32,
  new_width: u32,
  new_height: u32,
  pad_x: u32,
  pad_y: u32,
}

impl Letterbox {
  fn new(frame_width: u32, frame_height: u32, input_width: u32, input_height: u32) -> Self {
    let scale = (input_width as f32 / frame_width as f32)
      .min(input_height as f32 / frame_height as f32);
    let new_width = ((frame_width as f32 * scale).round() as u32).clamp(1, input_width);
    let new_height = ((frame_height as f32 * scale).round() as u32).clamp(1, input_height);
    Self {
      scale,
      new_width,
      new_height,
      pad_x: (input_width - new_width) / 2,
      pad_y: (input_height - new_height) / 2,
    }
  }
}

struct DecodeParams {
  letterbox: Letterbox,
  frame_width: u32,
  frame_height: u32,
  confidence_threshold: f32,
}

impl DecodeParams {
  /// 去掉填充、还原缩放，并裁剪到帧内
  fn to_frame(&self, xyxy: [f32; 4]) -> [f32; 4] {
    let Letterbox {
      scale, pad_x, pad_y, ..
    } = self.letterbox;
    let fw = self.frame_width as f32;
    let fh = self.frame_height as f32;
    let x = |v: f32| ((v - pad_x as f32) / scale).clamp(0.0, fw);
    let y = |v: f32| ((v - pad_y as f32) / scale).clamp(0.0, fh);
    [x(xyxy[0]), y(xyxy[1]), x(xyxy[2]), y(xyxy[3])]
  }
}

#[derive(Debug, Clone)]
struct Candidate {
  xyxy: [f32; 4],
  score: f32,
  class_id: usize,
}

fn decode_ultralytics(
  data: &[f32],
  channels: usize,
  anchors: usize,
  params: &DecodeParams,
) -> Vec<Candidate> {
  let num_classes = channels - 4;
  let mut candidates = Vec::new();
  if data.len() < channels * anchors {
    warn!(
      "输出数据长度不足: {} < {}",
      data.len(),
      channels * anchors
    );
    return candidates;
  }

  for i in 0..anchors {
    let mut score = f32::MIN;
    let mut class_id = 0usize;
    for c in 0..num_classes {
      let s = data[(4 + c) * anchors + i];
      if s > score {
        score = s;
        class_id = c;
      }
    }
    if score <= params.confidence_threshold {
      continue;
    }

    let cx = data[i];
    let cy = data[anchors + i];
    let w = data[2 * anchors + i];
    let h = data[3 * anchors + i];
    let xyxy = params.to_frame([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
    candidates.push(Candidate {
      xyxy,
      score,
      class_id,
    });
  }
  candidates
}

fn decode_end_to_end(data: &[f32], rows: usize, params: &DecodeParams) -> Vec<Candidate> {
  let mut candidates: Vec<Candidate> = data
    .chunks_exact(6)
    .take(rows)
    .filter(|row| row[4] > params.confidence_threshold)
    .map(|row| Candidate {
      xyxy: params.to_frame([row[0], row[1], row[2], row[3]]),
      score: row[4],
      class_id: row[5].max(0.0) as usize,
    })
    .collect();
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
  candidates
}

/// 按类别的非极大值抑制，结果按置信度降序
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = result.iter().any(|kept| {
      kept.class_id == candidate.class_id && iou_xyxy(&kept.xyxy, &candidate.xyxy) > threshold
    });
    if !suppressed {
      result.push(candidate);
    }
  }
  result
}

fn iou_xyxy(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

/// 每行一个类别名称，忽略空行
fn parse_labels_file(content: &str) -> Vec<String> {
  content
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .map(String::from)
    .collect()
}

/// 解析 Ultralytics 元数据中的 `{0: 'name', 1: 'name'}` 形式
fn parse_names_metadata(names: &str) -> Vec<String> {
  let mut entries: Vec<(usize, String)> = NAMES_ENTRY
    .captures_iter(names)
    .filter_map(|cap| Some((cap[1].parse().ok()?, cap[2].to_string())))
    .collect();
  entries.sort_by_key(|(id, _)| *id);

  let len = entries.last().map(|(id, _)| id + 1).unwrap_or(0);
  let mut labels: Vec<String> = (0..len).map(|i| format!("class{}", i)).collect();
  for (id, name) in entries {
    labels[id] = name;
  }
  labels
}

#[cfg(test)]
mod tests {
  use super::*;

  fn params() -> DecodeParams {
    DecodeParams {
      letterbox: Letterbox::new(1280, 720, 640, 640),
      frame_width: 1280,
      frame_height: 720,
      confidence_threshold: 0.25,
    }
  }

  #[test]
  fn wide_frames_are_letterboxed() {
    assert_eq!(
      Letterbox::new(1280, 720, 640, 640),
      Letterbox {
        scale: 0.5,
        new_width: 640,
        new_height: 360,
        pad_x: 0,
        pad_y: 140,
      }
    );
    let tall = Letterbox::new(480, 960, 640, 640);
    assert_eq!((tall.new_width, tall.new_height), (320, 640));
    assert_eq!((tall.pad_x, tall.pad_y), (160, 0));
  }

  #[test]
  fn names_metadata_is_parsed_in_id_order() {
    let labels = parse_names_metadata("{1: 'other-sign', 0: 'panneau', 2: \"stop\"}");
    assert_eq!(labels, vec!["panneau", "other-sign", "stop"]);
  }

  #[test]
  fn layout_is_inferred_from_shape() {
    assert_eq!(
      OutputLayout::from_shape(&[1, 6, 8400]).unwrap(),
      OutputLayout::Ultralytics {
        channels: 6,
        anchors: 8400
      }
    );
    assert_eq!(
      OutputLayout::from_shape(&[1, 300, 6]).unwrap(),
      OutputLayout::EndToEnd { rows: 300 }
    );
    assert!(OutputLayout::from_shape(&[1, 3]).is_err());
  }

  #[test]
  fn ultralytics_head_is_decoded_and_rescaled() {
    // 两个类别，三个锚点；只有锚点 1 超过阈值
    let anchors = 3;
    let mut data = vec![0.0f32; 6 * anchors];
    data[1] = 320.0; // cx
    data[anchors + 1] = 320.0; // cy
    data[2 * anchors + 1] = 64.0; // w
    data[3 * anchors + 1] = 64.0; // h
    data[5 * anchors + 1] = 0.9; // class 1

    let candidates = decode_ultralytics(&data, 6, anchors, &params());
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].class_id, 1);
    assert_eq!(BBox::from_xyxy(candidates[0].xyxy), BBox::new(576, 296, 704, 424));
  }

  #[test]
  fn nms_is_class_aware() {
    let a = Candidate {
      xyxy: [0.0, 0.0, 100.0, 100.0],
      score: 0.9,
      class_id: 0,
    };
    let b = Candidate {
      xyxy: [2.0, 2.0, 100.0, 100.0],
      score: 0.8,
      class_id: 0,
    };
    let c = Candidate {
      xyxy: [2.0, 2.0, 100.0, 100.0],
      score: 0.7,
      class_id: 1,
    };
    let kept = nms(vec![b, c, a], 0.7);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].class_id, 1);
  }

  #[test]
  fn end_to_end_rows_are_clamped() {
    let data = vec![
      600.0, 400.0, 700.0, 500.0, 0.8, 0.0, //
      0.0, 0.0, 10.0, 10.0, 0.1, 1.0,
    ];
    let candidates = decode_end_to_end(&data, 2, &params());
    assert_eq!(candidates.len(), 1);
    assert_eq!(BBox::from_xyxy(candidates[0].xyxy), BBox::new(1200, 520, 1280, 720));
  }
}
