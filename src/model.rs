// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/model.rs - 模型与路标检测器
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

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::bbox::BBox;

/// 保留类别：非文字路标，两个阶段都无条件丢弃
pub const OTHER_SIGN_LABEL: &str = "other-sign";

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// 像素坐标边界框
  pub bbox: BBox,
  /// 类别名称
  pub label: String,
  /// 置信度
  pub confidence: f32,
}

impl Detection {
  pub fn new(bbox: BBox, label: impl Into<String>, confidence: f32) -> Self {
    Self {
      bbox,
      label: label.into(),
      confidence,
    }
  }

  pub fn is_other_sign(&self) -> bool {
    self.label.eq_ignore_ascii_case(OTHER_SIGN_LABEL)
  }
}

#[derive(Error, Debug)]
#[error("推理失败: {0}")]
pub struct DetectionError(#[source] pub Box<dyn std::error::Error + Send + Sync + 'static>);

/// 路标检测器
///
/// 包装任意输出 [`Detection`] 列表的模型，过滤保留类别。
pub struct SignDetector<M> {
  model: M,
}

impl<M, E> SignDetector<M>
where
  M: Model<Input = RgbImage, Output = Vec<Detection>, Error = E>,
  E: std::error::Error + Send + Sync + 'static,
{
  pub fn new(model: M) -> Self {
    Self { model }
  }

  /// 对一帧运行推理，返回保留下来的检测结果，顺序与模型输出一致
  pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectionError> {
    let raw = self
      .model
      .infer(image)
      .map_err(|e| DetectionError(Box::new(e)))?;
    let total = raw.len();
    let kept: Vec<Detection> = raw
      .into_iter()
      .filter(|d| !d.is_other_sign())
      .collect();
    debug!("检测到 {} 个目标，保留 {} 个", total, kept.len());
    Ok(kept)
  }
}

#[cfg(feature = "onnx")]
mod yolo;
#[cfg(feature = "onnx")]
pub use self::yolo::{Yolo, YoloBuilder, YoloError};
