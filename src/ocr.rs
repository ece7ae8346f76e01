// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/ocr.rs - 路标区域文字提取
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

use std::sync::LazyLock;

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use regex::Regex;
use thiserror::Error;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::{bbox::BBox, y4m::bt601_luma};

/// 无可用文字时的占位文本
pub const SENTINEL_TEXT: &str = "###";

/// 识别前裁剪区域统一缩放到的边长
pub const OCR_CANVAS_SIZE: u32 = 200;

/// 二值化阈值，不小于该值的像素置白
pub const OCR_BINARY_THRESHOLD: u8 = 150;

static DISALLOWED: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"[^A-Za-z0-9 \-.,]").expect("字符过滤正则表达式无效"));
static SPACES: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r" {2,}").expect("空白折叠正则表达式无效"));

/// 清洗 OCR 原始输出
///
/// NFKD 规范化后仅保留 ASCII，空白统一为空格，去掉 `[A-Za-z0-9 \-.,]` 以外的字符，
/// 折叠连续空格并去除首尾空格。结果为空时返回 [`SENTINEL_TEXT`]。
pub fn clean_ocr_text(raw: &str) -> String {
  let ascii: String = raw
    .nfkd()
    .filter(char::is_ascii)
    .map(|c| if c.is_ascii_whitespace() || c == '\x0b' { ' ' } else { c })
    .collect();
  let filtered = DISALLOWED.replace_all(&ascii, "");
  let collapsed = SPACES.replace_all(&filtered, " ");
  let text = collapsed.trim();
  if text.is_empty() {
    SENTINEL_TEXT.to_string()
  } else {
    text.to_string()
  }
}

/// 文字识别引擎
pub trait TextRecognizer {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 识别二值化后的单通道图像，返回原始文本
  fn recognize(&mut self, image: &GrayImage) -> Result<String, Self::Error>;
}

#[derive(Error, Debug)]
#[error("文字识别失败: {0}")]
pub struct OcrError(#[source] pub Box<dyn std::error::Error + Send + Sync + 'static>);

/// 裁剪并预处理路标区域：缩放到 200x200，按 BT.601 取亮度，阈值 150 二值化
///
/// 裁剪区域为空时返回 `None`。
pub fn prepare_crop(frame: &RgbImage, bbox: &BBox) -> Option<GrayImage> {
  let region = bbox.clamp_to(frame.width(), frame.height());
  if region.is_empty() {
    return None;
  }

  let crop = image::imageops::crop_imm(
    frame,
    region.x1 as u32,
    region.y1 as u32,
    region.width() as u32,
    region.height() as u32,
  )
  .to_image();
  let resized = image::imageops::resize(
    &crop,
    OCR_CANVAS_SIZE,
    OCR_CANVAS_SIZE,
    FilterType::Triangle,
  );
  Some(GrayImage::from_fn(OCR_CANVAS_SIZE, OCR_CANVAS_SIZE, |x, y| {
    let luma = bt601_luma(resized.get_pixel(x, y));
    Luma([if luma >= OCR_BINARY_THRESHOLD { 255 } else { 0 }])
  }))
}

/// 路标文字提取器
pub struct TextExtractor<R> {
  recognizer: R,
}

impl<R: TextRecognizer> TextExtractor<R> {
  pub fn new(recognizer: R) -> Self {
    Self { recognizer }
  }

  /// 提取 `bbox` 区域内清洗后的文字；区域为空时返回 `Ok(None)`
  pub fn extract(&mut self, frame: &RgbImage, bbox: &BBox) -> Result<Option<String>, OcrError> {
    let Some(binary) = prepare_crop(frame, bbox) else {
      debug!("区域 {} 面积为 0，跳过识别", bbox);
      return Ok(None);
    };
    let raw = self
      .recognizer
      .recognize(&binary)
      .map_err(|e| OcrError(Box::new(e)))?;
    Ok(Some(clean_ocr_text(&raw)))
  }
}

#[cfg(feature = "tesseract")]
mod tesseract;
#[cfg(feature = "tesseract")]
pub use self::tesseract::{Tesseract, TesseractBuilder, TesseractError};
