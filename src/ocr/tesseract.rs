// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/ocr/tesseract.rs - Tesseract 文字识别引擎
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

//! # Tesseract 识别引擎
//!
//! 通过 `leptess` 调用系统安装的 Tesseract。数据目录与语言由构建器显式传入，
//! 不读取 `TESSDATA_PREFIX` 之外的任何进程级配置。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libleptonica-dev libtesseract-dev tesseract-ocr-fra
//! ```
//!
//! ## URL 格式
//!
//! - `tesseract:///usr/share/tessdata?lang=fra` - 指定数据目录与语言
//! - `tesseract:?lang=eng` - 使用默认数据目录

use std::collections::HashMap;
use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat};
use leptess::LepTess;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, ocr::TextRecognizer};

const TESSERACT_DEFAULT_LANGUAGE: &str = "fra";
// 200x200 画布上的路标文字按 70 dpi 处理，避免 Tesseract 的分辨率告警
const TESSERACT_SOURCE_DPI: i32 = 70;

#[derive(Error, Debug)]
pub enum TesseractError {
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("Tesseract 初始化失败 (lang={lang}): {message}")]
  Init { lang: String, message: String },
  #[error("图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
  #[error("图像载入失败: {0}")]
  Image(String),
  #[error("识别结果不是有效的 UTF-8: {0}")]
  Utf8(#[from] std::str::Utf8Error),
}

pub struct TesseractBuilder {
  data_path: Option<String>,
  language: String,
}

impl Default for TesseractBuilder {
  fn default() -> Self {
    Self {
      data_path: None,
      language: TESSERACT_DEFAULT_LANGUAGE.to_string(),
    }
  }
}

impl FromUrlWithScheme for TesseractBuilder {
  const SCHEME: &'static str = "tesseract";
}

impl FromUrl for TesseractBuilder {
  type Error = TesseractError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(TesseractError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let path = crate::decode_url_path(url);
    let mut builder = TesseractBuilder::default();
    if !path.is_empty() && path != "/" {
      builder = builder.data_path(path);
    }
    if let Some(lang) = query.get("lang") {
      builder = builder.language(lang.clone());
    }
    Ok(builder)
  }
}

impl TesseractBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// tessdata 目录
  pub fn data_path(mut self, path: impl Into<String>) -> Self {
    self.data_path = Some(path.into());
    self
  }

  pub fn language(mut self, language: impl Into<String>) -> Self {
    self.language = language.into();
    self
  }

  pub fn build(self) -> Result<Tesseract, TesseractError> {
    info!(
      "初始化 Tesseract: 数据目录 {}, 语言 {}",
      self.data_path.as_deref().unwrap_or("<默认>"),
      self.language
    );
    let engine = LepTess::new(self.data_path.as_deref(), &self.language).map_err(|e| {
      TesseractError::Init {
        lang: self.language.clone(),
        message: e.to_string(),
      }
    })?;
    Ok(Tesseract {
      engine,
      language: self.language,
    })
  }
}

/// Tesseract 识别引擎
pub struct Tesseract {
  engine: LepTess,
  language: String,
}

impl Tesseract {
  pub fn language(&self) -> &str {
    &self.language
  }
}

impl TextRecognizer for Tesseract {
  type Error = TesseractError;

  fn recognize(&mut self, image: &GrayImage) -> Result<String, Self::Error> {
    // BMP 不依赖 leptonica 的可选编解码库
    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image.clone()).write_to(&mut encoded, ImageFormat::Bmp)?;

    self
      .engine
      .set_image_from_mem(encoded.get_ref())
      .map_err(|e| TesseractError::Image(e.to_string()))?;
    self.engine.set_source_resolution(TESSERACT_SOURCE_DPI);

    let text = self.engine.get_utf8_text()?;
    debug!("Tesseract 原始输出: {:?}", text);
    Ok(text)
  }
}
