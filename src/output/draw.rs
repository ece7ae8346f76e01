// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/output/draw.rs - 路标框与文字绘制
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;

use crate::bbox::BBox;

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_THICKNESS: i32 = 2;
const TEXT_FONT_SIZE: f32 = 22.0;
// 文字基线位于框上沿之上 10 像素
const TEXT_BASELINE_OFFSET: i32 = 10;

// DejaVu Sans，许可见 assets/FONT_LICENSE
const EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("字体文件无效 {0}")]
  InvalidFont(PathBuf),
}

fn load_font(path: &Path) -> Result<FontVec, DrawError> {
  let data = std::fs::read(path).map_err(|source| DrawError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  FontVec::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.to_path_buf()))
}

/// 标注绘制器
pub struct Draw {
  font: FontArc,
  font_size: f32,
  color: Rgb<u8>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new()
  }
}

impl Draw {
  /// 使用内嵌字体
  pub fn new() -> Self {
    let font = FontArc::try_from_slice(EMBEDDED_FONT).expect("无法加载嵌入的字体文件");
    Self::with_font(font)
  }

  /// 使用指定的字体文件
  pub fn from_font_file(path: &Path) -> Result<Self, DrawError> {
    Ok(Self::with_font(FontArc::new(load_font(path)?)))
  }

  pub fn with_font(font: FontArc) -> Self {
    Self {
      font,
      font_size: TEXT_FONT_SIZE,
      color: Rgb(BOX_COLOR),
    }
  }

  /// 画一个 2 像素宽的绿色框，`text` 非空时写在框的左上方
  ///
  /// 返回是否实际绘制了文字。
  pub fn draw_box(&self, image: &mut RgbImage, bbox: &BBox, text: Option<&str>) -> bool {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for t in 0..BOX_THICKNESS {
      let x1 = bbox.x1 + t;
      let y1 = bbox.y1 + t;
      let x2 = bbox.x2 - t;
      let y2 = bbox.y2 - t;
      if x2 < x1 || y2 < y1 || x2 < 0 || y2 < 0 || x1 >= w || y1 >= h {
        break;
      }
      let rect = Rect::at(x1, y1).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32);
      draw_hollow_rect_mut(image, rect, self.color);
    }

    let Some(text) = text.filter(|t| !t.is_empty()) else {
      return false;
    };
    let scale = PxScale::from(self.font_size);
    let (_, text_height) = text_size(scale, &self.font, text);
    let y = bbox.y1 - TEXT_BASELINE_OFFSET - text_height as i32;
    draw_text_mut(image, self.color, bbox.x1, y, scale, &self.font, text);
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn green(image: &RgbImage, x: u32, y: u32) -> bool {
    image.get_pixel(x, y).0 == BOX_COLOR
  }

  #[test]
  fn box_is_two_pixels_thick() {
    let draw = Draw::new();
    let mut image = RgbImage::new(100, 80);
    let drew_text = draw.draw_box(&mut image, &BBox::new(10, 20, 60, 70), None);
    assert!(!drew_text);

    assert!(green(&image, 10, 20));
    assert!(green(&image, 11, 21));
    assert!(green(&image, 60, 70));
    assert!(green(&image, 59, 69));
    assert!(!green(&image, 12, 22));
    assert!(!green(&image, 35, 45));
    assert!(!green(&image, 9, 20));
  }

  #[test]
  fn boxes_partly_outside_are_clipped() {
    let draw = Draw::new();
    let mut image = RgbImage::new(50, 50);
    draw.draw_box(&mut image, &BBox::new(-20, -20, 30, 30), None);
    assert!(green(&image, 30, 10));
    assert!(green(&image, 10, 30));

    let mut untouched = RgbImage::new(50, 50);
    draw.draw_box(&mut untouched, &BBox::new(60, 60, 90, 90), None);
    assert!(untouched.pixels().all(|p| p.0 == [0, 0, 0]));
  }

  #[test]
  fn text_sits_above_the_box() {
    let draw = Draw::new();
    let bbox = BBox::new(20, 60, 180, 90);
    let mut image = RgbImage::new(200, 100);
    assert!(draw.draw_box(&mut image, &bbox, Some("Paris")));

    let above: Vec<(u32, u32)> = image
      .enumerate_pixels()
      .filter(|(_, y, p)| *y < bbox.y1 as u32 && p.0[1] > 0)
      .map(|(x, y, _)| (x, y))
      .collect();
    assert!(above.iter().any(|&(x, y)| green(&image, x, y)));
    // 文字从框的左边缘开始，且与框之间留有空隙
    assert!(above.iter().all(|&(x, y)| x >= 20 && x < 120 && y + 2 < bbox.y1 as u32));
  }

  #[test]
  fn empty_text_draws_only_the_box() {
    let draw = Draw::new();
    let bbox = BBox::new(20, 60, 180, 90);
    let mut with_empty = RgbImage::new(200, 100);
    assert!(!draw.draw_box(&mut with_empty, &bbox, Some("")));
    let mut without = RgbImage::new(200, 100);
    draw.draw_box(&mut without, &bbox, None);
    assert_eq!(with_empty, without);
  }

  #[test]
  fn font_files_are_checked() {
    let err = Draw::from_font_file(Path::new("/nonexistent/font.ttf")).err();
    assert!(matches!(err, Some(DrawError::Io { .. })));

    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("bogus.ttf");
    std::fs::write(&bogus, b"not a font").unwrap();
    let err = Draw::from_font_file(&bogus).err();
    assert!(matches!(err, Some(DrawError::InvalidFont(_))));
  }
}
