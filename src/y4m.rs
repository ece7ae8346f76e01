// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/y4m.rs - YUV4MPEG2 平面数据与颜色转换
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

//! YUV4MPEG2 (`.y4m`) 是无压缩的简单视频容器，不依赖任何系统库。
//! 容器本身由 `y4m` crate 读写，本模块只负责平面 YUV 与 RGB 之间的 BT.601 全范围转换。

use ::y4m::Colorspace;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// 全范围扩展字段（`XCOLORRANGE=FULL`）
pub const COLORRANGE_FULL: &[u8] = b"COLORRANGE=FULL";

#[derive(Error, Debug)]
pub enum Y4mError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("Y4M 编解码错误: {0}")]
  Codec(#[from] ::y4m::Error),
  #[error("不支持的色度格式: {0:?}")]
  UnsupportedColorspace(Colorspace),
}

/// 8 位色度采样方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
  C444,
  C422,
  C420,
  Mono,
}

impl Chroma {
  pub fn from_colorspace(colorspace: Colorspace) -> Result<Self, Y4mError> {
    match colorspace {
      Colorspace::C444 => Ok(Chroma::C444),
      Colorspace::C422 => Ok(Chroma::C422),
      Colorspace::C420
      | Colorspace::C420jpeg
      | Colorspace::C420paldv
      | Colorspace::C420mpeg2 => Ok(Chroma::C420),
      Colorspace::Cmono => Ok(Chroma::Mono),
      other => Err(Y4mError::UnsupportedColorspace(other)),
    }
  }

  fn chroma_dims(&self, width: u32, height: u32) -> (u32, u32) {
    match self {
      Chroma::C444 => (width, height),
      Chroma::C422 => (width.div_ceil(2), height),
      Chroma::C420 => (width.div_ceil(2), height.div_ceil(2)),
      Chroma::Mono => (0, 0),
    }
  }

  fn chroma_index(&self, x: usize, y: usize, chroma_width: usize) -> usize {
    match self {
      Chroma::C444 | Chroma::Mono => y * chroma_width + x,
      Chroma::C422 => y * chroma_width + x / 2,
      Chroma::C420 => (y / 2) * chroma_width + x / 2,
    }
  }

  /// 单帧三个平面的总字节数（不含帧头）
  pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
    let (cw, ch) = self.chroma_dims(width, height);
    width as usize * height as usize + 2 * cw as usize * ch as usize
  }
}

/// 将一帧平面 YUV 数据转换为 RGB 图像
///
/// 平面长度由解码器保证与 `width`、`height`、`chroma` 一致。
pub fn decode_planes(
  frame: &::y4m::Frame,
  width: u32,
  height: u32,
  chroma: Chroma,
  full_range: bool,
) -> RgbImage {
  let (y_plane, u_plane, v_plane) = (frame.get_y_plane(), frame.get_u_plane(), frame.get_v_plane());
  let w = width as usize;
  let cw = chroma.chroma_dims(width, height).0 as usize;
  RgbImage::from_fn(width, height, |x, y| {
    let (x, y) = (x as usize, y as usize);
    let luma = y_plane[y * w + x];
    let (u, v) = match chroma {
      Chroma::Mono => (128, 128),
      _ => {
        let ci = chroma.chroma_index(x, y, cw);
        (u_plane[ci], v_plane[ci])
      }
    };
    yuv_to_rgb(luma, u, v, full_range)
  })
}

/// 将 RGB 图像拆分为 4:4:4 的 Y、U、V 平面
pub fn encode_planes(image: &RgbImage, planes: &mut [Vec<u8>; 3]) {
  for plane in planes.iter_mut() {
    plane.clear();
  }
  for pixel in image.pixels() {
    let (y, u, v) = rgb_to_yuv(pixel);
    planes[0].push(y);
    planes[1].push(u);
    planes[2].push(v);
  }
}

fn clamp_u8(v: f32) -> u8 {
  v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 亮度，四舍五入
pub fn bt601_luma(pixel: &Rgb<u8>) -> u8 {
  let [r, g, b] = pixel.0.map(f32::from);
  clamp_u8(0.299 * r + 0.587 * g + 0.114 * b)
}

/// BT.601 全范围
pub fn rgb_to_yuv(pixel: &Rgb<u8>) -> (u8, u8, u8) {
  let [r, g, b] = pixel.0.map(f32::from);
  let u = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
  let v = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
  (bt601_luma(pixel), clamp_u8(u), clamp_u8(v))
}

pub fn yuv_to_rgb(y: u8, u: u8, v: u8, full_range: bool) -> Rgb<u8> {
  let y = if full_range {
    y as f32
  } else {
    (y as f32 - 16.0) * 255.0 / 219.0
  };
  let scale = if full_range { 1.0 } else { 255.0 / 224.0 };
  let u = (u as f32 - 128.0) * scale;
  let v = (v as f32 - 128.0) * scale;
  Rgb([
    clamp_u8(y + 1.402 * v),
    clamp_u8(y - 0.344_136 * u - 0.714_136 * v),
    clamp_u8(y + 1.772 * u),
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn luma_uses_bt601_weights() {
    assert_eq!(bt601_luma(&Rgb([255, 120, 120])), 160);
    assert_eq!(bt601_luma(&Rgb([0, 255, 0])), 150);
    assert_eq!(bt601_luma(&Rgb([255, 255, 255])), 255);
  }

  #[test]
  fn primary_colors_survive_conversion() {
    for rgb in [[0, 0, 0], [255, 255, 255], [0, 255, 0], [200, 30, 30]] {
      let (y, u, v) = rgb_to_yuv(&Rgb(rgb));
      let back = yuv_to_rgb(y, u, v, true).0;
      for c in 0..3 {
        assert!((back[c] as i32 - rgb[c] as i32).abs() <= 2, "{:?} -> {:?}", rgb, back);
      }
    }
  }

  #[test]
  fn subsampled_frames_decode() {
    let (y, u, v): (&[u8], &[u8], &[u8]) = (&[255; 4], &[128], &[128]);
    let frame = ::y4m::Frame::new([y, u, v], None);
    let image = decode_planes(&frame, 2, 2, Chroma::C420, true);
    assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));
    assert_eq!(Chroma::C420.frame_bytes(3, 3), 9 + 2 * 4);
    assert_eq!(Chroma::C422.frame_bytes(4, 2), 8 + 2 * 4);
  }

  #[test]
  fn high_bit_depth_is_rejected() {
    assert!(matches!(
      Chroma::from_colorspace(Colorspace::C420p10),
      Err(Y4mError::UnsupportedColorspace(_))
    ));
    assert_eq!(Chroma::from_colorspace(Colorspace::C420jpeg).unwrap(), Chroma::C420);
  }
}
