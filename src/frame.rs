// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/frame.rs - 视频帧与视频参数定义
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

/// 解码后的一帧
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧序号，从 1 开始
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

/// 帧率，分数形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fps {
  pub num: u32,
  pub den: u32,
}

impl Fps {
  pub const fn new(num: u32, den: u32) -> Self {
    Self { num, den }
  }

  pub fn as_f64(&self) -> f64 {
    if self.den == 0 {
      0.0
    } else {
      self.num as f64 / self.den as f64
    }
  }

  /// 第 `n` 帧（从 0 开始）的呈现时间，纳秒
  pub fn frame_pts_ns(&self, n: u64) -> u64 {
    if self.num == 0 {
      return 0;
    }
    ((n as u128 * self.den as u128 * 1_000_000_000) / self.num as u128) as u64
  }

  /// 单帧时长，纳秒
  pub fn frame_duration_ns(&self) -> u64 {
    self.frame_pts_ns(1)
  }
}

impl Default for Fps {
  fn default() -> Self {
    Self::new(30, 1)
  }
}

impl std::fmt::Display for Fps {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.num, self.den)
  }
}

/// 视频流参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
  pub width: u32,
  pub height: u32,
  pub fps: Fps,
  /// 估计的总帧数，未知时为 `None`
  pub frame_count: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pts_follows_fractional_rate() {
    let fps = Fps::new(30000, 1001);
    assert_eq!(fps.frame_pts_ns(0), 0);
    assert_eq!(fps.frame_pts_ns(30000), 1001 * 1_000_000_000);
    assert_eq!(fps.frame_duration_ns(), 33_366_666);
  }

  #[test]
  fn zero_rate_is_harmless() {
    let fps = Fps::new(0, 1);
    assert_eq!(fps.as_f64(), 0.0);
    assert_eq!(fps.frame_pts_ns(10), 0);
  }
}
