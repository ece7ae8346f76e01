// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/bbox.rs - 像素坐标边界框
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

use serde::{Deserialize, Serialize};

/// 轴对齐边界框，像素坐标 `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
  pub x1: i32,
  pub y1: i32,
  pub x2: i32,
  pub y2: i32,
}

impl BBox {
  pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  /// 由浮点坐标截断得到整数框
  pub fn from_xyxy(xyxy: [f32; 4]) -> Self {
    Self::new(
      xyxy[0] as i32,
      xyxy[1] as i32,
      xyxy[2] as i32,
      xyxy[3] as i32,
    )
  }

  pub fn width(&self) -> i64 {
    (self.x2 as i64 - self.x1 as i64).max(0)
  }

  pub fn height(&self) -> i64 {
    (self.y2 as i64 - self.y1 as i64).max(0)
  }

  /// 面积，退化框为 0
  pub fn area(&self) -> i64 {
    self.width() * self.height()
  }

  pub fn is_empty(&self) -> bool {
    self.area() == 0
  }

  pub fn intersection(&self, other: &BBox) -> i64 {
    let x1 = self.x1.max(other.x1) as i64;
    let y1 = self.y1.max(other.y1) as i64;
    let x2 = self.x2.min(other.x2) as i64;
    let y2 = self.y2.min(other.y2) as i64;
    (x2 - x1).max(0) * (y2 - y1).max(0)
  }

  /// 交并比，并集面积为 0 时返回 0
  pub fn iou(&self, other: &BBox) -> f64 {
    let intersection = self.intersection(other);
    let union = self.area() + other.area() - intersection;
    if union > 0 {
      intersection as f64 / union as f64
    } else {
      0.0
    }
  }

  /// 裁剪到 `width` x `height` 的图像范围内
  pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
    let w = width.min(i32::MAX as u32) as i32;
    let h = height.min(i32::MAX as u32) as i32;
    BBox::new(
      self.x1.clamp(0, w),
      self.y1.clamp(0, h),
      self.x2.clamp(0, w),
      self.y2.clamp(0, h),
    )
  }
}

impl std::fmt::Display for BBox {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
  }
}
