// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/dedup.rs - 基于交并比的全视频去重
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

//! 去重记忆
//!
//! 一次检测过程中已接受的全部边界框按接受顺序保存，只增不减。
//! 新框与记忆中任意一个框的 IoU 超过 [`DUPLICATE_IOU_THRESHOLD`] 即视为重复。
//!
//! 为避免长视频下逐个比较的开销，[`DedupMemory`] 额外维护一个均匀网格索引：
//! IoU 大于 0 的两个框必然共享至少一个网格单元，因此只需比较共享单元内的框，
//! 结果与线性扫描 [`is_duplicate`] 完全一致。

use std::collections::HashMap;

use crate::bbox::BBox;

/// 判定重复的 IoU 阈值（严格大于）
pub const DUPLICATE_IOU_THRESHOLD: f64 = 0.7;

/// 网格单元边长（像素）
const GRID_CELL_SIZE: i32 = 64;

/// 线性扫描：`candidate` 是否与 `memory` 中任一框重复
pub fn is_duplicate(candidate: &BBox, memory: &[BBox]) -> bool {
  memory
    .iter()
    .any(|seen| candidate.iou(seen) > DUPLICATE_IOU_THRESHOLD)
}

/// 一次检测过程的去重记忆
#[derive(Debug, Default)]
pub struct DedupMemory {
  boxes: Vec<BBox>,
  grid: HashMap<(i32, i32), Vec<usize>>,
}

impl DedupMemory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  /// 按接受顺序排列的全部边界框
  pub fn boxes(&self) -> &[BBox] {
    &self.boxes
  }

  pub fn is_duplicate(&self, candidate: &BBox) -> bool {
    // 退化框与任何框的交集都为 0
    if candidate.is_empty() {
      return false;
    }
    cells_of(candidate).any(|cell| {
      self.grid.get(&cell).is_some_and(|indices| {
        indices
          .iter()
          .any(|&i| candidate.iou(&self.boxes[i]) > DUPLICATE_IOU_THRESHOLD)
      })
    })
  }

  /// 追加一个已接受的框
  pub fn insert(&mut self, bbox: BBox) {
    let index = self.boxes.len();
    self.boxes.push(bbox);
    if bbox.is_empty() {
      return;
    }
    for cell in cells_of(&bbox) {
      self.grid.entry(cell).or_default().push(index);
    }
  }

  /// 若不重复则追加并返回 `true`；重复时返回 `false`，记忆不变
  pub fn check_and_insert(&mut self, bbox: BBox) -> bool {
    if self.is_duplicate(&bbox) {
      return false;
    }
    self.insert(bbox);
    true
  }
}

/// 框所覆盖的网格单元（右、下边界不含）
fn cells_of(bbox: &BBox) -> impl Iterator<Item = (i32, i32)> {
  let cx1 = bbox.x1.div_euclid(GRID_CELL_SIZE);
  let cy1 = bbox.y1.div_euclid(GRID_CELL_SIZE);
  let cx2 = (bbox.x2 - 1).div_euclid(GRID_CELL_SIZE);
  let cy2 = (bbox.y2 - 1).div_euclid(GRID_CELL_SIZE);
  (cy1..=cy2).flat_map(move |cy| (cx1..=cx2).map(move |cx| (cx, cy)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn near_identical_boxes_are_duplicates() {
    let mut memory = DedupMemory::new();
    assert!(memory.check_and_insert(BBox::new(100, 100, 200, 200)));
    assert!(!memory.check_and_insert(BBox::new(102, 101, 201, 199)));
    assert_eq!(memory.len(), 1);
  }

  #[test]
  fn threshold_is_strict() {
    // 10x10 与 10x7 完全包含：IoU = 0.7，不算重复
    let a = BBox::new(0, 0, 10, 10);
    let b = BBox::new(0, 0, 10, 7);
    assert!((a.iou(&b) - 0.7).abs() < 1e-12);
    assert!(!is_duplicate(&b, &[a]));

    let mut memory = DedupMemory::new();
    memory.insert(a);
    assert!(!memory.is_duplicate(&b));
  }

  #[test]
  fn memory_spans_the_whole_run() {
    let mut memory = DedupMemory::new();
    memory.insert(BBox::new(10, 10, 60, 60));
    for i in 0..50 {
      memory.insert(BBox::new(1000 + i * 70, 500, 1050 + i * 70, 550));
    }
    assert!(memory.is_duplicate(&BBox::new(11, 10, 60, 61)));
  }

  #[test]
  fn degenerate_boxes_are_remembered_but_never_match() {
    let mut memory = DedupMemory::new();
    assert!(memory.check_and_insert(BBox::new(5, 5, 5, 40)));
    assert!(memory.check_and_insert(BBox::new(5, 5, 5, 40)));
    assert_eq!(memory.len(), 2);
  }

  #[test]
  fn negative_coordinates_are_indexed() {
    let mut memory = DedupMemory::new();
    memory.insert(BBox::new(-100, -100, -10, -10));
    assert!(memory.is_duplicate(&BBox::new(-99, -100, -10, -11)));
  }

  proptest! {
    #[test]
    fn grid_agrees_with_linear_scan(
      boxes in proptest::collection::vec((0i32..400, 0i32..400, 1i32..200, 1i32..200), 1..40)
    ) {
      let mut memory = DedupMemory::new();
      let mut linear: Vec<BBox> = Vec::new();
      for (x, y, w, h) in boxes {
        let b = BBox::new(x, y, x + w, y + h);
        let expected = is_duplicate(&b, &linear);
        prop_assert_eq!(memory.is_duplicate(&b), expected);
        if !expected {
          linear.push(b);
          memory.insert(b);
        }
      }
      prop_assert_eq!(memory.boxes(), linear.as_slice());
    }
  }
}
