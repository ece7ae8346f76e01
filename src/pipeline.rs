// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/pipeline.rs - 以文件路径为入口的两个处理阶段
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

//! 两个阶段各自打开视频，互不共享内存状态：
//!
//! 1. [`detect_and_ocr`] 逐帧检测路标，去重后识别文字，返回按发现顺序排列的 [`BoxRecord`]；
//! 2. [`annotate_video`] 重新检测，把第一阶段的文字按顺序配给检测框，画出后逐帧写入输出视频。

use std::{
  io::{BufReader, BufWriter, Read, Write},
  path::Path,
};

use image::RgbImage;
use tracing::warn;

use crate::{
  input::{FrameSource, open_video_source},
  model::{Detection, Model, SignDetector},
  ocr::{TextExtractor, TextRecognizer},
  output::{Draw, create_video_output, prepare_output_path},
  task::{
    AnnotateOptions, AnnotateSummary, AnnotateTask, BoxRecord, DetectAndOcrTask, DetectOptions,
    PipelineError, Task,
  },
};

/// 第一阶段：检测并识别 `video` 中所有不重复的路标
pub fn detect_and_ocr<M, E, R>(
  video: &Path,
  detector: &mut SignDetector<M>,
  extractor: &mut TextExtractor<R>,
  options: DetectOptions,
) -> Result<Vec<BoxRecord>, PipelineError>
where
  M: Model<Input = RgbImage, Output = Vec<Detection>, Error = E>,
  E: std::error::Error + Send + Sync + 'static,
  R: TextRecognizer,
{
  let input = open_video_source(video).map_err(|source| PipelineError::VideoOpen {
    path: video.to_path_buf(),
    source,
  })?;
  let total_frames = input.info().frame_count;
  DetectAndOcrTask::new(options)
    .with_total_frames(total_frames)
    .run_task(input, detector, extractor)
}

/// 第二阶段：把 `records` 画回视频并写入 `output`
///
/// `output` 已存在时先删除。输出沿用源视频的尺寸与帧率。
pub fn annotate_video<M, E>(
  video: &Path,
  records: &[BoxRecord],
  detector: &mut SignDetector<M>,
  output: &Path,
  options: AnnotateOptions,
) -> Result<AnnotateSummary, PipelineError>
where
  M: Model<Input = RgbImage, Output = Vec<Detection>, Error = E>,
  E: std::error::Error + Send + Sync + 'static,
{
  prepare_output_path(output)?;

  let input = open_video_source(video).map_err(|source| PipelineError::VideoOpen {
    path: video.to_path_buf(),
    source,
  })?;
  let mut writer = create_video_output(output, input.info(), options.codec)?;

  let draw = match options.font.as_deref() {
    Some(path) => Draw::from_font_file(path).unwrap_or_else(|e| {
      warn!("{}，改为使用内嵌字体", e);
      Draw::new()
    }),
    None => Draw::new(),
  };

  AnnotateTask::new(records, options, draw).run_task(input, detector, &mut writer)
}

/// 以 JSON 写出识别结果，返回前刷新缓冲区
pub fn write_records<W: Write>(records: &[BoxRecord], writer: W) -> std::io::Result<()> {
  let mut writer = BufWriter::new(writer);
  serde_json::to_writer_pretty(&mut writer, records)?;
  writer.flush()
}

/// 读取 [`write_records`] 写出的识别结果
pub fn read_records<R: Read>(reader: R) -> std::io::Result<Vec<BoxRecord>> {
  Ok(serde_json::from_reader(BufReader::new(reader))?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bbox::BBox;

  /// 写入总是失败，模拟磁盘已满
  struct DiskFull;

  impl Write for DiskFull {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
      Err(std::io::Error::other("no space left on device"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  fn records() -> Vec<BoxRecord> {
    vec![BoxRecord {
      bbox: BBox::new(1, 2, 3, 4),
      text: "N7".to_string(),
      frame_index: 9,
    }]
  }

  #[test]
  fn buffered_write_failure_is_reported() {
    let err = write_records(&records(), DiskFull).unwrap_err();
    assert!(err.to_string().contains("no space left"));
  }

  #[test]
  fn records_read_back() {
    let mut buffer = Vec::new();
    write_records(&records(), &mut buffer).unwrap();
    assert_eq!(read_records(buffer.as_slice()).unwrap(), records());
  }
}
