// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/output.rs - 视频输出
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

use std::{path::Path, str::FromStr};

use image::RgbImage;
use thiserror::Error;
use tracing::info;

use crate::{frame::VideoInfo, input::has_extension};

pub mod draw;
pub use self::draw::Draw;

mod y4m_output;
pub use self::y4m_output::Y4mOutput;

#[cfg(feature = "gstreamer")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("帧尺寸 {actual:?} 与输出尺寸 {expected:?} 不一致")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("Y4M 输出错误: {0}")]
  Y4mError(#[from] crate::y4m::Y4mError),
  #[error("输出已结束")]
  Finished,
  #[cfg(feature = "gstreamer")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[error("不支持的输出: {0}")]
  Unsupported(String),
}

/// 视频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
  /// MPEG-4 Part 2
  #[default]
  Mp4v,
  H264,
}

impl FromStr for VideoCodec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "mp4v" | "mpeg4" => Ok(VideoCodec::Mp4v),
      "h264" | "avc" => Ok(VideoCodec::H264),
      other => Err(format!("未知编码: {}", other)),
    }
  }
}

/// 输出写入器
pub trait OutputWriter {
  /// 追加一帧，尺寸须与创建时一致
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError>;

  /// 刷新并关闭输出，之后不能再写入
  fn finish(&mut self) -> Result<(), OutputError>;
}

pub enum OutputWrapper {
  Y4m(Y4mOutput),
  #[cfg(feature = "gstreamer")]
  GStreamerVideo(GStreamerVideoOutput),
}

impl OutputWriter for OutputWrapper {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    match self {
      OutputWrapper::Y4m(output) => output.write_frame(image),
      #[cfg(feature = "gstreamer")]
      OutputWrapper::GStreamerVideo(output) => output.write_frame(image),
    }
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    match self {
      OutputWrapper::Y4m(output) => output.finish(),
      #[cfg(feature = "gstreamer")]
      OutputWrapper::GStreamerVideo(output) => output.finish(),
    }
  }
}

pub(crate) fn check_frame_size(info: &VideoInfo, image: &RgbImage) -> Result<(), OutputError> {
  if image.dimensions() != (info.width, info.height) {
    return Err(OutputError::FrameSizeMismatch {
      expected: (info.width, info.height),
      actual: image.dimensions(),
    });
  }
  Ok(())
}

/// 删除已存在的输出文件
pub fn prepare_output_path(path: &Path) -> Result<(), OutputError> {
  match std::fs::remove_file(path) {
    Ok(()) => {
      info!("已删除旧的输出文件 {}", path.display());
      Ok(())
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

/// 创建视频输出
///
/// `.y4m` 直接写出无压缩帧，其余路径交给 GStreamer 按 `codec` 编码并封装为 MP4。
pub fn create_video_output(
  path: &Path,
  info: VideoInfo,
  codec: VideoCodec,
) -> Result<OutputWrapper, OutputError> {
  if has_extension(path, "y4m") {
    return Ok(OutputWrapper::Y4m(Y4mOutput::create(path, info)?));
  }

  #[cfg(feature = "gstreamer")]
  {
    Ok(OutputWrapper::GStreamerVideo(GStreamerVideoOutput::create(
      path, info, codec,
    )?))
  }

  #[cfg(not(feature = "gstreamer"))]
  {
    let _ = codec;
    Err(OutputError::Unsupported(format!(
      "{} (未启用 gstreamer 特性，仅支持 .y4m)",
      path.display()
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codec_names() {
    assert_eq!("mp4v".parse::<VideoCodec>().unwrap(), VideoCodec::Mp4v);
    assert_eq!("H264".parse::<VideoCodec>().unwrap(), VideoCodec::H264);
    assert!("vp9".parse::<VideoCodec>().is_err());
  }

  #[test]
  fn missing_output_is_fine_to_prepare() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.y4m");
    prepare_output_path(&path).unwrap();
    std::fs::write(&path, b"stale").unwrap();
    prepare_output_path(&path).unwrap();
    assert!(!path.exists());
  }
}
