// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/input.rs - 视频输入
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

use std::path::Path;

use thiserror::Error;

use crate::frame::{Frame, VideoInfo};

mod y4m_input;
pub use self::y4m_input::Y4mInput;

#[cfg(feature = "gstreamer")]
mod gstreamer_input;
#[cfg(feature = "gstreamer")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Y4M 输入错误: {0}")]
  Y4mError(#[from] crate::y4m::Y4mError),
  #[cfg(feature = "gstreamer")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("不支持的视频源: {0}")]
  Unsupported(String),
}

/// 顺序读取的帧源
///
/// 按呈现顺序产出帧，帧序号从 1 开始；读完后返回 `None`。
/// 底层句柄在值被丢弃时释放。
pub trait FrameSource: Iterator<Item = Result<Frame, InputError>> {
  fn info(&self) -> VideoInfo;
}

/// 按扩展名选择的输入源
pub enum InputWrapper {
  Y4m(Y4mInput),
  #[cfg(feature = "gstreamer")]
  GStreamer(GStreamerInput),
}

impl Iterator for InputWrapper {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::Y4m(input) => input.next(),
      #[cfg(feature = "gstreamer")]
      InputWrapper::GStreamer(input) => input.next(),
    }
  }
}

impl FrameSource for InputWrapper {
  fn info(&self) -> VideoInfo {
    match self {
      InputWrapper::Y4m(input) => input.info(),
      #[cfg(feature = "gstreamer")]
      InputWrapper::GStreamer(input) => input.info(),
    }
  }
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// 打开视频文件
///
/// `.y4m` 由 `y4m` crate 解码，其他容器交给 GStreamer 解码。
pub fn open_video_source(path: &Path) -> Result<InputWrapper, InputError> {
  if has_extension(path, "y4m") {
    return Ok(InputWrapper::Y4m(Y4mInput::open(path)?));
  }

  #[cfg(feature = "gstreamer")]
  {
    Ok(InputWrapper::GStreamer(GStreamerInput::open(path)?))
  }

  #[cfg(not(feature = "gstreamer"))]
  {
    Err(InputError::Unsupported(format!(
      "{} (未启用 gstreamer 特性，仅支持 .y4m)",
      path.display()
    )))
  }
}
