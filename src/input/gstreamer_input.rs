// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频输入
//!
//! 通过 `decodebin` 解码任意容器格式，经 `videoconvert` 转为打包 RGB 后由 appsink 取出。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! appsink 不丢帧（`drop=false`），两个阶段看到的帧序列完全一致。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{Fps, Frame, VideoInfo},
  input::{FrameSource, InputError},
};

const PREROLL_TIMEOUT_SECONDS: u64 = 10;

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("无法获取 appsink 元素")]
  AppSinkNotFound,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("文件不存在: {0}")]
  NotFound(String),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
}

/// GStreamer 视频文件帧源
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  info: VideoInfo,
  next_index: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

fn file_pipeline(path: &Path) -> String {
  let location = path.display().to_string().replace('"', "\\\"");
  format!(
    "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format=RGB \
     ! appsink name=sink sync=false max-buffers=4 drop=false",
    location
  )
}

impl GStreamerInput {
  pub fn open(path: &Path) -> Result<Self, GStreamerInputError> {
    if !path.is_file() {
      return Err(GStreamerInputError::NotFound(path.display().to_string()));
    }
    gst::init()?;

    let description = file_pipeline(path);
    info!("GStreamer 输入管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Paused)?;
    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECONDS));
    if let Err(e) = result {
      let detail = bus_error(&pipeline).unwrap_or_else(|| e.to_string());
      let _ = pipeline.set_state(gst::State::Null);
      return Err(GStreamerInputError::PipelineError(detail));
    }

    let preroll = appsink.pull_preroll().map_err(|_| {
      let detail = bus_error(&pipeline).unwrap_or_else(|| "预滚失败，文件可能不含视频流".to_string());
      GStreamerInputError::PipelineError(detail)
    })?;
    let caps = preroll.caps().ok_or(GStreamerInputError::VideoInfoError)?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

    let fps = video_info.fps();
    let fps = if fps.numer() > 0 && fps.denom() > 0 {
      Fps::new(fps.numer() as u32, fps.denom() as u32)
    } else {
      warn!("无法获取帧率，使用默认值 {}", Fps::default());
      Fps::default()
    };
    let frame_count = pipeline
      .query_duration::<gst::ClockTime>()
      .map(|d| d.nseconds() / fps.frame_duration_ns().max(1));

    let info = VideoInfo {
      width: video_info.width(),
      height: video_info.height(),
      fps,
      frame_count,
    };
    info!(
      "打开视频 {}: {}x{} @ {} fps, 约 {:?} 帧",
      path.display(),
      info.width,
      info.height,
      info.fps,
      info.frame_count
    );

    // 预滚样本在进入 Playing 后仍会由 pull_sample 再次交付
    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      info,
      next_index: 1,
      finished: false,
    })
  }

  fn pull(&mut self) -> Result<Option<gst::Sample>, GStreamerInputError> {
    match self.appsink.pull_sample() {
      Ok(sample) => Ok(Some(sample)),
      Err(_) if self.appsink.is_eos() => Ok(None),
      Err(e) => Err(GStreamerInputError::PipelineError(
        bus_error(&self.pipeline).unwrap_or_else(|| e.to_string()),
      )),
    }
  }
}

fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let bus = pipeline.bus()?;
  while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
    if let gst::MessageView::Error(err) = msg.view() {
      return Some(format!("{} ({:?})", err.error(), err.debug()));
    }
  }
  None
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    let result = self.pull().and_then(|sample| match sample {
      Some(sample) => convert_sample(&sample).map(Some),
      None => Ok(None),
    });
    match result {
      Ok(Some((image, pts_ms))) => {
        let index = self.next_index;
        self.next_index += 1;
        let timestamp_ms =
          pts_ms.unwrap_or_else(|| self.info.fps.frame_pts_ns(index - 1) / 1_000_000);
        Some(Ok(Frame {
          image,
          index,
          timestamp_ms,
        }))
      }
      Ok(None) => {
        debug!("视频结束，共 {} 帧", self.next_index - 1);
        self.finished = true;
        None
      }
      Err(e) => {
        self.finished = true;
        Some(Err(e.into()))
      }
    }
  }
}

impl FrameSource for GStreamerInput {
  fn info(&self) -> VideoInfo {
    self.info
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<(RgbImage, Option<u64>), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * height.saturating_sub(1) + width * 3;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let swap = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  };

  let mut packed = Vec::with_capacity(width * height * 3);
  for row in data.chunks(stride).take(height) {
    let row = &row[..width * 3];
    if swap {
      for px in row.chunks_exact(3) {
        packed.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      packed.extend_from_slice(row);
    }
  }

  let image = RgbImage::from_raw(width as u32, height as u32, packed).ok_or(
    GStreamerInputError::BufferSizeMismatch {
      expected: width * height * 3,
      actual: data.len(),
    },
  )?;
  let pts_ms = buffer.pts().map(|t| t.mseconds());
  Ok((image, pts_ms))
}
