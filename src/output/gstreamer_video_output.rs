// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频输出
//!
//! appsrc 接收打包 RGB 帧，按帧率打时间戳后编码写入 MP4 文件。
//!
//! - [`VideoCodec::Mp4v`]: `avenc_mpeg4`（需要 `gstreamer1.0-libav`）
//! - [`VideoCodec::H264`]: `x264enc`（需要 `gstreamer1.0-plugins-ugly`）

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  frame::VideoInfo,
  output::{OutputError, OutputWriter, VideoCodec, check_frame_size},
};

const EOS_TIMEOUT_SECONDS: u64 = 30;

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("无法获取 appsrc 元素")]
  AppSrcNotFound,
  #[error("缓冲区创建失败")]
  BufferCreationError,
  #[error("推送缓冲区失败: {0:?}")]
  FlowError(gst::FlowError),
  #[error("管道错误: {0}")]
  PipelineError(String),
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  info: VideoInfo,
  stride: usize,
  frames_written: u64,
  finished: bool,
}

fn encoder_pipeline(path: &Path, codec: VideoCodec) -> String {
  let location = path.display().to_string().replace('"', "\\\"");
  let encoder = match codec {
    VideoCodec::Mp4v => "avenc_mpeg4 bitrate=4000000",
    VideoCodec::H264 => "x264enc speed-preset=fast ! h264parse",
  };
  format!(
    "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! {} ! mp4mux \
     ! filesink location=\"{}\"",
    encoder, location
  )
}

impl GStreamerVideoOutput {
  pub fn create(
    path: &Path,
    info: VideoInfo,
    codec: VideoCodec,
  ) -> Result<Self, GStreamerVideoOutputError> {
    gst::init()?;

    let description = encoder_pipeline(path, codec);
    info!("GStreamer 输出管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;
    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcNotFound)?;

    let video_info =
      gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, info.width, info.height)
        .fps(gst::Fraction::new(info.fps.num as i32, info.fps.den.max(1) as i32))
        .build()?;
    let stride = video_info.stride()[0] as usize;

    appsrc.set_caps(Some(&video_info.to_caps()?));
    appsrc.set_format(gst::Format::Time);
    // 队列满时阻塞而不是丢帧
    appsrc.set_block(true);

    pipeline.set_state(gst::State::Playing)?;

    info!(
      "视频输出初始化: {}x{} @ {} fps ({:?}) -> {}",
      info.width,
      info.height,
      info.fps,
      codec,
      path.display()
    );

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      info,
      stride,
      frames_written: 0,
      finished: false,
    })
  }

  fn push_frame(&mut self, image: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    let height = self.info.height as usize;
    let row_bytes = self.info.width as usize * 3;
    let mut buffer = gst::Buffer::with_size(self.stride * height)
      .map_err(|_| GStreamerVideoOutputError::BufferCreationError)?;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      let pts = self.info.fps.frame_pts_ns(self.frames_written);
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(
        self.info.fps.frame_duration_ns(),
      ));

      let mut map = buffer_ref.map_writable().map_err(|_| {
        GStreamerVideoOutputError::PipelineError("无法映射缓冲区".to_string())
      })?;
      for (dst, src) in map
        .as_mut_slice()
        .chunks_mut(self.stride)
        .zip(image.as_raw().chunks_exact(row_bytes))
      {
        dst[..row_bytes].copy_from_slice(src);
      }
    }

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(GStreamerVideoOutputError::FlowError)?;
    self.frames_written += 1;
    Ok(())
  }

  fn close(&mut self) -> Result<(), GStreamerVideoOutputError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;

    let result = self.wait_for_eos();
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 输出管道失败: {}", e);
    }
    info!("视频输出关闭，共写入 {} 帧", self.frames_written);
    result
  }

  fn wait_for_eos(&self) -> Result<(), GStreamerVideoOutputError> {
    self
      .appsrc
      .end_of_stream()
      .map_err(GStreamerVideoOutputError::FlowError)?;

    let bus = self
      .pipeline
      .bus()
      .ok_or_else(|| GStreamerVideoOutputError::PipelineError("管道没有总线".to_string()))?;
    let msg = bus.timed_pop_filtered(
      gst::ClockTime::from_seconds(EOS_TIMEOUT_SECONDS),
      &[gst::MessageType::Eos, gst::MessageType::Error],
    );
    match msg.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Eos(_)) => Ok(()),
      Some(gst::MessageView::Error(err)) => Err(GStreamerVideoOutputError::PipelineError(
        format!("{} ({:?})", err.error(), err.debug()),
      )),
      _ => Err(GStreamerVideoOutputError::PipelineError(
        "等待编码结束超时".to_string(),
      )),
    }
  }
}

impl OutputWriter for GStreamerVideoOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Finished);
    }
    check_frame_size(&self.info, image)?;
    Ok(self.push_frame(image)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(self.close()?)
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("关闭视频输出失败: {}", e);
    }
  }
}
