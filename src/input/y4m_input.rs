// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/input/y4m_input.rs - YUV4MPEG2 文件输入
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

use std::{
  fs::File,
  io::{BufReader, Read},
  path::Path,
};

use ::y4m::Decoder;
use tracing::{debug, info, warn};

use crate::{
  frame::{Fps, Frame, VideoInfo},
  input::{FrameSource, InputError},
  y4m::{COLORRANGE_FULL, Chroma, Y4mError, decode_planes},
};

const FILE_MAGIC_LEN: usize = "YUV4MPEG2 ".len();
const FRAME_HEADER_LEN: usize = "FRAME\n".len();

/// `.y4m` 文件帧源
pub struct Y4mInput<R: Read = BufReader<File>> {
  decoder: Decoder<R>,
  info: VideoInfo,
  chroma: Chroma,
  full_range: bool,
  trailing_bytes: u64,
  next_index: u64,
  finished: bool,
}

impl Y4mInput {
  pub fn open(path: &Path) -> Result<Self, Y4mError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = Self::from_reader(BufReader::new(file))?;

    // 帧头不带参数时每帧等长，可由文件大小推算帧数
    let header_len = (FILE_MAGIC_LEN + input.decoder.get_raw_params().len() + 1) as u64;
    let per_frame =
      (FRAME_HEADER_LEN + input.chroma.frame_bytes(input.info.width, input.info.height)) as u64;
    let payload = file_len.saturating_sub(header_len);
    input.info.frame_count = Some(payload / per_frame);
    input.trailing_bytes = payload % per_frame;

    info!(
      "打开 Y4M 文件 {}: {}x{} @ {} fps, 约 {:?} 帧",
      path.display(),
      input.info.width,
      input.info.height,
      input.info.fps,
      input.info.frame_count
    );
    Ok(input)
  }
}

impl<R: Read> Y4mInput<R> {
  pub fn from_reader(reader: R) -> Result<Self, Y4mError> {
    let decoder = Decoder::new(reader)?;
    let chroma = Chroma::from_colorspace(decoder.get_colorspace())?;
    let full_range = decoder
      .get_raw_params()
      .split(|&b| b == b' ')
      .any(|param| param.strip_prefix(b"X") == Some(COLORRANGE_FULL));

    let rate = decoder.get_framerate();
    let fps = if rate.num > 0 && rate.den > 0 {
      Fps::new(rate.num as u32, rate.den as u32)
    } else {
      warn!("Y4M 帧率 {} 无效，使用默认值 {}", rate, Fps::default());
      Fps::default()
    };

    let info = VideoInfo {
      width: decoder.get_width() as u32,
      height: decoder.get_height() as u32,
      fps,
      frame_count: None,
    };
    Ok(Self {
      decoder,
      info,
      chroma,
      full_range,
      trailing_bytes: 0,
      next_index: 1,
      finished: false,
    })
  }
}

impl<R: Read> Iterator for Y4mInput<R> {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    let VideoInfo {
      width, height, fps, ..
    } = self.info;
    let (chroma, full_range) = (self.chroma, self.full_range);

    match self.decoder.read_frame() {
      Ok(frame) => {
        let image = decode_planes(&frame, width, height, chroma, full_range);
        let index = self.next_index;
        self.next_index += 1;
        Some(Ok(Frame {
          image,
          index,
          timestamp_ms: fps.frame_pts_ns(index - 1) / 1_000_000,
        }))
      }
      // 不完整的末尾帧同样表现为 EOF
      Err(::y4m::Error::EOF) => {
        if self.trailing_bytes > 0 {
          warn!("文件末尾有 {} 字节不足一帧，已忽略", self.trailing_bytes);
        }
        debug!("Y4M 读取结束，共 {} 帧", self.next_index - 1);
        self.finished = true;
        None
      }
      Err(e) => {
        warn!("读取第 {} 帧失败: {}", self.next_index, e);
        self.finished = true;
        Some(Err(Y4mError::from(e).into()))
      }
    }
  }
}

impl<R: Read> FrameSource for Y4mInput<R> {
  fn info(&self) -> VideoInfo {
    self.info
  }
}
