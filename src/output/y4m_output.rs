// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/output/y4m_output.rs - YUV4MPEG2 文件输出
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

use std::{fs::File, path::Path};

use ::y4m::{Colorspace, Encoder, Ratio, VendorExtensionString};
use image::RgbImage;
use tracing::info;

use crate::{
  frame::VideoInfo,
  output::{OutputError, OutputWriter, check_frame_size},
  y4m::{COLORRANGE_FULL, Y4mError, encode_planes},
};

/// `.y4m` 文件输出，4:4:4 全范围
///
/// 直接写入文件不经缓冲，写入错误在 [`OutputWriter::write_frame`] 中即时返回。
pub struct Y4mOutput {
  encoder: Option<Encoder<File>>,
  info: VideoInfo,
  planes: [Vec<u8>; 3],
  frames_written: u64,
}

impl Y4mOutput {
  pub fn create(path: &Path, info: VideoInfo) -> Result<Self, OutputError> {
    let file = File::create(path)?;
    let rate = Ratio::new(info.fps.num as usize, info.fps.den as usize);
    let encoder = ::y4m::encode(info.width as usize, info.height as usize, rate)
      .with_colorspace(Colorspace::C444)
      .append_vendor_extension(
        VendorExtensionString::new(COLORRANGE_FULL.to_vec()).map_err(Y4mError::from)?,
      )
      .write_header(file)
      .map_err(Y4mError::from)?;
    info!(
      "Y4M 输出: {}x{} @ {} fps -> {}",
      info.width,
      info.height,
      info.fps,
      path.display()
    );
    Ok(Self {
      encoder: Some(encoder),
      info,
      planes: Default::default(),
      frames_written: 0,
    })
  }
}

impl OutputWriter for Y4mOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    check_frame_size(&self.info, image)?;
    let encoder = self.encoder.as_mut().ok_or(OutputError::Finished)?;
    encode_planes(image, &mut self.planes);
    let [y, u, v] = &self.planes;
    let frame = ::y4m::Frame::new([y.as_slice(), u.as_slice(), v.as_slice()], None);
    encoder.write_frame(&frame).map_err(Y4mError::from)?;
    self.frames_written += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    if self.encoder.take().is_some() {
      info!("Y4M 输出完成，共写入 {} 帧", self.frames_written);
    }
    Ok(())
  }
}
