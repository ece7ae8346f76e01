// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/task.rs - 检测识别与标注任务
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

use std::{path::PathBuf, str::FromStr, time::Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  bbox::BBox,
  dedup::DedupMemory,
  frame::Frame,
  input::InputError,
  model::{Detection, DetectionError, Model, SignDetector},
  ocr::{OcrError, SENTINEL_TEXT, TextExtractor, TextRecognizer},
  output::{Draw, OutputError, OutputWriter, VideoCodec},
};

/// 进度日志间隔（帧）
const PROGRESS_INTERVAL: u64 = 10;

/// 标注阶段默认的置信度下限
pub const DEFAULT_ANNOTATE_CONFIDENCE: f32 = 0.25;

/// 按位置重叠配对时要求的最小 IoU
pub const SPATIAL_MATCH_IOU: f64 = 0.3;

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 一个去重后的路标及其文字
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxRecord {
  pub bbox: BBox,
  /// 清洗后的文字，无可用文字时为 `"###"`
  pub text: String,
  /// 首次发现该路标的帧序号
  pub frame_index: u64,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("无法打开视频 {path}: {source}")]
  VideoOpen {
    path: PathBuf,
    #[source]
    source: InputError,
  },
  #[error("第 {frame_index} 帧解码失败: {source}")]
  FrameDecode {
    frame_index: u64,
    #[source]
    source: InputError,
  },
  #[error("第 {frame_index} 帧检测失败: {source}")]
  Detection {
    frame_index: u64,
    #[source]
    source: DetectionError,
  },
  #[error("第 {frame_index} 帧文字识别失败: {source}")]
  Ocr {
    frame_index: u64,
    #[source]
    source: OcrError,
  },
  #[error("写入输出失败: {0}")]
  OutputWrite(#[from] OutputError),
}

/// 检测或识别失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
  /// 立即中止，丢弃已有结果
  #[default]
  Abort,
  /// 记录告警后继续：检测失败的帧视为无目标，识别失败的路标使用占位文字
  Degrade,
}

impl FromStr for ErrorPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "abort" => Ok(ErrorPolicy::Abort),
      "degrade" => Ok(ErrorPolicy::Degrade),
      other => Err(format!("未知错误策略: {}", other)),
    }
  }
}

/// 标注阶段检测框与识别结果的配对方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingPolicy {
  /// 按出现顺序依次取用识别结果
  #[default]
  Positional,
  /// 取重叠度最高（IoU ≥ 0.3）的识别结果，可重复使用
  Spatial,
}

impl FromStr for PairingPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "positional" => Ok(PairingPolicy::Positional),
      "spatial" => Ok(PairingPolicy::Spatial),
      other => Err(format!("未知配对方式: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
  /// 最多处理的帧数，0 表示不限
  pub max_frames: u64,
  pub on_error: ErrorPolicy,
}

#[derive(Debug, Clone)]
pub struct AnnotateOptions {
  /// 最多处理的帧数，0 表示不限
  pub max_frames: u64,
  pub pairing: PairingPolicy,
  pub min_confidence: f32,
  pub codec: VideoCodec,
  /// 标注文字使用的字体，未指定时查找系统字体
  pub font: Option<PathBuf>,
}

impl Default for AnnotateOptions {
  fn default() -> Self {
    Self {
      max_frames: 0,
      pairing: PairingPolicy::default(),
      min_confidence: DEFAULT_ANNOTATE_CONFIDENCE,
      codec: VideoCodec::default(),
      font: None,
    }
  }
}

/// 标注结果统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AnnotateSummary {
  pub frames_written: u64,
  pub boxes_drawn: u64,
  /// 绘制了识别文字的框数
  pub texts_drawn: u64,
}

fn beyond_limit(max_frames: u64, frame_index: u64) -> bool {
  max_frames > 0 && frame_index > max_frames
}

fn should_log_progress(frame_index: u64) -> bool {
  frame_index == 1 || frame_index % PROGRESS_INTERVAL == 0
}

fn next_frame<I>(input: &mut I, last_index: u64) -> Result<Option<Frame>, PipelineError>
where
  I: Iterator<Item = Result<Frame, InputError>>,
{
  input
    .next()
    .transpose()
    .map_err(|source| PipelineError::FrameDecode {
      frame_index: last_index + 1,
      source,
    })
}

/// 第一阶段：检测、去重并识别路标文字
#[derive(Debug, Default)]
pub struct DetectAndOcrTask {
  options: DetectOptions,
  total_frames: Option<u64>,
}

impl DetectAndOcrTask {
  pub fn new(options: DetectOptions) -> Self {
    Self {
      options,
      total_frames: None,
    }
  }

  /// 仅用于进度日志
  pub fn with_total_frames(mut self, total_frames: Option<u64>) -> Self {
    self.total_frames = total_frames;
    self
  }
}

impl<'a, 'b, I, M, E, R> Task<I, &'a mut SignDetector<M>, &'b mut TextExtractor<R>>
  for DetectAndOcrTask
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Model<Input = RgbImage, Output = Vec<Detection>, Error = E>,
  E: std::error::Error + Send + Sync + 'static,
  R: TextRecognizer,
{
  type Output = Vec<BoxRecord>;
  type Error = PipelineError;

  fn run_task(
    self,
    mut input: I,
    detector: &'a mut SignDetector<M>,
    extractor: &'b mut TextExtractor<R>,
  ) -> Result<Self::Output, Self::Error> {
    let DetectOptions {
      max_frames,
      on_error,
    } = self.options;
    info!("开始检测与文字识别...");
    let started = Instant::now();

    let mut memory = DedupMemory::new();
    let mut records = Vec::new();
    let mut last_index = 0;

    while let Some(frame) = next_frame(&mut input, last_index)? {
      last_index = frame.index;
      if beyond_limit(max_frames, frame.index) {
        info!("达到最大帧数 {}，停止检测", max_frames);
        break;
      }
      if should_log_progress(frame.index) {
        match self.total_frames {
          Some(total) => info!("处理第 {}/{} 帧...", frame.index, total),
          None => info!("处理第 {} 帧...", frame.index),
        }
      }

      let detections = match detector.detect(&frame.image) {
        Ok(detections) => detections,
        Err(source) if on_error == ErrorPolicy::Degrade => {
          warn!("第 {} 帧检测失败，按无目标处理: {}", frame.index, source);
          Vec::new()
        }
        Err(source) => {
          return Err(PipelineError::Detection {
            frame_index: frame.index,
            source,
          });
        }
      };

      for detection in detections {
        if !memory.check_and_insert(detection.bbox) {
          debug!("第 {} 帧: {} 与已有路标重复", frame.index, detection.bbox);
          continue;
        }

        let text = match extractor.extract(&frame.image, &detection.bbox) {
          Ok(Some(text)) => text,
          Ok(None) => continue,
          Err(source) if on_error == ErrorPolicy::Degrade => {
            warn!(
              "第 {} 帧 {} 文字识别失败，使用占位文字: {}",
              frame.index, detection.bbox, source
            );
            SENTINEL_TEXT.to_string()
          }
          Err(source) => {
            return Err(PipelineError::Ocr {
              frame_index: frame.index,
              source,
            });
          }
        };

        info!("识别到文字: {}", text);
        records.push(BoxRecord {
          bbox: detection.bbox,
          text,
          frame_index: frame.index,
        });
      }
    }

    info!(
      "检测完成，共 {} 个不重复的路标，耗时 {:.2?}",
      records.len(),
      started.elapsed()
    );
    Ok(records)
  }
}

/// 为一帧中的检测结果挑选文字
///
/// 按位置配对时 `cursor` 在整个视频中共享，每取用一条记录前进一步；
/// 记录用尽后其余检测框没有文字。
pub fn pair_texts<'r>(
  detections: &[Detection],
  records: &'r [BoxRecord],
  cursor: &mut usize,
  pairing: PairingPolicy,
) -> Vec<Option<&'r str>> {
  detections
    .iter()
    .map(|detection| match pairing {
      PairingPolicy::Positional => {
        let text = records.get(*cursor).map(|r| r.text.as_str());
        if text.is_some() {
          *cursor += 1;
        }
        text
      }
      PairingPolicy::Spatial => records
        .iter()
        .map(|r| (detection.bbox.iou(&r.bbox), r))
        .filter(|(iou, _)| *iou >= SPATIAL_MATCH_IOU)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, r)| r.text.as_str()),
    })
    .collect()
}

/// 第二阶段：重新检测并把识别结果画回视频
pub struct AnnotateTask<'r> {
  records: &'r [BoxRecord],
  options: AnnotateOptions,
  draw: Draw,
}

impl<'r> AnnotateTask<'r> {
  pub fn new(records: &'r [BoxRecord], options: AnnotateOptions, draw: Draw) -> Self {
    Self {
      records,
      options,
      draw,
    }
  }
}

impl<'r, 'a, 'b, I, M, E, W> Task<I, &'a mut SignDetector<M>, &'b mut W> for AnnotateTask<'r>
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Model<Input = RgbImage, Output = Vec<Detection>, Error = E>,
  E: std::error::Error + Send + Sync + 'static,
  W: OutputWriter,
{
  type Output = AnnotateSummary;
  type Error = PipelineError;

  fn run_task(
    self,
    mut input: I,
    detector: &'a mut SignDetector<M>,
    output: &'b mut W,
  ) -> Result<Self::Output, Self::Error> {
    let AnnotateOptions {
      max_frames,
      pairing,
      min_confidence,
      ..
    } = self.options;
    info!(
      "开始标注，共 {} 条识别结果，配对方式 {:?}",
      self.records.len(),
      pairing
    );
    let started = Instant::now();

    let mut summary = AnnotateSummary::default();
    let mut cursor = 0;
    let mut last_index = 0;

    while let Some(mut frame) = next_frame(&mut input, last_index)? {
      last_index = frame.index;
      if beyond_limit(max_frames, frame.index) {
        info!("达到最大帧数 {}，停止标注", max_frames);
        break;
      }
      if should_log_progress(frame.index) {
        info!("标注第 {} 帧...", frame.index);
      }

      let detections: Vec<Detection> = detector
        .detect(&frame.image)
        .map_err(|source| PipelineError::Detection {
          frame_index: frame.index,
          source,
        })?
        .into_iter()
        .filter(|d| d.confidence >= min_confidence)
        .collect();

      let texts = pair_texts(&detections, self.records, &mut cursor, pairing);
      for (detection, text) in detections.iter().zip(texts) {
        summary.boxes_drawn += 1;
        if self.draw.draw_box(&mut frame.image, &detection.bbox, text) {
          summary.texts_drawn += 1;
        }
      }

      output.write_frame(&frame.image)?;
      summary.frames_written += 1;
    }

    output.finish()?;
    info!(
      "标注完成，写入 {} 帧，{} 个框，其中 {} 个带文字，耗时 {:.2?}",
      summary.frames_written,
      summary.boxes_drawn,
      summary.texts_drawn,
      started.elapsed()
    );
    if pairing == PairingPolicy::Positional && cursor < self.records.len() {
      warn!(
        "有 {} 条识别结果未被使用",
        self.records.len() - cursor
      );
    }
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::GrayImage;
  use std::collections::VecDeque;

  /// 按帧依次返回预设结果的模型，`None` 表示该帧推理失败
  struct Scripted(VecDeque<Option<Vec<Detection>>>);

  impl Model for Scripted {
    type Input = RgbImage;
    type Output = Vec<Detection>;
    type Error = std::io::Error;

    fn infer(&mut self, _input: &RgbImage) -> Result<Vec<Detection>, std::io::Error> {
      match self.0.pop_front().flatten() {
        Some(detections) => Ok(detections),
        None => Err(std::io::Error::other("inference failed")),
      }
    }
  }

  /// 依次返回预设文字，`None` 表示识别失败
  struct Reader(VecDeque<Option<&'static str>>);

  impl TextRecognizer for Reader {
    type Error = std::io::Error;

    fn recognize(&mut self, _image: &GrayImage) -> Result<String, std::io::Error> {
      match self.0.pop_front().flatten() {
        Some(text) => Ok(text.to_string()),
        None => Err(std::io::Error::other("engine crashed")),
      }
    }
  }

  #[derive(Default)]
  struct Collect {
    frames: Vec<RgbImage>,
    finished: bool,
  }

  impl OutputWriter for Collect {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
      self.frames.push(image.clone());
      Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      self.finished = true;
      Ok(())
    }
  }

  fn frames(n: u64) -> impl Iterator<Item = Result<Frame, InputError>> {
    (1..=n).map(|index| {
      Ok(Frame {
        image: RgbImage::new(320, 240),
        index,
        timestamp_ms: index * 40,
      })
    })
  }

  fn sign(x1: i32, y1: i32, x2: i32, y2: i32) -> Detection {
    Detection::new(BBox::new(x1, y1, x2, y2), "direction", 0.9)
  }

  fn record(x1: i32, y1: i32, x2: i32, y2: i32, text: &str) -> BoxRecord {
    BoxRecord {
      bbox: BBox::new(x1, y1, x2, y2),
      text: text.to_string(),
      frame_index: 1,
    }
  }

  fn detector(script: Vec<Option<Vec<Detection>>>) -> SignDetector<Scripted> {
    SignDetector::new(Scripted(script.into()))
  }

  fn extractor(script: Vec<Option<&'static str>>) -> TextExtractor<Reader> {
    TextExtractor::new(Reader(script.into()))
  }

  #[test]
  fn repeated_sign_is_read_once() {
    let mut detector = detector(vec![
      Some(vec![sign(100, 100, 200, 160)]),
      Some(vec![sign(102, 101, 202, 161)]),
      Some(vec![sign(101, 100, 201, 160)]),
    ]);
    let mut extractor = extractor(vec![Some(" Sortie 12 ")]);
    let records = DetectAndOcrTask::default()
      .run_task(frames(3), &mut detector, &mut extractor)
      .unwrap();
    assert_eq!(records, vec![record(100, 100, 200, 160, "Sortie 12")]);
  }

  #[test]
  fn other_signs_are_ignored_and_order_is_kept() {
    let mut detector = detector(vec![
      Some(vec![
        Detection::new(BBox::new(0, 0, 50, 50), "Other-Sign", 0.99),
        sign(10, 10, 60, 40),
        sign(200, 100, 300, 150),
      ]),
      Some(vec![sign(150, 150, 200, 200)]),
    ]);
    let mut extractor = extractor(vec![Some("A"), Some("B"), Some("@@")]);
    let records = DetectAndOcrTask::default()
      .run_task(frames(2), &mut detector, &mut extractor)
      .unwrap();
    let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["A", "B", "###"]);
    assert_eq!(records[2].frame_index, 2);
  }

  #[test]
  fn empty_crop_is_remembered_without_record() {
    // 第一帧的框完全在画面外，但仍计入去重记忆
    let mut detector = detector(vec![
      Some(vec![sign(400, 300, 500, 400)]),
      Some(vec![sign(401, 300, 500, 400)]),
    ]);
    let mut extractor = extractor(vec![]);
    let records = DetectAndOcrTask::default()
      .run_task(frames(2), &mut detector, &mut extractor)
      .unwrap();
    assert!(records.is_empty());
  }

  #[test]
  fn max_frames_stops_early() {
    let script = (0..10)
      .map(|i| Some(vec![sign(i * 30, 0, i * 30 + 20, 20)]))
      .collect();
    let mut detector = detector(script);
    let mut extractor = extractor(vec![Some("x"); 10]);
    let options = DetectOptions {
      max_frames: 4,
      ..Default::default()
    };
    let records = DetectAndOcrTask::new(options)
      .run_task(frames(10), &mut detector, &mut extractor)
      .unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records.last().map(|r| r.frame_index), Some(4));
  }

  #[test]
  fn abort_policy_fails_on_first_error() {
    let mut detector = detector(vec![Some(vec![sign(0, 0, 10, 10)]), None]);
    let mut extractor = extractor(vec![Some("ok")]);
    let err = DetectAndOcrTask::default()
      .run_task(frames(3), &mut detector, &mut extractor)
      .unwrap_err();
    assert!(matches!(err, PipelineError::Detection { frame_index: 2, .. }));

    let mut detector = self::detector(vec![Some(vec![sign(0, 0, 10, 10)])]);
    let mut extractor = self::extractor(vec![None]);
    let err = DetectAndOcrTask::default()
      .run_task(frames(1), &mut detector, &mut extractor)
      .unwrap_err();
    assert!(matches!(err, PipelineError::Ocr { frame_index: 1, .. }));
  }

  #[test]
  fn degrade_policy_keeps_going() {
    let mut detector = detector(vec![
      Some(vec![sign(0, 0, 40, 40)]),
      None,
      Some(vec![sign(100, 100, 140, 140)]),
    ]);
    let mut extractor = extractor(vec![None, Some("Nice")]);
    let options = DetectOptions {
      on_error: ErrorPolicy::Degrade,
      ..Default::default()
    };
    let records = DetectAndOcrTask::new(options)
      .run_task(frames(3), &mut detector, &mut extractor)
      .unwrap();
    let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec![SENTINEL_TEXT, "Nice"]);
  }

  #[test]
  fn decode_failure_is_fatal() {
    let input = frames(1).chain(std::iter::once(Err(InputError::Unsupported(
      "corrupt".to_string(),
    ))));
    let mut detector = detector(vec![Some(vec![])]);
    let mut extractor = extractor(vec![]);
    let err = DetectAndOcrTask::default()
      .run_task(input, &mut detector, &mut extractor)
      .unwrap_err();
    assert!(matches!(err, PipelineError::FrameDecode { frame_index: 2, .. }));
  }

  #[test]
  fn positional_pairing_shares_cursor_across_frames() {
    let records = vec![record(0, 0, 1, 1, "A"), record(0, 0, 1, 1, "B")];
    let mut cursor = 0;
    let first = pair_texts(
      &[sign(5, 5, 9, 9)],
      &records,
      &mut cursor,
      PairingPolicy::Positional,
    );
    let second = pair_texts(
      &[sign(5, 5, 9, 9), sign(20, 20, 30, 30)],
      &records,
      &mut cursor,
      PairingPolicy::Positional,
    );
    assert_eq!(first, vec![Some("A")]);
    assert_eq!(second, vec![Some("B"), None]);
    assert_eq!(cursor, 2);
  }

  #[test]
  fn spatial_pairing_uses_overlap() {
    let records = vec![
      record(0, 0, 100, 100, "Left"),
      record(200, 0, 300, 100, "Right"),
    ];
    let mut cursor = 0;
    let texts = pair_texts(
      &[
        sign(205, 5, 300, 100),
        sign(0, 0, 100, 100),
        sign(120, 300, 180, 360),
      ],
      &records,
      &mut cursor,
      PairingPolicy::Spatial,
    );
    assert_eq!(texts, vec![Some("Right"), Some("Left"), None]);
    assert_eq!(cursor, 0);
  }

  #[test]
  fn annotation_writes_every_frame() {
    let mut detector = detector(vec![
      Some(vec![]),
      Some(vec![sign(10, 10, 60, 60)]),
      Some(vec![
        sign(10, 10, 60, 60),
        Detection::new(BBox::new(100, 100, 150, 150), "direction", 0.1),
      ]),
    ]);
    let mut output = Collect::default();
    let records = vec![record(10, 10, 60, 60, "A")];
    let summary = AnnotateTask::new(&records, AnnotateOptions::default(), Draw::new())
      .run_task(frames(3), &mut detector, &mut output)
      .unwrap();

    assert_eq!(
      summary,
      AnnotateSummary {
        frames_written: 3,
        boxes_drawn: 2,
        texts_drawn: 1,
      }
    );
    assert!(output.finished);
    assert_eq!(output.frames.len(), 3);
    assert_eq!(output.frames[0].get_pixel(10, 10).0, [0, 0, 0]);
    assert_eq!(output.frames[1].get_pixel(10, 10).0, [0, 255, 0]);
    // 低于置信度下限的框不画
    assert_eq!(output.frames[2].get_pixel(100, 100).0, [0, 0, 0]);
  }

  #[test]
  fn recognized_text_is_burned_above_its_box() {
    let bbox = BBox::new(40, 120, 200, 200);
    let mut detector = detector(vec![
      Some(vec![sign(40, 120, 200, 200)]),
      Some(vec![sign(40, 120, 200, 200)]),
    ]);
    let mut output = Collect::default();
    let records = vec![record(40, 120, 200, 200, "Paris")];
    let summary = AnnotateTask::new(&records, AnnotateOptions::default(), Draw::new())
      .run_task(frames(2), &mut detector, &mut output)
      .unwrap();
    assert_eq!(summary.boxes_drawn, 2);
    assert_eq!(summary.texts_drawn, 1);

    let green_above = |image: &RgbImage| {
      image
        .enumerate_pixels()
        .filter(|(_, y, p)| *y < bbox.y1 as u32 && p.0 == [0, 255, 0])
        .count()
    };
    assert!(green_above(&output.frames[0]) > 20);

    // 识别结果用完之后只画框
    let mut box_only = RgbImage::new(320, 240);
    Draw::new().draw_box(&mut box_only, &bbox, None);
    assert_eq!(green_above(&output.frames[1]), 0);
    assert_eq!(output.frames[1], box_only);
  }

  #[test]
  fn annotation_without_records_still_copies_frames() {
    let mut detector = detector(vec![Some(vec![]); 5]);
    let mut output = Collect::default();
    let options = AnnotateOptions {
      max_frames: 3,
      ..Default::default()
    };
    let summary = AnnotateTask::new(&[], options, Draw::new())
      .run_task(frames(5), &mut detector, &mut output)
      .unwrap();
    assert_eq!(summary.frames_written, 3);
    assert_eq!(output.frames.len(), 3);
  }

  #[test]
  fn policies_parse() {
    assert_eq!("Degrade".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Degrade));
    assert_eq!("spatial".parse::<PairingPolicy>(), Ok(PairingPolicy::Spatial));
    assert!("sometimes".parse::<ErrorPolicy>().is_err());
  }
}
