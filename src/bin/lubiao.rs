// 该文件是 Lubiao （路标识读） 项目的一部分。
// src/bin/lubiao.rs - 命令行入口
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
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use url::Url;

use lubiao::{
  BoxRecord, FromUrl,
  model::{SignDetector, Yolo, YoloBuilder},
  ocr::{TesseractBuilder, TextExtractor},
  output::VideoCodec,
  pipeline::{annotate_video, detect_and_ocr, read_records, write_records},
  task::{AnnotateOptions, DetectOptions, ErrorPolicy, PairingPolicy},
};

/// 路标检测、文字识别与视频标注
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// 检测路标并识别文字
  Detect {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    detect: DetectArgs,
    /// 识别结果保存路径（JSON），不指定时打印到标准输出
    #[arg(long, value_name = "JSON")]
    results: Option<PathBuf>,
  },
  /// 使用已有的识别结果标注视频
  Annotate {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    annotate: AnnotateArgs,
    /// 识别结果（JSON）
    #[arg(long, value_name = "JSON")]
    results: PathBuf,
  },
  /// 依次执行检测识别与标注
  Run {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    detect: DetectArgs,
    #[command(flatten)]
    annotate: AnnotateArgs,
    /// 同时保存识别结果（JSON）
    #[arg(long, value_name = "JSON")]
    results: Option<PathBuf>,
  },
}

#[derive(Args, Debug)]
struct CommonArgs {
  /// 输入视频
  #[arg(long, value_name = "VIDEO")]
  input: PathBuf,
  /// 检测模型，例如 yolo:///models/signs.onnx?conf=0.25
  #[arg(long, value_name = "MODEL")]
  model: Url,
  /// 最大处理帧数，0 表示不限
  #[arg(long, default_value = "0", value_name = "COUNT")]
  max_frames: u64,
}

#[derive(Args, Debug)]
struct DetectArgs {
  /// 文字识别引擎，例如 tesseract:///usr/share/tessdata?lang=fra
  #[arg(long, default_value = "tesseract:?lang=fra", value_name = "OCR")]
  ocr: Url,
  /// 检测或识别失败时的处理方式（abort / degrade）
  #[arg(long, default_value = "abort", value_name = "POLICY")]
  on_error: ErrorPolicy,
}

#[derive(Args, Debug)]
struct AnnotateArgs {
  /// 输出视频
  #[arg(long, value_name = "OUTPUT")]
  output: PathBuf,
  /// 检测框与识别结果的配对方式（positional / spatial）
  #[arg(long, default_value = "positional", value_name = "PAIRING")]
  pairing: PairingPolicy,
  /// 输出编码（mp4v / h264）
  #[arg(long, default_value = "mp4v", value_name = "CODEC")]
  codec: VideoCodec,
  /// 标注文字使用的 TrueType 字体
  #[arg(long, value_name = "TTF")]
  font: Option<PathBuf>,
}

fn load_detector(url: &Url) -> Result<SignDetector<Yolo>> {
  info!("加载模型: {}", url);
  let model = YoloBuilder::from_url(url)?
    .build()
    .with_context(|| format!("无法加载模型 {}", url))?;
  info!("模型类别: {:?}", model.labels());
  Ok(SignDetector::new(model))
}

fn detect(common: &CommonArgs, args: &DetectArgs) -> Result<Vec<BoxRecord>> {
  let mut detector = load_detector(&common.model)?;
  let engine = TesseractBuilder::from_url(&args.ocr)?
    .build()
    .with_context(|| format!("无法初始化文字识别引擎 {}", args.ocr))?;
  info!("文字识别语言: {}", engine.language());
  let mut extractor = TextExtractor::new(engine);

  let options = DetectOptions {
    max_frames: common.max_frames,
    on_error: args.on_error,
  };
  detect_and_ocr(&common.input, &mut detector, &mut extractor, options)
    .with_context(|| format!("检测识别 {} 失败", common.input.display()))
}

fn annotate(common: &CommonArgs, args: &AnnotateArgs, records: &[BoxRecord]) -> Result<()> {
  let mut detector = load_detector(&common.model)?;
  let options = AnnotateOptions {
    max_frames: common.max_frames,
    pairing: args.pairing,
    codec: args.codec,
    font: args.font.clone(),
    ..Default::default()
  };
  let summary = annotate_video(
    &common.input,
    records,
    &mut detector,
    &args.output,
    options,
  )
  .with_context(|| format!("标注视频写入 {} 失败", args.output.display()))?;
  info!(
    "标注视频已保存到 {}: {} 帧, {} 个框, {} 个带文字",
    args.output.display(),
    summary.frames_written,
    summary.boxes_drawn,
    summary.texts_drawn
  );
  Ok(())
}

fn save_records(records: &[BoxRecord], path: Option<&Path>) -> Result<()> {
  match path {
    Some(path) => {
      let file =
        File::create(path).with_context(|| format!("无法创建 {}", path.display()))?;
      write_records(records, file).with_context(|| format!("无法写入 {}", path.display()))?;
      info!("识别结果已保存到 {}", path.display());
    }
    None => println!("{}", serde_json::to_string_pretty(records)?),
  }
  Ok(())
}

fn load_records(path: &Path) -> Result<Vec<BoxRecord>> {
  let file = File::open(path).with_context(|| format!("无法打开 {}", path.display()))?;
  read_records(file).with_context(|| format!("无法解析识别结果 {}", path.display()))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();

  match cli.command {
    Command::Detect {
      common,
      detect: args,
      results,
    } => {
      let records = detect(&common, &args)?;
      save_records(&records, results.as_deref())?;
    }
    Command::Annotate {
      common,
      annotate: args,
      results,
    } => {
      let records = load_records(&results)?;
      info!("读取 {} 条识别结果", records.len());
      annotate(&common, &args, &records)?;
    }
    Command::Run {
      common,
      detect: detect_args,
      annotate: annotate_args,
      results,
    } => {
      let records = detect(&common, &detect_args)?;
      if let Some(path) = results.as_deref() {
        save_records(&records, Some(path))?;
      }
      annotate(&common, &annotate_args, &records)?;
    }
  }

  Ok(())
}
