// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_repeatshot.rs - 多生产者重复推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_taskpool::{
  FromUrl,
  input::InputWrapper,
  model::{MEAN_DETECTION_OUTPUT, MeanEngineBuilder},
  output::OutputWrapper,
  pool::{PoolConfig, TaskPool},
  task::{RepeatShotTask, Task},
  utils,
};
use tracing::info;

/// Shanan 任务池压力测试
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理引擎
  #[arg(long, value_name = "MODEL", default_value = "mean://?channels=3")]
  pub model: Url,
  /// 任务池配置
  #[arg(long, value_name = "POOL", default_value = "pool://?device=0&batch_size=8")]
  pub pool: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 检测输出的名称
  #[arg(long, value_name = "BLOB", default_value = MEAN_DETECTION_OUTPUT)]
  pub blob: String,
  /// 生产者线程数
  #[arg(long, value_name = "PRODUCERS", default_value = "8")]
  pub producers: usize,
  /// 每个生产者的推理次数
  #[arg(long, value_name = "REPEAT", default_value = "1000")]
  pub repeat: usize,
}

fn main() -> Result<()> {
  utils::init_logging();

  let args = Args::parse();

  info!("{}", utils::version_string());
  info!("模型: {}", args.model);
  info!("任务池: {}", args.pool);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let engine = MeanEngineBuilder::from_url(&args.model)?.build()?;
  let pool = TaskPool::open(engine, PoolConfig::from_url(&args.pool)?)?;
  let output = OutputWrapper::from_url(&args.output)?;

  RepeatShotTask::new(args.blob)
    .with_producers(args.producers)
    .with_repeat(args.repeat)
    .run_task(input, &pool, output)?;
  pool.close();

  Ok(())
}
