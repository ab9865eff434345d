// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 基于任务池的推理任务
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{frame::Frame, model::DetectResult, output::Render, pool::TaskPool};

pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(self, input: I, pool: &TaskPool, output: O) -> Result<(), Self::Error>;
}

/// 取一帧做一次检测
pub struct OneShotTask {
  blob_name: String,
}

impl OneShotTask {
  pub fn new(blob_name: impl Into<String>) -> Self {
    Self {
      blob_name: blob_name.into(),
    }
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Frame>,
  O: Render<Frame, DetectResult, Error = RE>,
> Task<I, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pool: &TaskPool, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = pool.detect(&frame, &self.blob_name)?;
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}", elapsed);
    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 多个生产者线程反复提交同一帧，统计平均耗时
pub struct RepeatShotTask {
  blob_name: String,
  repeat: usize,
  producers: usize,
}

impl RepeatShotTask {
  pub fn new(blob_name: impl Into<String>) -> Self {
    Self {
      blob_name: blob_name.into(),
      repeat: 1000,
      producers: 1,
    }
  }

  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat;
    self
  }

  pub fn with_producers(mut self, producers: usize) -> Self {
    self.producers = producers.max(1);
    self
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Frame>,
  O: Render<Frame, DetectResult, Error = RE> + Sync,
> Task<I, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pool: &TaskPool, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!(
      "输入帧获取成功，{} 个生产者各推理 {} 次...",
      self.producers, self.repeat
    );

    let started = Instant::now();
    let times = thread::scope(|s| -> anyhow::Result<Vec<Duration>> {
      let handles: Vec<_> = (0..self.producers)
        .map(|p| {
          let (frame, output, name) = (&frame, &output, self.blob_name.as_str());
          s.spawn(move || -> anyhow::Result<Vec<Duration>> {
            let mut times = Vec::with_capacity(self.repeat);
            for i in 0..self.repeat {
              let now = Instant::now();
              let result = pool.detect(frame, name)?;
              let elapsed = now.elapsed();
              info!("({}:{})推理完成，耗时: {:.2?}", p, i, elapsed);
              output.render_result(frame, &result)?;
              times.push(elapsed);
            }
            Ok(times)
          })
        })
        .collect();

      let mut times = Vec::new();
      for handle in handles {
        let part = handle
          .join()
          .map_err(|_| anyhow::anyhow!("生产者线程崩溃"))??;
        times.extend(part);
      }
      Ok(times)
    })?;

    if times.len() > 2 {
      warn!(
        "平均推理时间: {:.2?}, 吞吐: {:.1} 次/秒",
        times.iter().skip(2).sum::<Duration>() / (times.len() - 2) as u32,
        times.len() as f64 / started.elapsed().as_secs_f64()
      );
    }

    Ok(())
  }
}

#[derive(Debug)]
pub struct ContinuousTask {
  blob_name: String,
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn new(blob_name: impl Into<String>) -> Self {
    Self {
      blob_name: blob_name.into(),
      frame_number: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Frame>,
  O: Render<Frame, DetectResult, Error = RE>,
> Task<I, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pool: &TaskPool, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let interrupted = Arc::new(AtomicBool::new(false));

    {
      let interrupted = interrupted.clone();
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        interrupted.store(true, Ordering::SeqCst);
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    }

    let mut frame_index = 0;
    let mut now = Instant::now();
    for frame in input {
      frame_index += 1;
      info!("处理第 {} 帧图像", frame_index);
      let result = pool.detect(&frame, &self.blob_name)?;
      let elapsed_a = now.elapsed();
      output.render_result(&frame, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();
      info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
      if self.frame_number.map(|n| frame_index >= n).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if interrupted.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，退出");
    Ok(())
  }
}
