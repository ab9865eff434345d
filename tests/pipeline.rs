// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 任务池端到端测试
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

#![cfg(all(
  feature = "model_mean",
  feature = "read_image_file",
  feature = "directory_record"
))]

use std::{
  path::{Path, PathBuf},
  thread,
};

use anyhow::{Result, anyhow};
use url::Url;

use shanan_taskpool::{
  Frame, FromUrl, PoolConfig, PoolError, TaskPool,
  input::InputWrapper,
  model::{MEAN_DETECTION_OUTPUT, MEAN_OUTPUT, MeanEngineBuilder},
  output::OutputWrapper,
  task::{ContinuousTask, OneShotTask, Task},
};

fn mean_pool(batch_size: usize) -> Result<TaskPool> {
  let engine =
    MeanEngineBuilder::from_url(&Url::parse("mean://?channels=3&threshold=200")?)?.build()?;
  Ok(TaskPool::open(
    engine,
    PoolConfig::default().batch_size(batch_size),
  )?)
}

fn recorded_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut stack = vec![dir.to_path_buf()];
  while let Some(d) = stack.pop() {
    for entry in std::fs::read_dir(d)? {
      let path = entry?.path();
      if path.is_dir() {
        stack.push(path);
      } else {
        files.push(path);
      }
    }
  }
  Ok(files)
}

#[test]
fn concurrent_forwards_get_their_own_slice() -> Result<()> {
  let pool = mean_pool(4)?;
  let values = [0u8, 51, 102, 255];

  thread::scope(|s| -> Result<()> {
    let handles: Vec<_> = values
      .iter()
      .map(|&v| {
        let pool = &pool;
        s.spawn(move || pool.forward(&Frame::filled(16, 8, 3, v), MEAN_OUTPUT))
      })
      .collect();

    for (handle, v) in handles.into_iter().zip(values) {
      let blob = handle.join().map_err(|_| anyhow!("生产者线程崩溃"))??;
      assert_eq!(blob.shape(), [1, 3, 1, 1]);
      for m in blob.values() {
        assert!((m - v as f32 / 255.0).abs() < 1e-6);
      }
    }
    Ok(())
  })?;

  pool.close();
  assert!(!pool.is_running());
  Ok(())
}

#[test]
fn detections_come_back_in_pixels() -> Result<()> {
  let pool = mean_pool(2)?;
  let mut frame = Frame::with_shape(40, 20, 3);
  for y in 5..10usize {
    let row = (y * 40 + 10) * 3;
    frame.as_mut()[row..row + 10 * 3].fill(255);
  }

  let result = pool.detect(&frame, MEAN_DETECTION_OUTPUT)?;
  assert_eq!(result.len(), 1);
  assert_eq!(result.items[0].bbox, [10.0, 5.0, 20.0, 10.0]);
  assert!((result.items[0].score - 0.0625).abs() < 1e-6);

  let dark = pool.detect(&Frame::filled(40, 20, 3, 0), MEAN_DETECTION_OUTPUT)?;
  assert!(dark.is_empty());
  Ok(())
}

#[test]
fn shape_mismatch_fails_the_cycle_but_not_the_pool() -> Result<()> {
  let pool = mean_pool(2)?;
  let gray = Frame::filled(4, 4, 1, 10);
  assert!(matches!(
    pool.forward(&gray, MEAN_OUTPUT),
    Err(PoolError::Engine(_))
  ));

  assert!(pool.is_running());
  let blob = pool.forward(&Frame::filled(4, 4, 3, 255), MEAN_OUTPUT)?;
  assert_eq!(blob.values(), &[1.0, 1.0, 1.0]);
  Ok(())
}

#[test]
fn folder_to_folder_pipeline() -> Result<()> {
  let input_dir = tempfile::tempdir()?;
  let output_dir = tempfile::tempdir()?;
  image::RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]))
    .save(input_dir.path().join("a.png"))?;
  image::RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]))
    .save(input_dir.path().join("b.png"))?;
  std::fs::write(input_dir.path().join("notes.txt"), "skip")?;

  let input = InputWrapper::from_url(&Url::parse(&format!(
    "folder://{}",
    input_dir.path().display()
  ))?)?;
  let output = OutputWrapper::from_url(&Url::parse(&format!(
    "folder://{}?always",
    output_dir.path().display()
  ))?)?;

  let pool = mean_pool(4)?;
  ContinuousTask::new(MEAN_DETECTION_OUTPUT).run_task(input, &pool, output)?;

  let files = recorded_files(output_dir.path())?;
  assert_eq!(files.len(), 2);
  let mut labels = Vec::new();
  for file in files {
    let record: serde_json::Value = serde_json::from_slice(&std::fs::read(file)?)?;
    assert_eq!(record["width"], 8);
    labels.push(record["detections"].as_array().map(Vec::len).unwrap_or(0));
  }
  labels.sort();
  assert_eq!(labels, vec![0, 1]);
  Ok(())
}

#[test]
fn one_shot_from_image_file() -> Result<()> {
  let dir = tempfile::tempdir()?;
  let path = dir.path().join("frame.png");
  image::RgbImage::from_pixel(6, 4, image::Rgb([250, 250, 250])).save(&path)?;

  let input = InputWrapper::from_url(&Url::parse(&format!("image://{}", path.display()))?)?;
  let output = OutputWrapper::from_url(&Url::parse("log://")?)?;
  let pool = mean_pool(1)?;
  OneShotTask::new(MEAN_DETECTION_OUTPUT).run_task(input, &pool, output)?;
  Ok(())
}
