// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/mean.rs - CPU 参考推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  blob::TensorView,
  frame::Frame,
  model::{DetectItem, DetectResult, Engine, encode_detections},
};

/// 每个通道的均值，形状 (N, C, 1, 1)
pub const MEAN_OUTPUT: &str = "mean";
/// 打包的检测结果，形状 (1, 1, 1, L)
pub const MEAN_DETECTION_OUTPUT: &str = "detection_out";

const MEAN_DEFAULT_CHANNELS: u32 = 3;
const MEAN_DEFAULT_THRESHOLD: u8 = 200;
const MEAN_DEFAULT_DEVICES: usize = 1;
const MEAN_DETECTION_LABEL: i32 = 1;

#[derive(Error, Debug)]
pub enum MeanEngineError {
  #[error("输入通道数不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch { expected: u32, actual: u32 },
  #[error("批大小不匹配: 期望 {expected}, 实际 {actual}")]
  BatchMismatch { expected: usize, actual: usize },
  #[error("设备 {index} 不存在 (共 {count} 个)")]
  Device { index: usize, count: usize },
  #[error("模型路径必须使用 {0} 方案")]
  SchemeMismatch(&'static str),
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
}

/// 简单的 CPU 引擎：输出通道均值，并把亮度超过阈值的像素框为一个目标
#[derive(Debug)]
pub struct MeanEngine {
  channels: u32,
  threshold: u8,
  device_count: usize,
  device: Option<usize>,
  batch: usize,
  mean: Vec<f32>,
  mean_shape: [usize; 4],
  detections: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct MeanEngineBuilder {
  channels: u32,
  threshold: u8,
  device_count: usize,
}

impl Default for MeanEngineBuilder {
  fn default() -> Self {
    Self {
      channels: MEAN_DEFAULT_CHANNELS,
      threshold: MEAN_DEFAULT_THRESHOLD,
      device_count: MEAN_DEFAULT_DEVICES,
    }
  }
}

impl FromUrlWithScheme for MeanEngineBuilder {
  const SCHEME: &'static str = "mean";
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MeanEngineError> {
  value
    .parse()
    .map_err(|_| MeanEngineError::InvalidParameter(key.to_string(), value.to_string()))
}

impl FromUrl for MeanEngineBuilder {
  type Error = MeanEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!("URI 方案不匹配: 期望 '{}', 实际 '{}'", Self::SCHEME, url.scheme());
      return Err(MeanEngineError::SchemeMismatch(Self::SCHEME));
    }

    let mut builder = Self::default();
    for (k, v) in url.query_pairs() {
      match &*k {
        "channels" => builder.channels = parse_param(&k, &v)?,
        "threshold" => builder.threshold = parse_param(&k, &v)?,
        "devices" => builder.device_count = parse_param(&k, &v)?,
        _ => debug!("忽略未知参数: {}={}", k, v),
      }
    }
    Ok(builder)
  }
}

impl MeanEngineBuilder {
  pub fn channels(mut self, channels: u32) -> Self {
    self.channels = channels;
    self
  }

  pub fn threshold(mut self, threshold: u8) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn device_count(mut self, device_count: usize) -> Self {
    self.device_count = device_count;
    self
  }

  pub fn build(self) -> Result<MeanEngine, MeanEngineError> {
    if self.channels == 0 {
      return Err(MeanEngineError::InvalidParameter(
        "channels".to_string(),
        "0".to_string(),
      ));
    }
    info!(
      "创建参考引擎: 通道数 {}, 亮度阈值 {}, 设备数 {}",
      self.channels, self.threshold, self.device_count
    );
    Ok(MeanEngine {
      channels: self.channels,
      threshold: self.threshold,
      device_count: self.device_count,
      device: None,
      batch: 1,
      mean: Vec::new(),
      mean_shape: [0, self.channels as usize, 1, 1],
      detections: Vec::new(),
    })
  }
}

impl MeanEngine {
  pub fn device(&self) -> Option<usize> {
    self.device
  }

  fn channel_mean(&self, frame: &Frame) -> Vec<f32> {
    let c = frame.channels() as usize;
    let mut sums = vec![0u64; c];
    for pixel in frame.as_nhwc().chunks_exact(c) {
      for (sum, &v) in sums.iter_mut().zip(pixel) {
        *sum += v as u64;
      }
    }
    let pixels = (frame.width() as u64 * frame.height() as u64).max(1);
    sums
      .into_iter()
      .map(|s| s as f32 / pixels as f32 / 255.0)
      .collect()
  }

  fn bright_region(&self, index: usize, frame: &Frame) -> DetectResult {
    let c = frame.channels() as usize;
    let (w, h) = (frame.width(), frame.height());
    let mut bounds: Option<[u32; 4]> = None;
    let mut bright = 0u64;

    for (i, pixel) in frame.as_nhwc().chunks_exact(c).enumerate() {
      let luma = pixel.iter().map(|&v| v as u32).sum::<u32>() / c as u32;
      if luma < self.threshold as u32 {
        continue;
      }
      bright += 1;
      let (x, y) = (i as u32 % w, i as u32 / w);
      bounds = Some(match bounds {
        None => [x, y, x, y],
        Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
      });
    }

    let items = match bounds {
      None => Vec::new(),
      Some([x0, y0, x1, y1]) => vec![DetectItem {
        image_id: index as i32,
        label: MEAN_DETECTION_LABEL,
        score: bright as f32 / (w as u64 * h as u64) as f32,
        bbox: [
          x0 as f32 / w as f32,
          y0 as f32 / h as f32,
          (x1 + 1) as f32 / w as f32,
          (y1 + 1) as f32 / h as f32,
        ],
      }],
    };

    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

impl Engine for MeanEngine {
  type Error = MeanEngineError;

  fn set_active_device(&mut self, index: usize) -> Result<(), Self::Error> {
    if index >= self.device_count {
      return Err(MeanEngineError::Device {
        index,
        count: self.device_count,
      });
    }
    debug!("参考引擎绑定设备 {}", index);
    self.device = Some(index);
    Ok(())
  }

  fn reshape_batch(&mut self, num: usize) -> Result<(), Self::Error> {
    self.batch = num;
    Ok(())
  }

  fn forward(&mut self, frames: &[Frame]) -> Result<(), Self::Error> {
    if frames.len() != self.batch {
      return Err(MeanEngineError::BatchMismatch {
        expected: self.batch,
        actual: frames.len(),
      });
    }

    if let Some(frame) = frames.iter().find(|f| f.channels() != self.channels) {
      return Err(MeanEngineError::ShapeMismatch {
        expected: self.channels,
        actual: frame.channels(),
      });
    }

    self.mean.clear();
    for frame in frames {
      let mean = self.channel_mean(frame);
      self.mean.extend_from_slice(&mean);
    }
    self.mean_shape = [frames.len(), self.channels as usize, 1, 1];

    let results: Vec<DetectResult> = frames
      .iter()
      .enumerate()
      .map(|(i, frame)| self.bright_region(i, frame))
      .collect();
    self.detections = encode_detections(&results);

    debug!("参考引擎完成 {} 帧的推理", frames.len());
    Ok(())
  }

  fn output(&self, name: &str) -> Option<TensorView<'_>> {
    match name {
      MEAN_OUTPUT => TensorView::new(self.mean_shape, &self.mean).ok(),
      MEAN_DETECTION_OUTPUT => {
        TensorView::new([1, 1, 1, self.detections.len()], &self.detections).ok()
      }
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::decode_detections;

  fn engine() -> MeanEngine {
    MeanEngineBuilder::default().threshold(128).build().unwrap()
  }

  #[test]
  fn builder_reads_url_query() {
    let url = Url::parse("mean://?channels=1&threshold=10&devices=2").unwrap();
    let builder = MeanEngineBuilder::from_url(&url).unwrap();
    let engine = builder.build().unwrap();
    assert_eq!(engine.channels, 1);
    assert_eq!(engine.threshold, 10);
    assert_eq!(engine.device_count, 2);
  }

  #[test]
  fn builder_rejects_other_scheme() {
    let url = Url::parse("pool://?batch_size=2").unwrap();
    assert!(matches!(
      MeanEngineBuilder::from_url(&url),
      Err(MeanEngineError::SchemeMismatch("mean"))
    ));
  }

  #[test]
  fn unknown_device_is_rejected() {
    let mut engine = engine();
    assert!(engine.set_active_device(0).is_ok());
    assert!(matches!(
      engine.set_active_device(1),
      Err(MeanEngineError::Device { index: 1, count: 1 })
    ));
  }

  #[test]
  fn mean_output_per_item() {
    let mut engine = engine();
    let frames = [Frame::filled(2, 2, 3, 0), Frame::filled(2, 2, 3, 255)];
    engine.reshape_batch(2).unwrap();
    engine.forward(&frames).unwrap();

    let view = engine.output(MEAN_OUTPUT).unwrap();
    assert_eq!(view.shape(), [2, 3, 1, 1]);
    assert_eq!(view.item(0).unwrap(), &[0.0, 0.0, 0.0]);
    assert_eq!(view.item(1).unwrap(), &[1.0, 1.0, 1.0]);
  }

  #[test]
  fn bright_pixels_become_one_box() {
    let mut engine = engine();
    let mut frame = Frame::with_shape(4, 2, 3);
    // 点亮 (1,0) 与 (2,1)
    for (x, y) in [(1usize, 0usize), (2, 1)] {
      let idx = (y * 4 + x) * 3;
      frame.as_mut()[idx..idx + 3].fill(250);
    }
    engine.reshape_batch(1).unwrap();
    engine.forward(std::slice::from_ref(&frame)).unwrap();

    let view = engine.output(MEAN_DETECTION_OUTPUT).unwrap();
    let results = decode_detections(view.as_slice());
    let result = results[0].as_ref().unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].label, MEAN_DETECTION_LABEL);
    assert_eq!(result.items[0].bbox, [0.25, 0.0, 0.75, 1.0]);
    assert!((result.items[0].score - 0.25).abs() < 1e-6);
  }

  #[test]
  fn channel_mismatch_fails_forward() {
    let mut engine = engine();
    engine.reshape_batch(1).unwrap();
    assert!(matches!(
      engine.forward(&[Frame::filled(2, 2, 1, 0)]),
      Err(MeanEngineError::ShapeMismatch { expected: 3, actual: 1 })
    ));
  }
}
