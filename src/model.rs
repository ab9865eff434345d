// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{blob::TensorView, frame::Frame};

/// 推理引擎适配器
///
/// 引擎只在任务池的工作线程中被调用，因此只要求 `Send`。
pub trait Engine: Send + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 绑定计算设备，工作线程启动时调用一次
  fn set_active_device(&mut self, index: usize) -> Result<(), Self::Error>;

  /// 把输入批大小调整为 `num`
  fn reshape_batch(&mut self, num: usize) -> Result<(), Self::Error>;

  /// 对一批帧执行一次前向推理
  fn forward(&mut self, frames: &[Frame]) -> Result<(), Self::Error>;

  /// 按名称取出最近一次前向推理的输出
  fn output(&self, name: &str) -> Option<TensorView<'_>>;
}

/// 请求的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperType {
  /// 取出该请求对应的输出张量切片
  Forward,
  /// 把输出解码为检测结果
  Detect,
}

pub mod detection;
pub use self::detection::{
  BOX_STRIDE, DecodeError, DetectItem, DetectResult, decode_detections, encode_detections,
};

#[cfg(feature = "model_mean")]
mod mean;
#[cfg(feature = "model_mean")]
pub use self::mean::{
  MEAN_DETECTION_OUTPUT, MEAN_OUTPUT, MeanEngine, MeanEngineBuilder, MeanEngineError,
};
