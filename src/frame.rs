// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 已解码的图像帧，像素按 NHWC（交错通道）排列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
  width: u32,
  height: u32,
  channels: u32,
  data: Box<[u8]>,
}

impl Frame {
  pub fn new(width: u32, height: u32, channels: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      channels,
      data: data.into_boxed_slice(),
    })
  }

  pub fn with_shape(width: u32, height: u32, channels: u32) -> Self {
    let size = width as usize * height as usize * channels as usize;
    Self {
      width,
      height,
      channels,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  pub fn filled(width: u32, height: u32, channels: u32, value: u8) -> Self {
    let mut frame = Self::with_shape(width, height, channels);
    frame.data.fill(value);
    frame
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> u32 {
    self.channels
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let c = self.channels as usize;
    let idx = (y as usize * self.width as usize + x as usize) * c;
    self.data.get(idx..idx + c)
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for Frame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

#[cfg(feature = "read_image_file")]
impl From<image::RgbImage> for Frame {
  fn from(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      channels: 3,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_short_buffer() {
    assert_eq!(
      Frame::new(2, 2, 3, vec![0; 11]),
      Err(FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      })
    );
  }

  #[test]
  fn pixel_reads_interleaved_channels() {
    let data: Vec<u8> = (0..12).collect();
    let frame = Frame::new(2, 2, 3, data).unwrap();
    assert_eq!(frame.pixel(1, 0).unwrap(), &[3, 4, 5]);
    assert_eq!(frame.pixel(0, 1).unwrap(), &[6, 7, 8]);
    assert!(frame.pixel(2, 0).is_none());
  }

  #[test]
  fn zero_sized_frame_is_empty() {
    assert!(Frame::with_shape(0, 10, 3).is_empty());
    assert!(Frame::default().is_empty());
    assert!(!Frame::filled(1, 1, 1, 9).is_empty());
  }
}
