// 该文件是 Shanan （山南西风） 项目的一部分。
// src/blob.rs - 张量缓冲区
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
pub enum TensorViewError {
  #[error("张量数据长度不匹配: 形状 {shape:?} 需要 {expected} 个元素, 实际 {actual} 个")]
  LengthMismatch {
    shape: [usize; 4],
    expected: usize,
    actual: usize,
  },
}

/// 推理引擎输出张量的只读视图，形状为 NCHW
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
  shape: [usize; 4],
  data: &'a [f32],
}

impl<'a> TensorView<'a> {
  pub fn new(shape: [usize; 4], data: &'a [f32]) -> Result<Self, TensorViewError> {
    let expected = shape.iter().product::<usize>();
    if expected != data.len() {
      return Err(TensorViewError::LengthMismatch {
        shape,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { shape, data })
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn num(&self) -> usize {
    self.shape[0]
  }

  pub fn channels(&self) -> usize {
    self.shape[1]
  }

  pub fn height(&self) -> usize {
    self.shape[2]
  }

  pub fn width(&self) -> usize {
    self.shape[3]
  }

  pub fn count(&self) -> usize {
    self.data.len()
  }

  /// 单个条目的元素数量，即 C*H*W
  pub fn item_size(&self) -> usize {
    self.shape[1] * self.shape[2] * self.shape[3]
  }

  /// 取出第 `index` 个条目的数据
  pub fn item(&self, index: usize) -> Option<&'a [f32]> {
    if index >= self.num() {
      return None;
    }
    let size = self.item_size();
    self.data.get(index * size..(index + 1) * size)
  }

  pub fn as_slice(&self) -> &'a [f32] {
    self.data
  }
}

/// 可按需变形的浮点缓冲区
///
/// 分配的容量只增不减：变形为更小的形状时复用原有内存，
/// 变形为更大的形状时才重新分配，且新容量恰好等于新的元素数量。
#[derive(Debug, Clone, Default)]
pub struct BlobData {
  list: Box<[f32]>,
  num: usize,
  channels: usize,
  height: usize,
  width: usize,
}

impl BlobData {
  pub fn new(num: usize, channels: usize, height: usize, width: usize) -> Self {
    let mut blob = Self::default();
    blob.reshape(num, channels, height, width);
    blob
  }

  /// 按视图的形状创建缓冲区，不复制数据
  pub fn with_shape_of(view: &TensorView<'_>) -> Self {
    let [n, c, h, w] = view.shape();
    Self::new(n, c, h, w)
  }

  pub fn reshape(&mut self, num: usize, channels: usize, height: usize, width: usize) {
    self.num = num;
    self.channels = channels;
    self.height = height;
    self.width = width;

    let count = self.count();
    if self.list.len() < count {
      self.list = vec![0.0; count].into_boxed_slice();
    }
  }

  pub fn reshape_like(&mut self, other: &BlobData) {
    self.reshape(other.num, other.channels, other.height, other.width);
  }

  pub fn copy_from(&mut self, other: &BlobData) {
    self.reshape_like(other);
    if !other.is_empty() {
      let count = self.count();
      self.list[..count].copy_from_slice(other.values());
    }
  }

  pub fn copy_from_view(&mut self, view: &TensorView<'_>) {
    let [n, c, h, w] = view.shape();
    self.reshape(n, c, h, w);
    if view.count() > 0 {
      let count = self.count();
      self.list[..count].copy_from_slice(view.as_slice());
    }
  }

  /// 复制视图中第 `index` 个条目，结果形状为 (1, C, H, W)
  ///
  /// 索引越界时返回 `false`，缓冲区保持原样。
  pub fn copy_item_from(&mut self, view: &TensorView<'_>, index: usize) -> bool {
    let Some(item) = view.item(index) else {
      return false;
    };
    self.reshape(1, view.channels(), view.height(), view.width());
    let count = self.count();
    self.list[..count].copy_from_slice(item);
    true
  }

  /// 释放底层内存并清零形状
  pub fn release(&mut self) {
    *self = Self::default();
  }

  pub fn count(&self) -> usize {
    self.num * self.channels * self.height * self.width
  }

  pub fn capacity(&self) -> usize {
    self.list.len()
  }

  pub fn is_empty(&self) -> bool {
    self.count() < 1
  }

  pub fn shape(&self) -> [usize; 4] {
    [self.num, self.channels, self.height, self.width]
  }

  pub fn num(&self) -> usize {
    self.num
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn values(&self) -> &[f32] {
    &self.list[..self.count()]
  }

  pub fn values_mut(&mut self) -> &mut [f32] {
    let count = self.count();
    &mut self.list[..count]
  }

  pub fn as_view(&self) -> TensorView<'_> {
    TensorView {
      shape: self.shape(),
      data: self.values(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ramp(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32 * 0.5).collect()
  }

  #[test]
  fn view_rejects_wrong_length() {
    let data = ramp(5);
    assert!(matches!(
      TensorView::new([1, 2, 3, 1], &data),
      Err(TensorViewError::LengthMismatch { expected: 6, actual: 5, .. })
    ));
  }

  #[test]
  fn view_slices_items() {
    let data = ramp(12);
    let view = TensorView::new([3, 2, 1, 2], &data).unwrap();
    assert_eq!(view.item_size(), 4);
    assert_eq!(view.item(1).unwrap(), &data[4..8]);
    assert!(view.item(3).is_none());
  }

  #[test]
  fn copy_round_trip() {
    for shape in [[2, 3, 4, 5], [1, 1, 1, 1], [0, 3, 2, 2]] {
      let data = ramp(shape.iter().product());
      let view = TensorView::new(shape, &data).unwrap();

      let mut first = BlobData::default();
      first.copy_from_view(&view);
      let mut second = BlobData::default();
      second.copy_from(&first);

      assert_eq!(second.shape(), shape);
      assert_eq!(second.values(), data.as_slice());
    }
  }

  #[test]
  fn reshape_same_dims_keeps_storage_and_values() {
    let mut blob = BlobData::new(1, 2, 2, 2);
    blob.values_mut().copy_from_slice(&ramp(8));
    let before = blob.values().as_ptr();

    blob.reshape(1, 2, 2, 2);
    blob.reshape(1, 2, 2, 2);

    assert_eq!(blob.capacity(), 8);
    assert_eq!(blob.values().as_ptr(), before);
    assert_eq!(blob.values(), ramp(8).as_slice());
  }

  #[test]
  fn capacity_only_grows() {
    let mut blob = BlobData::new(2, 3, 4, 4);
    assert_eq!(blob.capacity(), 96);

    blob.reshape(1, 3, 2, 2);
    assert_eq!(blob.count(), 12);
    assert_eq!(blob.capacity(), 96);

    blob.reshape(4, 3, 4, 4);
    assert_eq!(blob.capacity(), 192);
  }

  #[test]
  fn copy_item_takes_one_slice() {
    let data = ramp(24);
    let view = TensorView::new([4, 2, 3, 1], &data).unwrap();
    let mut blob = BlobData::default();

    assert!(blob.copy_item_from(&view, 2));
    assert_eq!(blob.shape(), [1, 2, 3, 1]);
    assert_eq!(blob.values(), &data[12..18]);

    assert!(!blob.copy_item_from(&view, 4));
    assert_eq!(blob.values(), &data[12..18]);
  }

  #[test]
  fn release_clears_everything() {
    let mut blob = BlobData::new(1, 3, 8, 8);
    blob.release();
    assert!(blob.is_empty());
    assert_eq!(blob.capacity(), 0);
    assert_eq!(blob.shape(), [0, 0, 0, 0]);
  }
}
