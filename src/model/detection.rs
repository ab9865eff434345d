// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/detection.rs - 检测结果与打包张量解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::debug;

/// 每个检测框占用的浮点数：image_id, label, score, xmin, ymin, xmax, ymax
pub const BOX_STRIDE: usize = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("检测张量布局错误: 第 {item} 个条目在偏移 {offset} 处越界或计数非法 (总长度 {len})")]
  MalformedTensorLayout { item: usize, offset: usize, len: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectItem {
  pub image_id: i32,
  pub label: i32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }

  /// 把归一化坐标换算为像素坐标
  pub fn denormalize(&mut self, width: f32, height: f32) {
    for item in self.items.iter_mut() {
      item.bbox[0] *= width;
      item.bbox[1] *= height;
      item.bbox[2] *= width;
      item.bbox[3] *= height;
    }
  }
}

/// 把浮点数读作计数，负数、非整数或非有限值视为非法
fn read_count(values: &[f32], offset: usize) -> Option<usize> {
  let v = *values.get(offset)?;
  if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
    return None;
  }
  Some(v as usize)
}

/// 第一遍扫描单个条目，返回 (框总数, 下一个条目的偏移)
fn scan_item(values: &[f32], mut offset: usize) -> Option<(usize, usize)> {
  let num_obj = read_count(values, offset)?;
  offset += 1;
  let mut total = 0usize;
  for _ in 0..num_obj {
    let num_box = read_count(values, offset)?;
    offset += 1;
    let floats = num_box.checked_mul(BOX_STRIDE)?;
    if floats > values.len() - offset {
      return None;
    }
    offset += floats;
    total += num_box;
  }
  Some((total, offset))
}

/// 解码打包的检测张量，每个条目一个结果
///
/// 布局为：条目数，然后每个条目依次是物体数，每个物体是框数加上 `框数 * 7` 个浮点数。
/// 第一遍确定每个条目的框数并分配空间，第二遍填充。
/// 某个条目布局非法时，该条目及其后的条目都无法定位，均返回错误。
pub fn decode_detections(values: &[f32]) -> Vec<Result<DetectResult, DecodeError>> {
  if values.is_empty() {
    return Vec::new();
  }

  let Some(num) = read_count(values, 0) else {
    return vec![Err(DecodeError::MalformedTensorLayout {
      item: 0,
      offset: 0,
      len: values.len(),
    })];
  };

  // 第一遍：每个条目的起始偏移与框数
  let mut layout = Vec::with_capacity(num.min(values.len()));
  let mut offset = 1;
  let mut broken = None;
  for i in 0..num {
    match scan_item(values, offset) {
      Some((total, next)) => {
        layout.push((offset, total));
        offset = next;
      }
      None => {
        broken = Some(DecodeError::MalformedTensorLayout {
          item: i,
          offset,
          len: values.len(),
        });
        break;
      }
    }
  }

  // 第二遍：按预分配的大小填充
  let mut results: Vec<Result<DetectResult, DecodeError>> = layout
    .into_iter()
    .map(|(start, total)| {
      let mut items = vec![DetectItem::default(); total].into_boxed_slice();
      let mut p = start;
      let num_obj = values[p] as usize;
      p += 1;
      let mut box_index = 0;
      for _ in 0..num_obj {
        let num_box = values[p] as usize;
        p += 1;
        for _ in 0..num_box {
          let b = &values[p..p + BOX_STRIDE];
          items[box_index] = DetectItem {
            image_id: b[0] as i32,
            label: b[1] as i32,
            score: b[2],
            bbox: [b[3], b[4], b[5], b[6]],
          };
          box_index += 1;
          p += BOX_STRIDE;
        }
      }
      debug_assert_eq!(box_index, total);
      Ok(DetectResult { items })
    })
    .collect();

  if let Some(err) = broken {
    debug!("检测张量在 {} 个条目后损坏: {}", results.len(), err);
    let remaining = num - results.len();
    results.extend(std::iter::repeat_n(Err(err), remaining.min(values.len())));
  }

  results
}

/// 按解码器的布局打包检测结果，每个条目写成一个包含全部框的物体
pub fn encode_detections(results: &[DetectResult]) -> Vec<f32> {
  let total: usize = results.iter().map(|r| 2 + r.len() * BOX_STRIDE + 1).sum();
  let mut values = Vec::with_capacity(1 + total);
  values.push(results.len() as f32);
  for result in results {
    if result.is_empty() {
      values.push(0.0);
      continue;
    }
    values.push(1.0);
    values.push(result.len() as f32);
    for item in result.iter() {
      values.extend_from_slice(&[
        item.image_id as f32,
        item.label as f32,
        item.score,
        item.bbox[0],
        item.bbox[1],
        item.bbox[2],
        item.bbox[3],
      ]);
    }
  }
  values
}
