// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 批处理任务池
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

//! 多个生产者线程共享同一个推理引擎的批处理任务池。
//!
//! 任务池持有两组缓冲区：生产者写入的暂存组与工作线程读取的活动组。
//! 每个周期开始时工作线程交换两组缓冲区，把整批请求交给引擎推理，
//! 再把每个结果投递给对应的生产者，并等待所有生产者取走结果后才开始下一个周期。

use std::{
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  blob::BlobData,
  frame::Frame,
  model::{DecodeError, DetectResult, Engine, OperType, decode_detections},
  sync::{CriticalSection, Semaphore},
};

const POOL_DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(1);
/// 单个任务池允许的最大批大小
pub const POOL_MAX_BATCH_SIZE: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
  #[error("任务池未运行")]
  NotRunning,
  #[error("输入图像为空")]
  EmptyInput,
  #[error("推理引擎错误: {0}")]
  Engine(String),
  #[error("推理引擎没有名为 {0} 的输出")]
  MissingOutput(String),
  #[error("输出中没有第 {index} 个条目 (共 {available} 个)")]
  MissingItem { index: usize, available: usize },
  #[error("检测结果解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("工作线程在推理中崩溃")]
  WorkerPanicked,
  #[error("无法启动工作线程: {0}")]
  Spawn(Arc<std::io::Error>),
  #[error("配置无效: {0}")]
  InvalidConfig(String),
}

/// 单个请求的结果
#[derive(Debug, Clone)]
pub enum Prediction {
  Blob(BlobData),
  Detections(DetectResult),
}

/// 任务池配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  pub device: usize,
  pub batch_size: usize,
  /// 空闲时工作线程等待新请求的最长时间
  pub idle_interval: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      device: 0,
      batch_size: 1,
      idle_interval: POOL_DEFAULT_IDLE_INTERVAL,
    }
  }
}

impl FromUrlWithScheme for PoolConfig {
  const SCHEME: &'static str = "pool";
}

impl FromUrl for PoolConfig {
  type Error = PoolError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PoolError::InvalidConfig(format!(
        "期望 '{}' 方案, 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let parse = |k: &str, v: &str| {
      v.parse::<u64>()
        .map_err(|_| PoolError::InvalidConfig(format!("参数 {}={} 不是整数", k, v)))
    };

    let mut config = Self::default();
    for (k, v) in url.query_pairs() {
      match &*k {
        "device" => config.device = parse(&k, &v)? as usize,
        "batch_size" | "batch" => config.batch_size = parse(&k, &v)? as usize,
        "idle_ms" => config.idle_interval = Duration::from_millis(parse(&k, &v)?),
        _ => debug!("忽略未知参数: {}={}", k, v),
      }
    }
    config.validate()?;
    Ok(config)
  }
}

impl PoolConfig {
  pub fn device(mut self, device: usize) -> Self {
    self.device = device;
    self
  }

  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  pub fn idle_interval(mut self, idle_interval: Duration) -> Self {
    self.idle_interval = idle_interval;
    self
  }

  /// 批大小不超过 [`POOL_MAX_BATCH_SIZE`]，空闲等待时间不为零
  pub fn validate(&self) -> Result<(), PoolError> {
    if self.batch_size > POOL_MAX_BATCH_SIZE {
      return Err(PoolError::InvalidConfig(format!(
        "批大小 {} 超过上限 {}",
        self.batch_size, POOL_MAX_BATCH_SIZE
      )));
    }
    if self.idle_interval.is_zero() {
      return Err(PoolError::InvalidConfig("空闲等待时间不能为 0".to_string()));
    }
    Ok(())
  }
}

/// 一组缓冲区中的请求，三个数组按槽位下标对齐
#[derive(Debug, Default)]
struct BufferSet {
  frames: Vec<Frame>,
  names: Vec<String>,
  opers: Vec<OperType>,
}

impl BufferSet {
  fn with_capacity(capacity: usize) -> Self {
    Self {
      frames: Vec::with_capacity(capacity),
      names: Vec::with_capacity(capacity),
      opers: Vec::with_capacity(capacity),
    }
  }

  fn len(&self) -> usize {
    self.frames.len()
  }

  fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  fn push(&mut self, frame: Frame, name: &str, oper: OperType) {
    self.frames.push(frame);
    self.names.push(name.to_string());
    self.opers.push(oper);
  }

  fn clear(&mut self) {
    self.frames.clear();
    self.names.clear();
    self.opers.clear();
  }
}

/// 受临界区保护的暂存状态
#[derive(Debug)]
struct Staging {
  requests: BufferSet,
  /// 当前作为暂存组的信号/结果数组下标 (0 或 1)
  side: usize,
}

type Outcome = Result<Prediction, PoolError>;

/// 每组缓冲区的完成信号与结果槽
struct Delivery {
  signals: Box<[Semaphore]>,
  results: Box<[Mutex<Option<Outcome>>]>,
}

impl Delivery {
  fn new(capacity: usize) -> Self {
    Self {
      signals: (0..capacity).map(|_| Semaphore::new(0, 1)).collect(),
      results: (0..capacity).map(|_| Mutex::new(None)).collect(),
    }
  }

  fn deliver(&self, slot: usize, outcome: Outcome) {
    *self.results[slot].lock() = Some(outcome);
    self.signals[slot].release(1);
  }
}

struct Shared {
  capacity: usize,
  device: usize,
  idle_interval: Duration,
  running: AtomicBool,
  staging: CriticalSection<Staging>,
  intake: Semaphore,
  cycle_finished: Semaphore,
  delivery: [Delivery; 2],
}

/// 批处理任务池
pub struct TaskPool {
  shared: Arc<Shared>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskPool")
      .field("capacity", &self.shared.capacity)
      .field("device", &self.shared.device)
      .field("running", &self.is_running())
      .finish_non_exhaustive()
  }
}

impl TaskPool {
  /// 以给定设备与批大小创建任务池
  pub fn build<E: Engine>(engine: E, device: usize, batch_size: usize) -> Result<Self, PoolError> {
    Self::open(
      engine,
      PoolConfig::default().device(device).batch_size(batch_size),
    )
  }

  /// 创建任务池并启动工作线程，不等待工作线程就绪
  pub fn open<E: Engine>(engine: E, config: PoolConfig) -> Result<Self, PoolError> {
    config.validate()?;
    let capacity = config.batch_size.max(1);
    let shared = Arc::new(Shared {
      capacity,
      device: config.device,
      idle_interval: config.idle_interval,
      running: AtomicBool::new(true),
      staging: CriticalSection::new(Staging {
        requests: BufferSet::with_capacity(capacity),
        side: 0,
      }),
      intake: Semaphore::new(capacity, capacity),
      cycle_finished: Semaphore::new(0, capacity),
      delivery: [Delivery::new(capacity), Delivery::new(capacity)],
    });

    let worker = {
      let shared = shared.clone();
      thread::Builder::new()
        .name(format!("shanan-pool-{}", config.device))
        .spawn(move || worker_main(engine, &shared))
        .map_err(|e| PoolError::Spawn(Arc::new(e)))?
    };

    info!("任务池已创建: 设备 {}, 批大小 {}", config.device, capacity);
    Ok(Self {
      shared,
      worker: Mutex::new(Some(worker)),
    })
  }

  pub fn capacity(&self) -> usize {
    self.shared.capacity
  }

  pub fn device(&self) -> usize {
    self.shared.device
  }

  pub fn is_running(&self) -> bool {
    self.shared.running.load(Ordering::SeqCst)
  }

  /// 暂存组中已填充的槽位数
  pub fn pending(&self) -> usize {
    self.shared.staging.enter().requests.len()
  }

  /// 当前空闲的槽位许可数
  pub fn available_permits(&self) -> usize {
    self.shared.intake.available()
  }

  /// 提交一个请求并阻塞直到得到结果
  ///
  /// 图像在入队前被复制，返回后调用方可以立即复用自己的缓冲区。
  pub fn submit(&self, frame: &Frame, name: &str, oper: OperType) -> Result<Prediction, PoolError> {
    let shared = &*self.shared;
    if !self.is_running() {
      return Err(PoolError::NotRunning);
    }
    if frame.is_empty() {
      return Err(PoolError::EmptyInput);
    }
    let frame = frame.clone();

    shared.intake.acquire();
    if !self.is_running() {
      // 把许可传给下一个等待者，使关闭时所有等待者依次醒来
      shared.intake.release(1);
      return Err(PoolError::NotRunning);
    }

    let (side, slot) = {
      let mut staging = shared.staging.enter();
      if !self.is_running() {
        drop(staging);
        shared.intake.release(1);
        return Err(PoolError::NotRunning);
      }
      let slot = staging.requests.len();
      staging.requests.push(frame, name, oper);
      (staging.side, slot)
    };
    shared.staging.notify();

    let delivery = &shared.delivery[side];
    delivery.signals[slot].acquire();
    let outcome = delivery.results[slot]
      .lock()
      .take()
      .unwrap_or(Err(PoolError::NotRunning));
    shared.cycle_finished.release(1);
    outcome
  }

  /// 提交一个前向请求，取回该请求对应的输出切片
  pub fn forward(&self, frame: &Frame, name: &str) -> Result<BlobData, PoolError> {
    match self.submit(frame, name, OperType::Forward)? {
      Prediction::Blob(blob) => Ok(blob),
      Prediction::Detections(_) => unreachable!("forward request answered with detections"),
    }
  }

  /// 提交一个检测请求，取回像素坐标下的检测结果
  pub fn detect(&self, frame: &Frame, name: &str) -> Result<DetectResult, PoolError> {
    match self.submit(frame, name, OperType::Detect)? {
      Prediction::Detections(result) => Ok(result),
      Prediction::Blob(_) => unreachable!("detect request answered with a blob"),
    }
  }

  /// 关闭任务池，唤醒所有等待中的线程并等待工作线程退出
  pub fn close(&self) {
    let Some(worker) = self.worker.lock().take() else {
      return;
    };

    info!("正在关闭任务池...");
    let shared = &*self.shared;
    shared.running.store(false, Ordering::SeqCst);
    shared.intake.release(shared.capacity);
    shared.cycle_finished.release(shared.capacity);
    shared.staging.notify();

    if worker.join().is_err() {
      error!("任务池工作线程异常退出");
      fail_staged(shared);
      shared.intake.release(shared.capacity);
    }
    info!("任务池已关闭");
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    self.close();
  }
}

fn worker_main<E: Engine>(mut engine: E, shared: &Shared) {
  info!("任务池工作线程启动, 绑定设备 {}", shared.device);
  let served = catch_unwind(AssertUnwindSafe(|| {
    match engine.set_active_device(shared.device) {
      Ok(()) => worker_loop(&mut engine, shared),
      Err(e) => error!("无法绑定设备 {}: {}", shared.device, e),
    }
  }));
  if served.is_err() {
    error!("工作线程发生 panic, 任务池将停止");
  }
  shared.running.store(false, Ordering::SeqCst);
  fail_staged(shared);
  // 唤醒仍在等待空闲槽位的生产者
  shared.intake.release(shared.capacity);
  info!("任务池工作线程退出");
}

fn worker_loop<E: Engine>(engine: &mut E, shared: &Shared) {
  let mut active = BufferSet::with_capacity(shared.capacity);

  while shared.running.load(Ordering::SeqCst) {
    // 交换暂存组与活动组
    let side = {
      let mut staging = shared.staging.enter();
      if staging.requests.is_empty() {
        if shared.running.load(Ordering::SeqCst) {
          shared.staging.wait_for(&mut staging, shared.idle_interval);
        }
        continue;
      }
      std::mem::swap(&mut staging.requests, &mut active);
      let side = staging.side;
      staging.side = 1 - side;
      side
    };

    let num = active.len();
    shared.intake.release(num);
    debug!("开始处理一批请求: {} 个", num);

    let delivery = &shared.delivery[side];
    let outcomes = catch_unwind(AssertUnwindSafe(|| run_cycle(engine, &active)));
    let panicked = outcomes.is_err();
    let outcomes = outcomes.unwrap_or_else(|_| {
      error!("推理过程中发生 panic, 任务池将停止");
      vec![Err(PoolError::WorkerPanicked); num]
    });

    for (slot, outcome) in outcomes.into_iter().enumerate() {
      delivery.deliver(slot, outcome);
    }
    for _ in 0..num {
      shared.cycle_finished.acquire();
    }
    active.clear();

    if panicked {
      shared.running.store(false, Ordering::SeqCst);
    }
  }
}

/// 对活动组执行一次前向推理并逐槽位提取结果
fn run_cycle<E: Engine>(engine: &mut E, active: &BufferSet) -> Vec<Outcome> {
  let num = active.len();
  let forward = engine
    .reshape_batch(num)
    .and_then(|_| engine.forward(&active.frames));
  if let Err(e) = forward {
    warn!("批推理失败, 本周期 {} 个请求全部失败: {}", num, e);
    return vec![Err(PoolError::Engine(e.to_string())); num];
  }

  // 同一周期中同名的检测输出只解码一次
  let mut decoded: Vec<(&str, Result<Vec<Result<DetectResult, DecodeError>>, PoolError>)> =
    Vec::new();

  (0..num)
    .map(|i| -> Outcome {
      let name = active.names[i].as_str();
      match active.opers[i] {
        OperType::Forward => {
          let view = engine
            .output(name)
            .ok_or_else(|| PoolError::MissingOutput(name.to_string()))?;
          let mut blob = BlobData::default();
          if !blob.copy_item_from(&view, i) {
            return Err(PoolError::MissingItem {
              index: i,
              available: view.num(),
            });
          }
          Ok(Prediction::Blob(blob))
        }
        OperType::Detect => {
          let pos = match decoded.iter().position(|(n, _)| *n == name) {
            Some(pos) => pos,
            None => {
              let items = engine
                .output(name)
                .ok_or_else(|| PoolError::MissingOutput(name.to_string()))
                .map(|view| {
                  let mut blob = BlobData::default();
                  blob.copy_from_view(&view);
                  decode_detections(blob.values())
                });
              decoded.push((name, items));
              decoded.len() - 1
            }
          };
          let items = decoded[pos].1.as_ref().map_err(Clone::clone)?;
          let mut result = match items.get(i) {
            Some(item) => item.clone()?,
            None => {
              return Err(PoolError::MissingItem {
                index: i,
                available: items.len(),
              });
            }
          };
          let frame = &active.frames[i];
          result.denormalize(frame.width() as f32, frame.height() as f32);
          Ok(Prediction::Detections(result))
        }
      }
    })
    .collect()
}

/// 任务池停止后，让仍在暂存组中等待的请求全部失败返回
fn fail_staged(shared: &Shared) {
  let mut staging = shared.staging.enter();
  let num = staging.requests.len();
  if num > 0 {
    warn!("任务池已停止, {} 个未处理的请求将失败返回", num);
  }
  let delivery = &shared.delivery[staging.side];
  for slot in 0..num {
    delivery.deliver(slot, Err(PoolError::NotRunning));
  }
  staging.requests.clear();
}
