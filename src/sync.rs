// 该文件是 Shanan （山南西风） 项目的一部分。
// src/sync.rs - 计数信号量与临界区
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

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// 计数信号量
///
/// 可用数量永远不会超过 `max`，多余的释放会被直接丢弃。
#[derive(Debug)]
pub struct Semaphore {
  free: Mutex<usize>,
  cond: Condvar,
  max: usize,
}

impl Semaphore {
  pub fn new(initial: usize, max: usize) -> Self {
    Self {
      free: Mutex::new(initial.min(max)),
      cond: Condvar::new(),
      max,
    }
  }

  /// 阻塞直到至少有一个可用许可，然后占用它
  pub fn acquire(&self) {
    let mut free = self.free.lock();
    while *free == 0 {
      self.cond.wait(&mut free);
    }
    *free -= 1;
  }

  /// 归还 `num` 个许可，返回实际归还的数量
  pub fn release(&self, num: usize) -> usize {
    let mut free = self.free.lock();
    let num = num.min(self.max - *free);
    *free += num;
    for _ in 0..num {
      self.cond.notify_one();
    }
    num
  }

  pub fn available(&self) -> usize {
    *self.free.lock()
  }

  pub fn max(&self) -> usize {
    self.max
  }
}

/// 临界区
///
/// 守护一份共享状态，并附带一个唤醒信号，空闲的一方可以在锁上等待另一方的通知。
/// 持有临界区时不得等待任何信号量。
#[derive(Debug, Default)]
pub struct CriticalSection<T> {
  state: Mutex<T>,
  wake: Condvar,
}

impl<T> CriticalSection<T> {
  pub fn new(state: T) -> Self {
    Self {
      state: Mutex::new(state),
      wake: Condvar::new(),
    }
  }

  /// 进入临界区，守卫被丢弃时离开
  pub fn enter(&self) -> MutexGuard<'_, T> {
    self.state.lock()
  }

  /// 暂时离开临界区并等待通知或超时，返回时已重新进入
  pub fn wait_for(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) {
    self.wake.wait_for(guard, timeout);
  }

  pub fn notify(&self) {
    self.wake.notify_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread;

  #[test]
  fn release_saturates_at_max() {
    let sem = Semaphore::new(1, 3);
    assert_eq!(sem.release(10), 2);
    assert_eq!(sem.available(), 3);
    assert_eq!(sem.release(1), 0);
    assert_eq!(sem.max(), 3);
  }

  #[test]
  fn initial_is_clamped() {
    let sem = Semaphore::new(8, 2);
    assert_eq!(sem.available(), 2);
  }

  #[test]
  fn acquire_blocks_until_release() {
    let sem = Arc::new(Semaphore::new(0, 4));
    let passed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
      .map(|_| {
        let sem = sem.clone();
        let passed = passed.clone();
        thread::spawn(move || {
          sem.acquire();
          passed.fetch_add(1, Ordering::SeqCst);
        })
      })
      .collect();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(passed.load(Ordering::SeqCst), 0);

    sem.release(2);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(passed.load(Ordering::SeqCst), 2);

    sem.release(1);
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(passed.load(Ordering::SeqCst), 3);
    assert_eq!(sem.available(), 0);
  }

  #[test]
  fn critical_section_wakes_waiter() {
    let cs = Arc::new(CriticalSection::new(0usize));
    let waiter = {
      let cs = cs.clone();
      thread::spawn(move || {
        let mut guard = cs.enter();
        while *guard == 0 {
          cs.wait_for(&mut guard, Duration::from_millis(500));
        }
        *guard
      })
    };

    thread::sleep(Duration::from_millis(20));
    *cs.enter() = 7;
    cs.notify();
    assert_eq!(waiter.join().unwrap(), 7);
  }
}
