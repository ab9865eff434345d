// 该文件是 Shanan （山南西风） 项目的一部分。
// src/utils.rs - 日志与版本工具
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

use std::sync::Once;

static LOGGING: Once = Once::new();

/// 安装进程级的日志输出，重复调用不会产生效果
pub fn init_logging() {
  LOGGING.call_once(|| {
    // 其他组件可能已经安装了全局订阅者
    let _ = tracing_subscriber::fmt().try_init();
  });
}

pub fn version_string() -> &'static str {
  concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
}

/// 版本号编码为 `major * 10000 + minor * 100 + patch`
pub fn version_int() -> u32 {
  let part = |s: &str| s.parse::<u32>().unwrap_or(0);
  part(env!("CARGO_PKG_VERSION_MAJOR")) * 10000
    + part(env!("CARGO_PKG_VERSION_MINOR")) * 100
    + part(env!("CARGO_PKG_VERSION_PATCH"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn logging_init_is_idempotent() {
    init_logging();
    init_logging();
  }

  #[test]
  fn version_matches_manifest() {
    assert!(version_string().ends_with(env!("CARGO_PKG_VERSION")));
    assert_eq!(version_int(), 125);
  }
}
