// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_statics()?;
    Ok(())
}

fn generate_statics() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=SHKERN_KCONFIG");
    let kconfig: KernelConfig = match env::var("SHKERN_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(_) => KernelConfig::default(),
    };
    kconfig.check()?;

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("no OUT_DIR")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const MAX_THREADS: usize = {};", kconfig.max_threads)?;
    writeln!(
        file,
        "pub const THREAD_STACK_SIZE: usize = {:#x};",
        kconfig.thread_stack_size
    )?;
    writeln!(file, "pub const MAX_TIMERS: usize = {};", kconfig.max_timers)?;
    writeln!(file, "pub const MAX_CONTEXTS: usize = {};", kconfig.max_contexts)?;
    writeln!(
        file,
        "pub const PAGE_SUBTABLES: usize = {};",
        kconfig.page_subtables
    )?;
    writeln!(file, "pub const DEFAULT_HZ: u32 = {};", kconfig.default_hz)?;
    writeln!(
        file,
        "pub const KERNEL_STACK_RESERVE: usize = {:#x};",
        kconfig.kernel_stack_reserve
    )?;
    writeln!(file, "pub const MAX_TLS_KEYS: usize = {};", kconfig.max_tls_keys)?;
    writeln!(
        file,
        "pub const MAPLE_DETACH_THRESHOLD: u8 = {};",
        kconfig.maple_detach_threshold
    )?;
    writeln!(
        file,
        "pub const DEFAULT_PRIORITY: abi::Priority = abi::Priority({});",
        kconfig.default_priority.0
    )?;
    writeln!(
        file,
        "pub const DEFAULT_LOG_LEVEL: abi::LogLevel = abi::LogLevel::{:?};",
        kconfig.default_log_level
    )?;

    Ok(())
}

#[derive(Deserialize)]
#[serde(default)]
struct KernelConfig {
    max_threads: usize,
    thread_stack_size: usize,
    max_timers: usize,
    max_contexts: usize,
    page_subtables: usize,
    default_hz: u32,
    kernel_stack_reserve: usize,
    max_tls_keys: usize,
    maple_detach_threshold: u8,
    default_priority: abi::Priority,
    default_log_level: abi::LogLevel,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_threads: 32,
            thread_stack_size: 0x8000,
            max_timers: 64,
            max_contexts: 8,
            page_subtables: 32,
            default_hz: 100,
            kernel_stack_reserve: 0x10000,
            max_tls_keys: 16,
            maple_detach_threshold: 3,
            default_priority: abi::Priority::DEFAULT,
            default_log_level: abi::LogLevel::Info,
        }
    }
}

impl KernelConfig {
    fn check(&self) -> Result<(), String> {
        // Thread indices must fit in the index bits of a ThreadId, with the
        // idle thread included.
        let max_index = 1usize << abi::THREAD_ID_INDEX_BITS;
        if self.max_threads < 2 || self.max_threads > max_index {
            return Err(format!(
                "max_threads must be in 2..={max_index}, got {}",
                self.max_threads
            ));
        }
        if self.max_contexts == 0 || self.max_contexts > 256 {
            return Err("max_contexts must be in 1..=256".into());
        }
        if self.thread_stack_size % 8 != 0 || self.thread_stack_size < 0x400 {
            return Err("thread_stack_size must be a multiple of 8, >= 1 KiB".into());
        }
        if self.max_timers == 0 || self.page_subtables == 0 {
            return Err("max_timers and page_subtables must be nonzero".into());
        }
        if self.maple_detach_threshold == 0 {
            return Err("maple_detach_threshold must be nonzero".into());
        }
        Ok(())
    }
}
