// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn main() -> Result<()> {
    build_util::expose_m_profile()?;

    let kconfig: KernelConfig = build_util::kernel_config_or_default()?;
    kconfig.check()?;
    generate_statics(&kconfig)?;

    Ok(())
}

fn generate_statics(kconfig: &KernelConfig) -> Result<()> {
    let out = &PathBuf::from(
        env::var_os("OUT_DIR").context("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const TASK_SLOTS: usize = {};", kconfig.task_slots)?;
    writeln!(file, "pub const LOCK_SLOTS: usize = {};", kconfig.lock_slots)?;
    writeln!(
        file,
        "pub const HELD_LOCKS_PER_TASK: usize = {};",
        kconfig.held_locks_per_task
    )?;
    writeln!(
        file,
        "pub const RESOURCES_PER_TASK: usize = {};",
        kconfig.resources_per_task
    )?;
    writeln!(file, "pub const STACK_SIZE: usize = {};", kconfig.stack_size)?;
    writeln!(
        file,
        "pub const KERNEL_POOL_ORDERS: crate::buddy::Orders = \
         crate::buddy::Orders {{ min: {}, max: {} }};",
        kconfig.kernel_min_order, kconfig.kernel_max_order
    )?;
    writeln!(
        file,
        "pub const USER_POOL_ORDERS: crate::buddy::Orders = \
         crate::buddy::Orders {{ min: {}, max: {} }};",
        kconfig.user_min_order, kconfig.user_max_order
    )?;
    writeln!(
        file,
        "pub const TICK_DIVISOR: u32 = {};",
        kconfig.tick_divisor
    )?;
    writeln!(file, "pub const TRACE_DEPTH: usize = {};", kconfig.trace_depth)?;

    Ok(())
}

/// Kernel configuration, supplied as RON in `$KERNEL_CONFIG`. Any field left
/// out takes the default below.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KernelConfig {
    task_slots: usize,
    lock_slots: usize,
    held_locks_per_task: usize,
    resources_per_task: usize,
    stack_size: usize,
    kernel_min_order: u32,
    kernel_max_order: u32,
    user_min_order: u32,
    user_max_order: u32,
    tick_divisor: u32,
    trace_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            task_slots: 16,
            lock_slots: 32,
            held_locks_per_task: 4,
            resources_per_task: 8,
            stack_size: 2048,
            kernel_min_order: 5,
            kernel_max_order: 14,
            user_min_order: 5,
            user_max_order: 16,
            tick_divisor: 16_000,
            trace_depth: 32,
        }
    }
}

impl KernelConfig {
    fn check(&self) -> Result<()> {
        // Task index must fit in the index bits of a TaskId; two slots are
        // taken by the idle task and the reaper.
        if self.task_slots < 3 || self.task_slots > 1024 {
            bail!("task_slots must be in 3..=1024, got {}", self.task_slots);
        }
        if self.lock_slots < 2 || self.lock_slots > usize::from(u16::MAX) {
            bail!("lock_slots must leave room for the two heap guards");
        }
        for (name, min, max) in [
            ("kernel", self.kernel_min_order, self.kernel_max_order),
            ("user", self.user_min_order, self.user_max_order),
        ] {
            // Smallest block must hold a header plus a free-list link.
            if min < 5 || min > max || max >= 31 {
                bail!("bad {name} pool orders: min {min}, max {max}");
            }
        }
        if !self.stack_size.is_power_of_two() || self.stack_size < 256 {
            bail!("stack_size must be a power of two of at least 256");
        }
        if self.tick_divisor == 0 || self.tick_divisor > 0x0100_0000 {
            bail!("tick_divisor must fit the 24-bit SysTick reload register");
        }
        if self.trace_depth == 0 {
            bail!("trace_depth must be nonzero");
        }
        Ok(())
    }
}
