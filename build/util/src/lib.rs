// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Name of the environment variable carrying the kernel configuration, in RON.
pub const KERNEL_CONFIG_VAR: &str = "KERNEL_CONFIG";

/// M-profile architecture version of the target, when there is one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MProfile {
    V6,
    V7,
    V8,
}

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m)`, `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Targets that
/// aren't M-profile (the host, when running tests) get no cfg and `None`; the
/// kernel builds its simulated architecture for those.
pub fn expose_m_profile() -> Result<Option<MProfile>> {
    let target = env::var("TARGET").context("TARGET not set by cargo")?;

    let profile = if target.starts_with("thumbv6m") {
        Some(MProfile::V6)
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        Some(MProfile::V7)
    } else if target.starts_with("thumbv8m") {
        Some(MProfile::V8)
    } else if target.starts_with("thumb") {
        anyhow::bail!("don't know the M-profile of target {target}");
    } else {
        None
    };

    match profile {
        Some(MProfile::V6) => println!("cargo:rustc-cfg=armv6m"),
        Some(MProfile::V7) => println!("cargo:rustc-cfg=armv7m"),
        Some(MProfile::V8) => println!("cargo:rustc-cfg=armv8m"),
        None => (),
    }
    Ok(profile)
}

/// Pulls the kernel configuration out of `$KERNEL_CONFIG`. Note that -- thanks
/// to the magic of Serde -- `T` need only describe the fields a particular
/// build script cares about.
///
/// If the variable is missing, this returns `T::default()`. If it is present
/// but fails to parse, this fails with `Err`, rather than quietly building a
/// kernel with a configuration nobody asked for.
pub fn kernel_config_or_default<T: DeserializeOwned + Default>() -> Result<T> {
    ron_from_env_def(KERNEL_CONFIG_VAR)
}

fn ron_from_env_def<T: DeserializeOwned + Default>(var: &str) -> Result<T> {
    // We want to emit this whether or not the env var is present, so that we'll
    // be re-run if it becomes present.
    println!("cargo:rerun-if-env-changed={var}");

    let config = match env::var(var) {
        Ok(text) => {
            println!("--- ron for ${var} ---");
            println!("{text}");
            text
        }
        Err(_) => {
            println!("--- var ${var} not present, using default ---");
            return Ok(T::default());
        }
    };
    parse_ron(&config).with_context(|| format!("parsing ${var}"))
}

fn parse_ron<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(ron::de::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Partial {
        task_slots: usize,
        stack_size: u32,
    }

    #[test]
    fn partial_config_fills_defaults() {
        let p: Partial = parse_ron("(task_slots: 8)").unwrap();
        assert_eq!(
            p,
            Partial {
                task_slots: 8,
                stack_size: 0
            }
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_ron::<Partial>("(task_slots: \"eight\")").is_err());
    }
}
