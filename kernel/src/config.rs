// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the machine the kernel boots on.
//!
//! A [`Config`] can be read from TOML, with any missing fields taking
//! their default values:
//!
//! ```
//! let config = kernel::Config::from_toml("cpus = 2\nidle_timeout_ms = 50\n").unwrap();
//! assert_eq!(config.cpus, 2);
//! assert_eq!(config.idle_timeout_ms, Some(50));
//! ```

use crate::Error;
use core::time::Duration;
use log::warn;
use multitasking::MachineConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tls::TlsLayout;

/// The kernel's boot configuration.
///
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The number of CPU slots, including the boot
    /// CPU. This is clamped to [`cpu::MAX_CPUS`].
    pub cpus: usize,

    /// The size in bytes of each CPU's TLS block.
    pub tls_size: usize,

    /// The alignment of each CPU's TLS block.
    pub tls_align: usize,

    /// If set, idle CPUs wake up this often even if
    /// no interrupt arrives.
    pub idle_timeout_ms: Option<u64>,

    /// How long to wait for each secondary CPU to
    /// come online.
    pub cpu_start_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(cpu::MAX_CPUS);

        Config {
            cpus,
            tls_size: 0,
            tls_align: 8,
            idle_timeout_ms: None,
            cpu_start_timeout_ms: 1000,
        }
    }
}

impl Config {
    /// Parses and validates a configuration.
    ///
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let mut config: Config = toml::from_str(text)?;
        config.validate()?;

        Ok(config)
    }

    /// Reads a configuration from the file at `path`.
    ///
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Config::from_toml(&text)
    }

    fn validate(&mut self) -> Result<(), Error> {
        if self.cpus == 0 {
            return Err(Error::InvalidConfig("cpus must be at least 1"));
        }

        if self.cpus > cpu::MAX_CPUS {
            warn!(
                "Limiting CPUs from {} to {}.",
                self.cpus,
                cpu::MAX_CPUS
            );
            self.cpus = cpu::MAX_CPUS;
        }

        if self.cpu_start_timeout_ms == 0 {
            return Err(Error::InvalidConfig("cpu_start_timeout_ms must be non-zero"));
        }

        Ok(())
    }

    /// Returns the layout of each CPU's TLS block.
    ///
    pub fn tls_layout(&self) -> Result<TlsLayout, Error> {
        Ok(TlsLayout::new(self.tls_size, self.tls_align)?)
    }

    /// Returns the configuration for the machine,
    /// using the given TLS layout.
    ///
    pub fn machine_config(&self, tls: TlsLayout) -> MachineConfig {
        let config = MachineConfig::new(self.cpus).with_tls(tls);
        match self.idle_timeout_ms {
            Some(ms) => config.with_idle_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.cpus >= 1);
        assert!(config.cpus <= cpu::MAX_CPUS);
    }

    #[test]
    fn parse() {
        let config = Config::from_toml(
            "cpus = 3\ntls_size = 128\ntls_align = 16\nidle_timeout_ms = 5\ncpu_start_timeout_ms = 250\n",
        )
        .unwrap();
        assert_eq!(
            config,
            Config {
                cpus: 3,
                tls_size: 128,
                tls_align: 16,
                idle_timeout_ms: Some(5),
                cpu_start_timeout_ms: 250,
            }
        );

        let layout = config.tls_layout().unwrap();
        assert_eq!(layout.size(), 128);
        assert_eq!(layout.align(), 16);
    }

    #[test]
    fn clamping() {
        let config = Config::from_toml("cpus = 1000\n").unwrap();
        assert_eq!(config.cpus, cpu::MAX_CPUS);
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            Config::from_toml("cpus = 0\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::from_toml("cpus = \"two\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("threads = 2\n"),
            Err(Error::Config(_))
        ));

        let bad_align = Config::from_toml("tls_align = 3\n").unwrap();
        assert!(matches!(bad_align.tls_layout(), Err(Error::Tls(_))));
    }

    #[test]
    fn missing_file() {
        let err = Config::load(Path::new("/nonexistent/kernel.toml")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
