// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource limits applied to the instance's service unit.
//!
//! On the command line and in cluster files these are written as a comma
//! separated list of `key=value` pairs, e.g. `cpu=200,mem=2048,nofile=65535`.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceLimits {
    /// CPU quota as a percentage of one core.
    pub cpu_percent: Option<u32>,
    pub memory_max_mb: Option<u64>,
    pub open_files: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LimitsParseError {
    #[error("expected key=value, found {0:?}")]
    Malformed(String),
    #[error("unknown resource limit {0:?} (expected cpu, mem or nofile)")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value:?}")]
    BadValue { key: String, value: String },
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        *self == ResourceLimits::default()
    }

    /// The `[Service]` directives enforcing these limits.
    pub fn unit_directives(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(cpu) = self.cpu_percent {
            lines.push(format!("CPUQuota={cpu}%"));
        }
        if let Some(mem) = self.memory_max_mb {
            lines.push(format!("MemoryMax={mem}M"));
        }
        if let Some(nofile) = self.open_files {
            lines.push(format!("LimitNOFILE={nofile}"));
        }
        lines
    }
}

impl FromStr for ResourceLimits {
    type Err = LimitsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut limits = ResourceLimits::default();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| LimitsParseError::Malformed(pair.to_string()))?;
            let bad = || LimitsParseError::BadValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key.trim() {
                "cpu" => {
                    limits.cpu_percent =
                        Some(value.trim().parse().map_err(|_| bad())?)
                }
                "mem" => {
                    limits.memory_max_mb =
                        Some(value.trim().parse().map_err(|_| bad())?)
                }
                "nofile" => {
                    limits.open_files =
                        Some(value.trim().parse().map_err(|_| bad())?)
                }
                other => {
                    return Err(LimitsParseError::UnknownKey(other.to_string()))
                }
            }
        }
        Ok(limits)
    }
}

impl fmt::Display for ResourceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(cpu) = self.cpu_percent {
            parts.push(format!("cpu={cpu}"));
        }
        if let Some(mem) = self.memory_max_mb {
            parts.push(format!("mem={mem}"));
        }
        if let Some(nofile) = self.open_files {
            parts.push(format!("nofile={nofile}"));
        }
        f.write_str(&parts.join(","))
    }
}

impl TryFrom<String> for ResourceLimits {
    type Error = LimitsParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceLimits> for String {
    fn from(limits: ResourceLimits) -> String {
        limits.to_string()
    }
}
