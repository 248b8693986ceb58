// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to sanitize the runtime config! Field: {0}, Error: {1}")]
    ConfigSanitizerFailed(&'static str, String),
    #[error("Error accessing {0}: {1}")]
    IO(String, #[source] std::io::Error),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(String),
}

/// Which executor handles ordered loops.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderedExecutorKind {
    /// Every worker speculates, commits go through a shared reorder buffer.
    #[default]
    Ordered,
    /// A dedicated committer thread drives the commit order.
    OrderedV2,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Iteration slots per thread of the ordered executor.
    pub iteration_multiplier: usize,
    pub executor: OrderedExecutorKind,
    /// Run every loop on the calling thread without speculation.
    pub serial: bool,
    /// Sleep after long runs of consecutive aborts.
    pub backoff: bool,
    /// Free pool retries, with a reorder buffer sweep in between, before the ordered executor
    /// reclaims or blocks for an iteration slot.
    pub free_iteration_attempts: usize,
    /// Iteration slots shared by the workers of the committer based executor.
    pub v2_pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            threads: num_cpus::get(),
            iteration_multiplier: 1,
            executor: OrderedExecutorKind::Ordered,
            serial: false,
            backoff: true,
            free_iteration_attempts: 10,
            v2_pool_size: 16,
        }
    }
}

impl RuntimeConfig {
    /// Returns a config running `threads` workers, all other fields defaulted.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Validates every field, returning the first offending one.
    pub fn sanitize(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "threads",
                "at least one worker thread is required".into(),
            ));
        }
        if self.iteration_multiplier == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "iteration_multiplier",
                "must be positive".into(),
            ));
        }
        if self.v2_pool_size == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                "v2_pool_size",
                "must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Iteration slots of the ordered executor.
    pub fn max_iterations(&self) -> usize {
        self.iteration_multiplier * self.threads
    }

    /// Load the config from disk at the given path
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_string = path.as_ref().display().to_string();
        let mut file =
            File::open(&path).map_err(|error| ConfigError::IO(path_string.clone(), error))?;

        let mut file_contents = String::new();
        file.read_to_string(&mut file_contents)
            .map_err(|error| ConfigError::IO(path_string, error))?;

        Self::parse_serialized_config(&file_contents)
    }

    /// Save the config to disk at the given output path
    pub fn save_config<P: AsRef<Path>>(&self, output_file: P) -> Result<(), ConfigError> {
        let path_string = output_file.as_ref().display().to_string();
        let serialized_config =
            serde_yaml::to_vec(&self).map_err(|e| ConfigError::Yaml(path_string.clone(), e))?;

        let mut file = File::create(output_file.as_ref())
            .map_err(|e| ConfigError::IO(path_string.clone(), e))?;
        file.write_all(&serialized_config)
            .map_err(|e| ConfigError::IO(path_string, e))?;

        Ok(())
    }

    /// Parse the config from the serialized string
    pub fn parse_serialized_config(serialized_config: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(serialized_config)
            .map_err(|e| ConfigError::Yaml("config".to_string(), e))
    }
}
