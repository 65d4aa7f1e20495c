// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A session store configuration that cannot be built.
///
/// This is the only error the crate reports. Once a store is built, its operations report
/// absence through `bool` and `Option` results and never fail.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The store must have at least one shard to route keys to.
    #[error("shard count must be at least 1")]
    NoShards,
}
