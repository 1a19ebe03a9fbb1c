use std::fmt;

use ash::vk;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(
        "virtual block exhausted: requested {requested} bytes with alignment {alignment}, {free} of {capacity} bytes free"
    )]
    CapacityExhausted {
        requested: u64,
        alignment: u64,
        free: u64,
        capacity: u64,
    },
    #[error("descriptor table `{name}` has no free slot left out of {capacity}")]
    DescriptorsExhausted { name: String, capacity: u32 },
    #[error("failed to create {kind} `{name}` ({params}): {result}")]
    Creation {
        kind: &'static str,
        name: String,
        params: String,
        result: vk::Result,
    },
    #[error("binding {set}.{binding} declares {first} descriptors in one stage and {second} in another")]
    BindingCountMismatch {
        set: u32,
        binding: u32,
        first: u32,
        second: u32,
    },
    #[error("binding {set}.{binding} is declared as both {first:?} and {second:?}")]
    BindingTypeMismatch {
        set: u32,
        binding: u32,
        first: vk::DescriptorType,
        second: vk::DescriptorType,
    },
    #[error("descriptor set `{name}` has no binding {binding}")]
    UnknownBinding { name: String, binding: u32 },
    #[error("pipeline `{name}` does not declare descriptor set {set}")]
    MissingDescriptorSet { name: String, set: u32 },
}

impl BackendError {
    /// Logs a failed native creation call with its full context and wraps it.
    pub(crate) fn creation(kind: &'static str, name: &str, params: impl Into<String>, result: vk::Result) -> Self {
        let params = params.into();
        error!(kind, name, %params, %result, "native object creation failed");
        BackendError::Creation {
            kind,
            name: name.to_string(),
            params,
            result,
        }
    }
}

/// Device-level failures have no recovery protocol. This is the single breakpoint for them.
#[cold]
#[track_caller]
pub(crate) fn fatal(what: &str, error: impl fmt::Display) -> ! {
    error!("fatal: {} failed: {}", what, error);
    if cfg!(feature = "crash_debugging") {
        std::process::abort();
    }
    panic!("{what} failed: {error}")
}
