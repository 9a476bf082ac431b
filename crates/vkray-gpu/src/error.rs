//! GPU error types and driver result classification.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension or feature not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader binary could not be loaded.
    #[error("Shader load failed: {0}")]
    ShaderLoad(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Severity of a driver result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSeverity {
    /// `VK_SUCCESS`.
    Success,
    /// Positive, non-success code (e.g. `VK_INCOMPLETE`, `VK_SUBOPTIMAL_KHR`).
    /// Logged, execution continues.
    Informational,
    /// Negative error code. Unrecoverable for the current build/frame.
    Fatal,
}

impl ResultSeverity {
    /// Classify a raw driver result.
    pub fn of(result: vk::Result) -> Self {
        match result.as_raw() {
            0 => Self::Success,
            r if r > 0 => Self::Informational,
            _ => Self::Fatal,
        }
    }
}

/// Check a raw driver result.
///
/// Informational codes are logged and treated as success; fatal codes become
/// [`GpuError::Vulkan`]. Nothing is retried.
pub fn check(result: vk::Result, call: &str) -> Result<()> {
    match ResultSeverity::of(result) {
        ResultSeverity::Success => Ok(()),
        ResultSeverity::Informational => {
            tracing::warn!("{call} returned {result:?}");
            Ok(())
        }
        ResultSeverity::Fatal => {
            tracing::error!("{call} failed: {result:?}");
            Err(GpuError::Vulkan(result))
        }
    }
}

/// [`check`] applied to an ash call that yields no value.
///
/// ash reports every non-success code as `Err`, including informational ones.
pub fn check_call(result: ash::prelude::VkResult<()>, call: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(code) => check(code, call),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_call_maps_ash_results() {
        assert!(check_call(Ok(()), "vkQueueSubmit").is_ok());
        assert!(check_call(Err(vk::Result::OPERATION_NOT_DEFERRED_KHR), "vkBuild").is_ok());
        assert!(check_call(Err(vk::Result::ERROR_DEVICE_LOST), "vkQueueSubmit").is_err());
    }

    #[test]
    fn classifies_result_codes() {
        assert_eq!(ResultSeverity::of(vk::Result::SUCCESS), ResultSeverity::Success);
        assert_eq!(ResultSeverity::of(vk::Result::INCOMPLETE), ResultSeverity::Informational);
        assert_eq!(
            ResultSeverity::of(vk::Result::SUBOPTIMAL_KHR),
            ResultSeverity::Informational
        );
        assert_eq!(
            ResultSeverity::of(vk::Result::ERROR_DEVICE_LOST),
            ResultSeverity::Fatal
        );
    }

    #[test]
    fn check_passes_informational_codes() {
        assert!(check(vk::Result::NOT_READY, "vkGetQueryPoolResults").is_ok());
        assert!(matches!(
            check(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "vkAllocateMemory"),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
    }
}
