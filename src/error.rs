// Error taxonomy for the orchestration layer
//
// Creation-path failures are terminal for the step that raised them.
// NotFoundFailure is the only variant callers are expected to recover from.

use ash::vk;
use std::fmt;
use thiserror::Error;

/// Stage of the per-frame cycle that produced a [`RenderError::RenderFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Acquire,
    Record,
    Submit,
    Present,
    Synchronize,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::Acquire => "acquire",
            FrameStage::Record => "record",
            FrameStage::Submit => "submit",
            FrameStage::Present => "present",
            FrameStage::Synchronize => "synchronize",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    /// Loader bootstrap, instance creation or device enumeration failed
    #[error("initialization failed: {0}")]
    InitializationFailure(String),

    /// No physical device or queue family combination satisfies the requirements
    #[error("device selection failed: {0}")]
    DeviceSelectionFailure(String),

    /// The driver rejected logical device creation
    #[error("logical device creation failed: {0}")]
    DeviceCreationFailure(String),

    #[error("swapchain creation failed: {0}")]
    SwapchainCreationFailure(String),

    /// Creating the view for swapchain image `index` failed
    #[error("image view creation failed for image {index}: {result}")]
    ImageViewCreationFailure {
        index: usize,
        #[source]
        result: vk::Result,
    },

    #[error("frame failed during {stage}: {detail}")]
    RenderFailure { stage: FrameStage, detail: String },

    /// Lookup by index, name, tag or type found nothing
    #[error("{kind} `{key}` not found")]
    NotFoundFailure { kind: &'static str, key: String },
}

impl RenderError {
    pub fn render(stage: FrameStage, detail: impl fmt::Display) -> Self {
        RenderError::RenderFailure {
            stage,
            detail: detail.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, key: impl fmt::Display) -> Self {
        RenderError::NotFoundFailure {
            kind,
            key: key.to_string(),
        }
    }

    /// True for the lookup failures a caller can handle locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RenderError::NotFoundFailure { .. })
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lookups_are_recoverable() {
        assert!(RenderError::not_found("layer", 3).is_recoverable());
        assert!(!RenderError::render(FrameStage::Present, vk::Result::ERROR_OUT_OF_DATE_KHR)
            .is_recoverable());
        assert!(!RenderError::DeviceSelectionFailure("none".into()).is_recoverable());
    }

    #[test]
    fn messages_name_the_failed_stage() {
        let err = RenderError::render(FrameStage::Acquire, "no swapchain");
        assert_eq!(err.to_string(), "frame failed during acquire: no swapchain");

        let err = RenderError::not_found("layer", "hud");
        assert_eq!(err.to_string(), "layer `hud` not found");
    }
}
