//! Error taxonomy of the render pipeline.

/// Errors surfaced by [`Pipeline`][crate::pipeline::Pipeline] and
/// [`RenderSession`][crate::pipeline::RenderSession].
///
/// All of these abort the render; there is no per-frame skip-and-continue. A configuration
/// inconsistency (such as the lip-zero threshold not being met) is *not* an error and silently
/// disables the affected flag for the session instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cropper found no face in the source image. Unrecoverable for this image.
    #[error("no face detected in source image")]
    NoFaceDetected,

    /// The driving input is neither a recognized frame sequence nor a template.
    #[error("unsupported driving source: {0}")]
    UnsupportedDrivingSource(String),

    /// An external model invocation failed. Fatal, not retried.
    #[error("inference failed{}: {source}", match .frame {
        Some(i) => format!(" at driving frame {i}"),
        None => String::new(),
    })]
    Inference {
        /// Index of the driving frame being processed, if the failure happened inside the frame
        /// loop.
        frame: Option<usize>,
        source: anyhow::Error,
    },

    /// A driving template could not be parsed.
    #[error("invalid driving template: {0}")]
    InvalidTemplate(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn inference(frame: impl Into<Option<usize>>, source: anyhow::Error) -> Self {
        Self::Inference {
            frame: frame.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_error_mentions_frame() {
        let err = Error::inference(7, anyhow::anyhow!("device lost"));
        let msg = err.to_string();
        assert!(msg.contains("frame 7"), "{msg}");
        assert!(msg.contains("device lost"), "{msg}");

        let err = Error::inference(None, anyhow::anyhow!("bad model"));
        assert!(!err.to_string().contains("frame"), "{err}");
    }
}
