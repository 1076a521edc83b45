use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
///
/// `Cancelled` and `SafetyRejected` from the error taxonomy are deliberately
/// absent here: cancellation surfaces as `Ok(vec![])` from
/// [`crate::pipeline::Pipeline::generate_images`] and a safety rejection
/// surfaces as `None` at the corresponding index of its result, not as an
/// `Err`. Both are normal outcomes, not failures.
#[derive(Debug, Error)]
pub enum Error {
    /// A required artifact or tokenizer file is absent from the resource
    /// directory. Fatal to pipeline construction.
    #[error("resource missing: {path}")]
    ResourceMissing { path: String },

    /// The inference backend refused to load a model. Fatal to the current
    /// request only; the `ManagedModel` stays unloaded and the next call
    /// may retry.
    #[error("failed to load model {name}: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: tch::TchError,
    },

    /// A per-call backend failure during inference.
    #[error("inference failed in {name}: {source}")]
    InferenceFailed {
        name: String,
        #[source]
        source: tch::TchError,
    },

    /// An internal shape assertion failed; indicates a mis-packaged model.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    /// The tokenizer could not map the input text to ids (empty vocabulary,
    /// or an id produced outside the model's declared range).
    #[error("tokenization failed: {reason}")]
    TokenizationFailed { reason: String },

    /// A `SampleInput` invariant (see `scheduler::SampleInput::new`) was
    /// violated by the caller.
    #[error("invalid sample input: {reason}")]
    InvalidInput { reason: String },

    /// Failure decoding a `guernika.json` metadata file or scanning a
    /// resource directory.
    #[error("invalid resource metadata at {path}: {source}")]
    InvalidMetadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
