//! In-pipeline outgoing message transformations.
//!
//! Transformers run on an [`OutgoingMessage`] before it is handed over
//! for delivery, allowing its content to be replaced (e.g. by a signed
//! structure) in place. Unlike informational checks, a failing transformer
//! stops the pipeline so the caller can decide whether to bounce, retry or
//! deliver unsigned. Concrete implementations live in the
//! [`transformers`](crate::transformers) module.

use std::{fmt::Display, future::Future, io, pin::Pin};

use tracing::debug;

use crate::{OutgoingMessage, SignError};

/// Result type for transformer operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// Boxed future type for transformer operations, enabling async transformers.
pub type TransformFuture<'a> = Pin<Box<dyn Future<Output = TransformResult<()>> + Send + 'a>>;

/// Errors that can occur while transforming a message.
#[derive(Debug)]
pub enum TransformError {
    /// The credential lookup itself failed (not a missing credential).
    Credential(io::Error),
    /// The message could not be signed.
    Signing(SignError),
}

impl Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Credential(e) => write!(f, "Credential lookup error: {e}"),
            TransformError::Signing(e) => write!(f, "Signing error: {e}"),
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransformError::Credential(e) => Some(e),
            TransformError::Signing(e) => Some(e),
        }
    }
}

impl From<SignError> for TransformError {
    fn from(error: SignError) -> Self {
        TransformError::Signing(error)
    }
}

/// Trait for message transformers that modify outgoing emails in the pipeline.
pub trait MessageTransformer: Send + Sync {
    /// Transforms an email message in place, possibly performing async operations.
    fn transform<'a>(&'a self, message: &'a mut OutgoingMessage) -> TransformFuture<'a>;

    /// Returns the name of this transformer.
    fn name(&self) -> &str;

    /// Applies a list of transformers to a message in order, stopping at
    /// the first failure.
    fn apply<'a>(
        transformers: &'a [Box<dyn MessageTransformer>],
        message: &'a mut OutgoingMessage,
    ) -> TransformFuture<'a>
    where
        Self: Sized,
    {
        Box::pin(async move {
            for transformer in transformers {
                debug!(
                    transformer = transformer.name(),
                    message_id = %message.message_id,
                    "Applying transformer"
                );
                transformer.transform(message).await?;
            }
            Ok(())
        })
    }
}
