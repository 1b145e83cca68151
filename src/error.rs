//! Error types.
//!
//! [`TaskFailure`] is what a [`Future`][crate::Future] settles to when its task does not produce a
//! value. It is [`Clone`], since every observer of a [`Future`][crate::Future] receives the same
//! failure. [`InvalidArgument`] is returned synchronously when a combinator is misused.

use std::{any::Any, error::Error, sync::Arc};

/// The reason a task did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskFailure {
    /// The task ran and returned an error.
    #[error("task failed: {0}")]
    Failed(#[source] Arc<dyn Error + Send + Sync>),

    /// The task, or a closure passed to a combinator, panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task never ran to completion.
    ///
    /// This happens when the task was discarded by [`Shutdown::Discard`][crate::Shutdown], was
    /// submitted after its pool shut down, or when the [`Promise`][crate::Promise] that was
    /// supposed to settle the [`Future`][crate::Future] was dropped.
    #[error("task execution was interrupted before completion")]
    Interrupted,
}

impl TaskFailure {
    /// Wraps an error returned by a task.
    pub fn failed<E: Into<Box<dyn Error + Send + Sync>>>(error: E) -> Self {
        Self::Failed(Arc::from(error.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::Panicked(message)
    }

    /// Returns the error returned by the task, if it returned one.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Failed(cause) => Some(&**cause),
            Self::Panicked(_) | Self::Interrupted => None,
        }
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// A combinator was called with arguments it cannot work with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub(crate) &'static str);
