use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    Validation,
    UnsupportedModel,
    Provider,
    NoImageData,
    StreamDecode,
    Storage,
}

impl DispatchErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            DispatchErrorKind::Validation => "validation",
            DispatchErrorKind::UnsupportedModel => "unsupported_model",
            DispatchErrorKind::Provider => "provider",
            DispatchErrorKind::NoImageData => "no_image_data",
            DispatchErrorKind::StreamDecode => "stream_decode",
            DispatchErrorKind::Storage => "storage",
        }
    }
}

/// A pipeline failure already converted to its taxonomy kind. Components
/// produce these at their own seams; only the envelope layer turns a kind
/// into an HTTP status code.
#[derive(Debug, Clone)]
pub struct DispatchError {
    kind: DispatchErrorKind,
    message: String,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Validation, message)
    }

    pub fn unsupported_model(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::UnsupportedModel, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Provider, message)
    }

    pub fn no_image_data(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::NoImageData, message)
    }

    pub fn stream_decode(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::StreamDecode, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorKind::Storage, message)
    }

    /// Flattens an anyhow chain into a single-line message under the
    /// given kind.
    pub fn wrap(kind: DispatchErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }

    pub fn kind(&self) -> DispatchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_validation(&self) -> bool {
        self.kind == DispatchErrorKind::Validation
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DispatchError {}
