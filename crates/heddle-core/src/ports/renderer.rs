//! Renderer port - `{{ ... }}` テンプレートの展開

use thiserror::Error;

use crate::domain::errors::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("invalid expression `{0}`")]
    InvalidExpression(String),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

/// Renders one template against a JSON variable tree.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, vars: &serde_json::Value) -> Result<String, RenderError>;
}
