use std::collections::BTreeMap;

use thiserror::Error;

/// Error type for template rendering
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RenderError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Failed to render template {template}: {message}")]
    Render { template: String, message: String },
}

/// Everything a renderer needs to produce one page
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    /// Template name, e.g. `user/show.tpl`
    pub template: &'a str,
    pub layout: Option<&'a str>,
    /// Named sections included by the layout
    pub sections: &'a BTreeMap<String, String>,
    pub data: &'a serde_json::Value,
}

/// TemplateRenderer defines the port for turning a view into response bytes
pub trait TemplateRenderer: Send + Sync + 'static {
    fn render(&self, view: &View<'_>) -> Result<Vec<u8>, RenderError>;
}
