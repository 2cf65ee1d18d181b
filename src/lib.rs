use std::sync::Arc;

use log::{debug, info};

pub mod config;
pub mod context;
pub mod core;
pub mod document;
pub mod errors;
pub mod render;
pub mod types;
mod parser;
mod tests;

pub use config::{LoopMarkerMode, RenderConfig};
pub use context::{Context, Scope, VariableResolver};
pub use core::images::{FetchedImage, ImageFetcher, NoImageFetcher};
#[cfg(feature = "http")]
pub use core::images::HttpImageFetcher;
pub use core::permissions::PermissionChecker;
pub use document::{Document, Presentation, Workbook};
pub use errors::{Diagnostics, Location, RenderError};
pub use render::keys::ContextKeys;
pub use types::{Number, Record, Value};

use config::RenderSettings;
use crate::core::text::{process_text, TextMode};
use crate::core::Evaluator;

/// Output of a render together with the errors recorded inline under best-effort mode.
#[derive(Debug)]
pub struct RenderOutput<T> {
    pub document: T,
    pub diagnostics: Diagnostics,
}

impl<T> RenderOutput<T> {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Entry point: populates templates from a [`Context`].
pub struct Renderer<F: ImageFetcher = NoImageFetcher> {
    config: RenderConfig,
    fetcher: F,
    permissions: Option<Arc<dyn PermissionChecker>>,
}

impl Renderer<NoImageFetcher> {
    pub fn new(config: RenderConfig) -> Self {
        Self { config, fetcher: NoImageFetcher, permissions: None }
    }
}

impl Default for Renderer<NoImageFetcher> {
    fn default() -> Self {
        Self::new(RenderConfig::default())
    }
}

impl<F: ImageFetcher> Renderer<F> {
    pub fn with_fetcher(config: RenderConfig, fetcher: F) -> Self {
        Self { config, fetcher, permissions: None }
    }

    /// Consults `checker` for every record a placeholder path reaches, while
    /// `check_permissions` is on. Denials are resolution errors.
    pub fn with_permission_checker(mut self, checker: impl PermissionChecker + 'static) -> Self {
        self.permissions = Some(Arc::new(checker));
        self
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RenderConfig {
        &mut self.config
    }

    fn settings(&self) -> Result<RenderSettings, RenderError> {
        Ok(RenderSettings::from_config(&self.config)?.with_permissions(&self.config, self.permissions.as_ref()))
    }

    pub fn render_presentation(
        &self,
        template: &Presentation,
        context: &Context,
    ) -> Result<RenderOutput<Presentation>, RenderError> {
        let settings = self.settings()?;
        info!("Rendering presentation with {} slides", template.slides.len());
        let (document, diagnostics) = render::pptx::render_presentation(template, context, &settings, &self.fetcher)?;
        debug!("Presentation rendered: {} slides, {} inline errors", document.slides.len(), diagnostics.len());
        Ok(RenderOutput { document, diagnostics })
    }

    pub fn render_workbook(&self, template: &Workbook, context: &Context) -> Result<RenderOutput<Workbook>, RenderError> {
        let settings = self.settings()?;
        info!("Rendering workbook with {} sheets", template.sheets.len());
        let (document, diagnostics) = render::xlsx::render_workbook(template, context, &settings)?;
        debug!("Workbook rendered with {} inline errors", diagnostics.len());
        Ok(RenderOutput { document, diagnostics })
    }

    pub fn render_document(&self, template: &Document, context: &Context) -> Result<RenderOutput<Document>, RenderError> {
        match template {
            Document::Presentation(presentation) => {
                let output = self.render_presentation(presentation, context)?;
                Ok(RenderOutput { document: Document::Presentation(output.document), diagnostics: output.diagnostics })
            }
            Document::Workbook(workbook) => {
                let output = self.render_workbook(workbook, context)?;
                Ok(RenderOutput { document: Document::Workbook(output.document), diagnostics: output.diagnostics })
            }
        }
    }

    /// Reads a serialized [`Document`], renders it and serializes the result.
    pub fn render_bytes(&self, template: &[u8], context: &Context) -> Result<RenderOutput<Vec<u8>>, RenderError> {
        let document: Document = serde_json::from_slice(template)?;
        let output = self.render_document(&document, context)?;
        let bytes = serde_json::to_vec(&output.document)?;
        Ok(RenderOutput { document: bytes, diagnostics: output.diagnostics })
    }

    /// Renders free-standing text; lists are joined with ", ".
    pub fn render_text(&self, text: &str, context: &Context) -> Result<RenderOutput<String>, RenderError> {
        let settings = self.settings()?;
        let scope = Scope::new(context);
        let evaluator = Evaluator::new(&scope, &settings);
        let mut diagnostics = Diagnostics::default();
        let rendered = process_text(text, &evaluator, TextMode::Normal, &Location::Text, &mut diagnostics)?;
        Ok(RenderOutput { document: rendered.into_text(), diagnostics })
    }
}

/// Lists the top-level context keys a template refers to.
pub fn context_keys(template: &Document) -> Result<ContextKeys, RenderError> {
    let keys = match template {
        Document::Presentation(presentation) => render::keys::presentation_keys(presentation),
        Document::Workbook(workbook) => render::keys::workbook_keys(workbook),
    };
    keys.map_err(|e| RenderError::parse(&Location::Document, e))
}
