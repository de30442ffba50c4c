//! Manifest templates and the resources built from them
//!
//! Templates live under a template root as `<name>.yaml` and are expanded
//! with minijinja. The only values they can see are the fields of a
//! [`GiteaParameters`]; any other lookup is a render error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use tracing::debug;

use crate::adapters::parameters::GiteaParameters;
use crate::{Error, Result};

/// File extension of template assets
pub const TEMPLATE_EXTENSION: &str = "yaml";

/// Loads and expands manifest templates from a template root
#[derive(Clone, Debug)]
pub struct TemplateRenderer {
    root: PathBuf,
}

impl TemplateRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory templates are loaded from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Expand the named template against the parameters
    pub fn render(&self, template: &str, params: &GiteaParameters) -> Result<String> {
        let source = self.load(template)?;

        let env = environment();
        let compiled = env
            .template_from_named_str(template, &source)
            .map_err(|e| Error::TemplateSyntax {
                template: template.to_string(),
                source: e,
            })?;

        let rendered = compiled.render(params).map_err(|e| match e.kind() {
            ErrorKind::SyntaxError => Error::TemplateSyntax {
                template: template.to_string(),
                source: e,
            },
            _ => Error::Render {
                template: template.to_string(),
                message: render_message(&e),
            },
        })?;

        debug!("Rendered template {} ({} bytes)", template, rendered.len());
        Ok(rendered)
    }

    /// Expand the named template and parse the result as a resource
    pub fn create_resource(
        &self,
        template: &str,
        params: &GiteaParameters,
    ) -> Result<RenderedResource> {
        let rendered = self.render(template, params)?;
        RenderedResource::parse(template, &rendered)
    }

    fn load(&self, template: &str) -> Result<String> {
        let not_found = || Error::TemplateNotFound {
            template: template.to_string(),
        };

        if !is_valid_template_name(template) {
            return Err(not_found());
        }

        let path = self
            .root
            .join(format!("{}.{}", template, TEMPLATE_EXTENSION));

        // Symlinks may still point outside the root
        let root = self.root.canonicalize().map_err(|_| not_found())?;
        let resolved = path.canonicalize().map_err(|_| not_found())?;
        if !resolved.starts_with(&root) {
            return Err(not_found());
        }

        fs::read_to_string(&resolved).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(),
            _ => Error::ConfigError(format!(
                "Failed to read template {}: {}",
                resolved.display(),
                e
            )),
        })
    }
}

/// Template names are plain identifiers: no separators, no dots.
fn is_valid_template_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env
}

fn render_message(err: &minijinja::Error) -> String {
    match err.detail() {
        Some(detail) => format!("{} ({})", err.kind(), detail),
        None => err.to_string(),
    }
}

/// A manifest produced by expanding one template.
///
/// The body stays untyped; the cluster client that applies it knows the
/// schema of each kind.
#[derive(Clone, Debug)]
pub struct RenderedResource {
    api_version: String,
    kind: String,
    object: DynamicObject,
}

impl RenderedResource {
    /// Parse rendered text produced by `template`
    pub fn parse(template: &str, rendered: &str) -> Result<Self> {
        let parse_error = |message: String| Error::Parse {
            template: template.to_string(),
            message,
        };

        let object: DynamicObject =
            serde_yaml::from_str(rendered).map_err(|e| parse_error(e.to_string()))?;

        let types = object
            .types
            .clone()
            .ok_or_else(|| parse_error("document has no apiVersion/kind".to_string()))?;
        if types.api_version.is_empty() || types.kind.is_empty() {
            return Err(parse_error("document has empty apiVersion or kind".to_string()));
        }

        Ok(Self {
            api_version: types.api_version,
            kind: types.kind,
            object,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Object name, empty when the template sets none
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn metadata(&self) -> &ObjectMeta {
        &self.object.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.object.metadata
    }

    /// Everything except apiVersion, kind and metadata
    pub fn body(&self) -> &serde_json::Value {
        &self.object.data
    }

    pub fn body_mut(&mut self) -> &mut serde_json::Value {
        &mut self.object.data
    }

    /// Group, version and kind of the resource
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    /// API resource for a dynamic client
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&self.gvk())
    }

    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    pub fn into_inner(self) -> DynamicObject {
        self.object
    }
}
