//! Controller implementations for watching and reconciling resources

pub mod gitea_controller;

use kube::Client;
use std::sync::Arc;

use crate::adapters::parameters::ParameterGenerator;
use crate::adapters::templates::TemplateRenderer;
use crate::config::OperatorConfig;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator configuration, read once at startup
    pub config: OperatorConfig,
    /// Template renderer over the configured template root
    pub renderer: TemplateRenderer,
    /// Issues parameter sets and owns the credential random source
    pub generator: ParameterGenerator,
}

impl Context {
    /// Create a new context with a generator seeded from OS entropy
    pub fn new(client: Client, config: OperatorConfig) -> Arc<Self> {
        let generator = ParameterGenerator::from_entropy(config.names.clone());
        Self::with_generator(client, config, generator)
    }

    /// Create a new context around an existing generator
    pub fn with_generator(
        client: Client,
        config: OperatorConfig,
        generator: ParameterGenerator,
    ) -> Arc<Self> {
        let renderer = TemplateRenderer::new(config.template_path.clone());
        Arc::new(Self {
            client,
            config,
            renderer,
            generator,
        })
    }
}
