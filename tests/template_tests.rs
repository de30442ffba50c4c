//! Integration tests for template rendering and resource building
//!
//! These tests render the shipped template library as well as throw-away
//! templates written to a temporary directory.

use std::fs;
use std::path::{Path, PathBuf};

use gitea_operator::adapters::parameters::{GiteaParameters, InstanceKey, ParameterGenerator};
use gitea_operator::adapters::templates::TemplateRenderer;
use gitea_operator::config::ResourceNames;
use gitea_operator::Error;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn shipped_templates() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("templates")
}

fn params(hostname: &str) -> GiteaParameters {
    let generator = ParameterGenerator::new(ResourceNames::default(), StdRng::seed_from_u64(7));
    generator.parameters(&InstanceKey::new("gitea-ns", "example"), hostname, None)
}

fn renderer_with(templates: &[(&str, &str)]) -> (TempDir, TemplateRenderer) {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in templates {
        fs::write(dir.path().join(format!("{}.yaml", name)), body).unwrap();
    }
    let renderer = TemplateRenderer::new(dir.path());
    (dir, renderer)
}

// ============================================================================
// Shipped Template Tests
// ============================================================================

#[test]
fn ingress_carries_hostname_verbatim() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let ingress = renderer
        .create_resource("gitea-ingress", &params("demo.example.com"))
        .unwrap();

    assert_eq!(ingress.kind(), "Ingress");
    assert_eq!(ingress.api_version(), "networking.k8s.io/v1");
    assert_eq!(ingress.name(), "gitea-ingress");
    assert_eq!(ingress.body()["spec"]["rules"][0]["host"], "demo.example.com");
    assert_eq!(
        ingress.body()["spec"]["rules"][0]["http"]["paths"][0]["backend"]["service"]["name"],
        "gitea-service"
    );
}

#[test]
fn empty_hostname_renders_host_unrestricted_ingress() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let ingress = renderer.create_resource("gitea-ingress", &params("")).unwrap();

    let rule = &ingress.body()["spec"]["rules"][0];
    assert!(rule.get("host").is_none());
    assert!(rule.get("http").is_some());
}

#[test]
fn config_map_embeds_generated_credentials() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let params = params("git.example.com");
    let config = renderer.create_resource("gitea-config", &params).unwrap();

    assert_eq!(config.kind(), "ConfigMap");
    assert_eq!(config.metadata().namespace.as_deref(), Some("gitea-ns"));

    let app_ini = config.body()["data"]["app.ini"].as_str().unwrap();
    assert!(app_ini.contains(&format!("PASSWD   = {}", params.database_password)));
    assert!(app_ini.contains(&format!("INTERNAL_TOKEN = {}", params.gitea_internal_token)));
    assert!(app_ini.contains(&format!("SECRET_KEY     = {}", params.gitea_secret_key)));
    assert!(app_ini.contains("INSTALL_LOCK   = true"));
    assert!(app_ini.contains("HOST     = gitea-postgres-service:5432"));
    assert!(app_ini
        .lines()
        .any(|l| l.starts_with("ROOT_URL") && l.ends_with("= http://git.example.com")));
}

#[test]
fn config_map_without_hostname_omits_root_url() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let config = renderer.create_resource("gitea-config", &params("")).unwrap();

    let app_ini = config.body()["data"]["app.ini"].as_str().unwrap();
    assert!(!app_ini.contains("ROOT_URL"));
    assert!(app_ini.contains("[server]\nSTART_SSH_SERVER"));
}

#[test]
fn every_shipped_template_builds_a_resource() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let params = params("git.example.com");

    let expected = [
        ("gitea-config", "ConfigMap", "gitea-config"),
        ("gitea-deployment", "Deployment", "gitea"),
        ("gitea-ingress", "Ingress", "gitea-ingress"),
        ("postgres-deployment", "Deployment", "postgres"),
        ("postgres-pvc", "PersistentVolumeClaim", "gitea-postgres-pvc"),
        ("postgres-service", "Service", "gitea-postgres-service"),
        ("gitea-pvc", "PersistentVolumeClaim", "gitea-repos-pvc"),
        ("gitea-service-account", "ServiceAccount", "gitea-service-account"),
        ("gitea-service", "Service", "gitea-service"),
    ];

    for (template, kind, name) in expected {
        let resource = renderer
            .create_resource(template, &params)
            .unwrap_or_else(|e| panic!("{} failed: {}", template, e));
        assert_eq!(resource.kind(), kind, "kind of {}", template);
        assert_eq!(resource.name(), name, "name of {}", template);
    }
}

#[test]
fn rendering_is_deterministic() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let params = params("git.example.com");

    let first = renderer.render("gitea-deployment", &params).unwrap();
    let second = renderer.render("gitea-deployment", &params).unwrap();
    assert_eq!(first, second);

    let a = renderer.create_resource("gitea-config", &params).unwrap();
    let b = renderer.create_resource("gitea-config", &params).unwrap();
    assert_eq!(a.body(), b.body());
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn unknown_template_is_not_found() {
    let renderer = TemplateRenderer::new(shipped_templates());
    let err = renderer
        .create_resource("gitea-route", &params(""))
        .unwrap_err();

    assert!(matches!(err, Error::TemplateNotFound { ref template } if template == "gitea-route"));
}

#[test]
fn missing_template_root_is_not_found() {
    let renderer = TemplateRenderer::new("/nonexistent/gitea/templates");
    let err = renderer.render("gitea-config", &params("")).unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound { .. }));
}

#[test]
fn path_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("templates");
    fs::create_dir(&root).unwrap();
    fs::write(
        dir.path().join("outside.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: outside\n",
    )
    .unwrap();

    let renderer = TemplateRenderer::new(&root);
    for name in ["../outside", "..", "/etc/passwd", "sub/../../outside"] {
        let err = renderer.render(name, &params("")).unwrap_err();
        assert!(
            matches!(err, Error::TemplateNotFound { .. }),
            "{} should not resolve",
            name
        );
    }
}

#[cfg(unix)]
#[test]
fn symlink_escaping_the_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("templates");
    fs::create_dir(&root).unwrap();
    let outside = dir.path().join("outside.yaml");
    fs::write(
        &outside,
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: outside\n",
    )
    .unwrap();
    std::os::unix::fs::symlink(&outside, root.join("linked.yaml")).unwrap();

    let renderer = TemplateRenderer::new(&root);
    let err = renderer.render("linked", &params("")).unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound { .. }));
}

#[test]
fn malformed_template_is_a_syntax_error() {
    let (_dir, renderer) = renderer_with(&[(
        "broken",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ gitea_config_map_name \n",
    )]);

    let err = renderer.render("broken", &params("")).unwrap_err();
    assert!(matches!(err, Error::TemplateSyntax { ref template, .. } if template == "broken"));
}

#[test]
fn unknown_field_is_a_render_error() {
    let (_dir, renderer) = renderer_with(&[(
        "unknown-field",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ gitea_route_name }}\n",
    )]);

    let err = renderer
        .create_resource("unknown-field", &params(""))
        .unwrap_err();
    assert!(matches!(err, Error::Render { ref template, .. } if template == "unknown-field"));
}

#[test]
fn templates_cannot_reach_beyond_parameters() {
    let (_dir, renderer) = renderer_with(&[(
        "env-lookup",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ env.HOME }}\n",
    )]);

    let err = renderer.render("env-lookup", &params("")).unwrap_err();
    assert!(matches!(err, Error::Render { .. }));
}

#[test]
fn rendered_text_that_is_not_a_resource_is_a_parse_error() {
    let (_dir, renderer) = renderer_with(&[
        ("not-yaml", "kind: [{{ hostname }}\n"),
        ("no-kind", "metadata:\n  name: {{ gitea_service_name }}\n"),
    ]);

    let err = renderer
        .create_resource("not-yaml", &params("demo.example.com"))
        .unwrap_err();
    assert!(matches!(err, Error::Parse { ref template, .. } if template == "not-yaml"));

    let err = renderer.create_resource("no-kind", &params("")).unwrap_err();
    assert!(matches!(err, Error::Parse { ref template, .. } if template == "no-kind"));
}

#[test]
fn render_errors_are_not_retryable() {
    let (_dir, renderer) = renderer_with(&[("bad", "{{ missing }}")]);
    let err = renderer.render("bad", &params("")).unwrap_err();
    assert!(!err.is_retryable());
}
