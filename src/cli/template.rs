//! `shipline template` - Print the reference delivery pipeline
//!
//! The output is a regular pipeline definition; edit it and feed it back to
//! `shipline run`.

use anyhow::{Context, Result};
use shipline::delivery::DeliveryConfig;
use std::fs;
use std::path::Path;

/// Delivery settings from `file`, else the defaults for `project`
pub fn delivery_config(project: &str, file: Option<&Path>) -> Result<DeliveryConfig> {
    let Some(file) = file else {
        return Ok(DeliveryConfig::for_project(project));
    };
    let yaml = fs::read_to_string(file)
        .with_context(|| format!("Failed to read delivery settings: {}", file.display()))?;
    serde_yaml::from_str(&yaml)
        .with_context(|| format!("Invalid delivery settings: {}", file.display()))
}

/// Renders the delivery pipeline as YAML
pub fn render(config: &DeliveryConfig) -> Result<String> {
    let pipeline = config
        .pipeline()
        .context("Delivery settings do not form a valid pipeline")?;
    let yaml = pipeline.to_yaml().context("Failed to serialize pipeline")?;
    Ok(format!(
        "# Delivery pipeline for {}, generated by shipline {}\n{yaml}",
        config.project,
        shipline::VERSION
    ))
}

pub fn save(yaml: &str, output_path: &Path) -> Result<()> {
    fs::write(output_path, yaml)
        .with_context(|| format!("Failed to write template to: {}", output_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shipline::pipeline::Pipeline;
    use std::time::Duration;

    #[test]
    fn test_render_is_loadable() {
        let config = DeliveryConfig::for_project("shop");
        let yaml = render(&config).unwrap();

        assert!(yaml.starts_with("# Delivery pipeline for shop"));
        let pipeline = Pipeline::from_yaml_str(&yaml).unwrap();
        assert_eq!(pipeline, config.pipeline().unwrap());
    }

    #[test]
    fn test_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delivery.yaml");
        fs::write(
            &path,
            "project: billing\nstaging_port: 9090\nhealth_interval: 500ms\n",
        )
        .unwrap();

        let config = delivery_config("ignored", Some(&path)).unwrap();
        assert_eq!(config.project, "billing");
        assert_eq!(config.staging_port, 9090);
        assert_eq!(config.health_interval, Duration::from_millis(500));
        assert_eq!(config.staging_container, "app-staging");
    }

    #[test]
    fn test_invalid_project_is_reported() {
        assert!(render(&DeliveryConfig::for_project("bad name")).is_err());
    }

    #[test]
    fn test_save_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        save("name: x\n", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "name: x\n");
    }
}
