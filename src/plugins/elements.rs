//! Built-in element kinds.

use crate::{
    element::{BuildContext, ElementPlugin},
    error::{BstError, Result},
    sandbox::Sandbox,
    vdir::FsDir,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

fn parse_config<T: Default + for<'de> Deserialize<'de>>(
    kind: &str,
    config: &serde_yaml::Value,
) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(config.clone())
        .map_err(|err| BstError::load(format!("invalid {kind} element config: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ImportConfig {
    source: String,
    target: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { source: "/".to_string(), target: "/".to_string() }
    }
}

/// Imports staged sources directly as the artifact payload, without running
/// any command.
#[derive(Debug)]
pub struct ImportElement {
    config: ImportConfig,
}

impl ElementPlugin for ImportElement {
    fn kind(&self) -> &str {
        "import"
    }

    fn unique_key(&self) -> Value {
        serde_json::json!({
            "source": self.config.source,
            "target": self.config.target,
        })
    }

    fn configure_sandbox(&self, _build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()> {
        sandbox.mark_directory("/buildstream/input", false)?;
        sandbox.mark_directory("/buildstream/output", false)
    }

    fn stage(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()> {
        build.stage_sources(sandbox, "/buildstream/input")
    }

    fn assemble(&self, _build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<String> {
        let root = FsDir::new(sandbox.root())?;
        let input = root
            .descend("/buildstream/input", false)?
            .descend(&self.config.source, false)
            .map_err(|_| {
                BstError::element(format!(
                    "import source {:?} contains no files",
                    self.config.source
                ))
                .with_reason("missing-output")
            })?;
        let output = root.descend("/buildstream/output", false)?.descend(&self.config.target, true)?;
        input.export_files(output.path(), true, false)?;
        Ok("/buildstream/output".to_string())
    }
}

pub(crate) fn import_factory(config: &serde_yaml::Value) -> Result<Arc<dyn ElementPlugin>> {
    Ok(Arc::new(ImportElement { config: parse_config("import", config)? }))
}

/// A pure dependency aggregation: the artifact is empty, the value is the
/// dependency edges.
#[derive(Debug, Default)]
pub struct StackElement;

impl ElementPlugin for StackElement {
    fn kind(&self) -> &str {
        "stack"
    }

    fn unique_key(&self) -> Value {
        Value::Null
    }

    fn configure_sandbox(&self, _build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()> {
        sandbox.mark_directory("/output", false)
    }

    fn stage(&self, _build: &BuildContext, _sandbox: &mut dyn Sandbox) -> Result<()> {
        Ok(())
    }

    fn assemble(&self, _build: &BuildContext, _sandbox: &mut dyn Sandbox) -> Result<String> {
        Ok("/output".to_string())
    }
}

pub(crate) fn stack_factory(_config: &serde_yaml::Value) -> Result<Arc<dyn ElementPlugin>> {
    Ok(Arc::new(StackElement))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManualConfig {
    #[serde(rename = "build-commands")]
    build_commands: Vec<String>,
    #[serde(rename = "install-commands")]
    install_commands: Vec<String>,
}

/// Runs explicitly configured build and install command lists against the
/// staged dependency sysroot.
#[derive(Debug)]
pub struct ManualElement {
    config: ManualConfig,
}

impl ElementPlugin for ManualElement {
    fn kind(&self) -> &str {
        "manual"
    }

    fn unique_key(&self) -> Value {
        serde_json::json!({
            "build-commands": self.config.build_commands,
            "install-commands": self.config.install_commands,
        })
    }

    fn configure_sandbox(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()> {
        let build_root = build.variable("build-root")?.to_string();
        let install_root = build.variable("install-root")?.to_string();
        sandbox.mark_directory(&build_root, false)?;
        sandbox.mark_directory(&install_root, true)?;
        sandbox.set_work_directory(&build_root);
        Ok(())
    }

    fn stage(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<()> {
        build.stage_dependency_artifacts(sandbox, None)?;
        build.integrate(sandbox)?;
        let build_root = build.variable("build-root")?.to_string();
        build.stage_sources(sandbox, &build_root)
    }

    fn assemble(&self, build: &BuildContext, sandbox: &mut dyn Sandbox) -> Result<String> {
        let build_root = build.variable("build-root")?.to_string();
        for command in self.config.build_commands.iter().chain(&self.config.install_commands) {
            build.run_command(sandbox, command, &build_root)?;
        }
        Ok(build.variable("install-root")?.to_string())
    }
}

pub(crate) fn manual_factory(config: &serde_yaml::Value) -> Result<Arc<dyn ElementPlugin>> {
    Ok(Arc::new(ManualElement { config: parse_config("manual", config)? }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_defaults_to_whole_tree() {
        let config = ImportConfig::default();
        assert_eq!(config.source, "/");
        assert_eq!(config.target, "/");
    }

    #[test]
    fn manual_config_parses_command_lists() {
        let yaml = r#"
build-commands:
- make
install-commands:
- make install DESTDIR="%{install-root}"
"#;
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let config: ManualConfig = parse_config("manual", &value).unwrap();
        assert_eq!(config.build_commands, vec!["make".to_string()]);
        assert_eq!(config.install_commands.len(), 1);
    }

    #[test]
    fn unique_keys_differ_with_configuration() {
        let a = ManualElement { config: ManualConfig::default() };
        let b = ManualElement {
            config: ManualConfig { build_commands: vec!["make".into()], install_commands: vec![] },
        };
        assert_ne!(a.unique_key(), b.unique_key());
    }
}
