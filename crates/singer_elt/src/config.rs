//! TOML pipeline files.
//!
//! ```toml
//! buffer_size = 10485760
//! kill_grace_period_ms = 5000
//!
//! [extractor]
//! name = "tap-csv"
//! executable = "tap-csv"
//! stderr_capture = "logs/tap-csv.err"
//!
//! [extractor.plugin]
//! kind = "tap"
//! config = "tap-csv.json"
//!
//! [loader]
//! name = "target-jsonl"
//! executable = "target-jsonl"
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    CaptureTarget, ConfigError, EltContext, PluginInvocation, PluginKind, Stage, StageCommand,
    StageRole, DEFAULT_BUFFER_SIZE, DEFAULT_KILL_GRACE_PERIOD, MIN_BUFFER_SIZE,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub buffer_size: Option<usize>,
    #[serde(default)]
    pub kill_grace_period_ms: Option<u64>,
    pub extractor: StageSection,
    #[serde(default)]
    pub mapper: Option<StageSection>,
    pub loader: StageSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSection {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub stdout_capture: Option<PathBuf>,
    #[serde(default)]
    pub stderr_capture: Option<PathBuf>,
    #[serde(default)]
    pub plugin: Option<PluginSection>,
}

/// Singer plugin conventions applied on top of the stage's own arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PluginSection {
    Tap {
        #[serde(default)]
        config: Option<PathBuf>,
        #[serde(default)]
        catalog: Option<PathBuf>,
        #[serde(default)]
        state: Option<PathBuf>,
    },
    Target {
        #[serde(default)]
        config: Option<PathBuf>,
    },
    Mapper {
        #[serde(default)]
        config: Option<PathBuf>,
    },
}

impl PluginSection {
    fn resolve(&self, base_dir: &Path) -> PluginKind {
        let at = |path: &Option<PathBuf>| path.as_deref().map(|p| resolve_path(base_dir, p));
        match self {
            PluginSection::Tap {
                config,
                catalog,
                state,
            } => PluginKind::Tap(crate::TapInvocation {
                config: at(config),
                catalog: at(catalog),
                state: at(state),
            }),
            PluginSection::Target { config } => {
                PluginKind::Target(crate::TargetInvocation { config: at(config) })
            }
            PluginSection::Mapper { config } => {
                PluginKind::Mapper(crate::MapperInvocation { config: at(config) })
            }
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Validates the pipeline and resolves it into a runnable context.
    ///
    /// Relative paths (executables containing a separator, working directories, captures and
    /// plugin files) are taken relative to `base_dir`; bare executable names are left for the
    /// `PATH` lookup at spawn time.
    pub fn into_context(&self, base_dir: &Path) -> Result<EltContext, ConfigError> {
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE} bytes, got {buffer_size}"
            )));
        }
        let grace = self
            .kill_grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KILL_GRACE_PERIOD);

        let extractor = self.extractor.resolve(StageRole::Extractor, base_dir)?;
        let loader = self.loader.resolve(StageRole::Loader, base_dir)?;
        let mut builder = EltContext::builder(extractor, loader)
            .buffer_size(buffer_size)
            .kill_grace_period(grace);
        if let Some(mapper) = &self.mapper {
            builder = builder.mapper(mapper.resolve(StageRole::Mapper, base_dir)?);
        }
        let context = builder.build();

        let mut names = BTreeMap::new();
        for stage in context.stages() {
            if let Some(previous) = names.insert(stage.name(), stage.role()) {
                return Err(ConfigError::Invalid(format!(
                    "{previous} and {} are both named `{}`",
                    stage.role(),
                    stage.name()
                )));
            }
        }
        Ok(context)
    }
}

impl StageSection {
    fn resolve(&self, role: StageRole, base_dir: &Path) -> Result<Stage, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{role} name must not be empty")));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{role} `{}` has no executable",
                self.name
            )));
        }

        let executable = if self.executable.components().count() > 1 {
            resolve_path(base_dir, &self.executable)
        } else {
            self.executable.clone()
        };
        let mut command = StageCommand::new(self.name.clone(), role, executable).args(&self.args);
        if let Some(cwd) = &self.cwd {
            command = command.cwd(resolve_path(base_dir, cwd));
        }

        if let Some(plugin) = &self.plugin {
            let plugin = plugin.resolve(base_dir);
            if plugin.role() != role {
                return Err(ConfigError::RoleMismatch {
                    stage: self.name.clone(),
                    kind: plugin.as_str(),
                    role,
                });
            }
            if let Some(missing) = plugin.config_files().into_iter().find(|path| !path.exists()) {
                return Err(ConfigError::MissingConfigFile {
                    stage: self.name.clone(),
                    path: missing.to_path_buf(),
                });
            }
            command = command.args(plugin.spawn_args());
            command.env.extend(plugin.env());
        }
        // Explicit stage variables win over plugin defaults.
        command.env.extend(self.env.clone());

        let mut stage = Stage::new(command);
        if let Some(path) = &self.stdout_capture {
            stage = stage.capture_stdout(CaptureTarget::File(resolve_path(base_dir, path)));
        }
        if let Some(path) = &self.stderr_capture {
            stage = stage.capture_stderr(CaptureTarget::File(resolve_path(base_dir, path)));
        }
        Ok(stage)
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    const MINIMAL: &str = r#"
        [extractor]
        name = "tap-csv"
        executable = "tap-csv"

        [loader]
        name = "target-jsonl"
        executable = "./bin/target-jsonl"
        args = ["--verbose"]
        stderr_capture = "logs/target.err"
    "#;

    fn parse(input: &str) -> PipelineConfig {
        PipelineConfig::from_toml_str(input, Path::new("pipeline.toml")).expect("parse")
    }

    #[test]
    fn minimal_pipeline_uses_defaults() {
        let context = parse(MINIMAL).into_context(Path::new("/work")).expect("resolve");

        assert_eq!(context.buffer.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(context.kill_grace_period, DEFAULT_KILL_GRACE_PERIOD);
        assert!(context.mapper.is_none());
        assert_eq!(context.extractor.command.executable, PathBuf::from("tap-csv"));
        assert_eq!(
            context.loader.command.executable,
            PathBuf::from("/work/./bin/target-jsonl")
        );
        assert_eq!(context.loader.command.args, vec![OsString::from("--verbose")]);
        assert!(matches!(
            &context.loader.capture.stderr,
            Some(CaptureTarget::File(path)) if path == Path::new("/work/logs/target.err")
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let input = format!("bufer_size = 12\n{MINIMAL}");
        let err = PipelineConfig::from_toml_str(&input, Path::new("p.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn tiny_buffer_is_invalid() {
        let input = format!("buffer_size = 1\n{MINIMAL}");
        let err = parse(&input).into_context(Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn duplicate_stage_names_are_invalid() {
        let input = r#"
            [extractor]
            name = "same"
            executable = "a"

            [loader]
            name = "same"
            executable = "b"
        "#;
        let err = parse(input).into_context(Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("same"), "{err}");
    }

    #[test]
    fn plugin_kind_must_match_role() {
        let input = r#"
            [extractor]
            name = "target-in-the-wrong-place"
            executable = "target-jsonl"
            plugin = { kind = "target" }

            [loader]
            name = "target-jsonl"
            executable = "target-jsonl"
        "#;
        let err = parse(input).into_context(Path::new("/")).unwrap_err();
        assert!(
            matches!(
                err,
                ConfigError::RoleMismatch {
                    kind: "target",
                    role: StageRole::Extractor,
                    ..
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn plugin_files_must_exist_and_become_arguments() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("tap.json"), "{}").expect("write config");

        let input = r#"
            [extractor]
            name = "tap-csv"
            executable = "tap-csv"
            env = { PYTHONUNBUFFERED = "0", TAP_MODE = "full" }
            plugin = { kind = "tap", config = "tap.json" }

            [loader]
            name = "target-jsonl"
            executable = "target-jsonl"
            plugin = { kind = "target", config = "missing.json" }
        "#;
        let err = parse(input).into_context(dir.path()).unwrap_err();
        assert!(
            matches!(&err, ConfigError::MissingConfigFile { stage, .. } if stage == "target-jsonl"),
            "{err}"
        );

        let input = input.replace(
            "plugin = { kind = \"target\", config = \"missing.json\" }",
            "plugin = { kind = \"target\" }",
        );
        let context = parse(&input).into_context(dir.path()).expect("resolve");
        let extractor = &context.extractor.command;
        assert_eq!(
            extractor.args,
            vec![
                OsString::from("--config"),
                dir.path().join("tap.json").into_os_string()
            ]
        );
        assert_eq!(extractor.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("0"));
        assert_eq!(extractor.env.get("TAP_MODE").map(String::as_str), Some("full"));
    }

    #[test]
    fn mapper_section_is_resolved() {
        let mapper = r#"
            [mapper]
            name = "meltano-map"
            executable = "map"
            plugin = { kind = "mapper" }
        "#;
        let input = format!("{MINIMAL}\n{mapper}");
        let context = parse(&input).into_context(Path::new("/")).expect("resolve");
        let mapper = context.mapper.expect("mapper");
        assert_eq!(mapper.role(), StageRole::Mapper);
        assert_eq!(mapper.name(), "meltano-map");
    }
}
