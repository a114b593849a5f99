use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::StageRole;

/// What a plugin kind contributes to its own invocation.
pub trait PluginInvocation {
    /// Arguments appended after any user supplied ones.
    fn spawn_args(&self) -> Vec<OsString>;
    /// Files the plugin reads at startup; they must exist before the run starts.
    fn config_files(&self) -> Vec<&Path>;
    /// Environment layered under the stage's own variables.
    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())])
    }
}

/// A Singer tap: `--config`, `--catalog` and `--state`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapInvocation {
    pub config: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub state: Option<PathBuf>,
}

impl PluginInvocation for TapInvocation {
    fn spawn_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        push_flag(&mut args, "--config", self.config.as_deref());
        push_flag(&mut args, "--catalog", self.catalog.as_deref());
        push_flag(&mut args, "--state", self.state.as_deref());
        args
    }

    fn config_files(&self) -> Vec<&Path> {
        [&self.config, &self.catalog, &self.state]
            .into_iter()
            .filter_map(|path| path.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInvocation {
    pub config: Option<PathBuf>,
}

impl PluginInvocation for TargetInvocation {
    fn spawn_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        push_flag(&mut args, "--config", self.config.as_deref());
        args
    }

    fn config_files(&self) -> Vec<&Path> {
        self.config.as_deref().into_iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapperInvocation {
    pub config: Option<PathBuf>,
}

impl PluginInvocation for MapperInvocation {
    fn spawn_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        push_flag(&mut args, "--config", self.config.as_deref());
        args
    }

    fn config_files(&self) -> Vec<&Path> {
        self.config.as_deref().into_iter().collect()
    }
}

fn push_flag(args: &mut Vec<OsString>, flag: &str, value: Option<&Path>) {
    if let Some(value) = value {
        args.push(OsString::from(flag));
        args.push(value.as_os_str().to_os_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
    Tap(TapInvocation),
    Target(TargetInvocation),
    Mapper(MapperInvocation),
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Tap(_) => "tap",
            PluginKind::Target(_) => "target",
            PluginKind::Mapper(_) => "mapper",
        }
    }

    /// The only stage position this kind can occupy.
    pub fn role(&self) -> StageRole {
        match self {
            PluginKind::Tap(_) => StageRole::Extractor,
            PluginKind::Target(_) => StageRole::Loader,
            PluginKind::Mapper(_) => StageRole::Mapper,
        }
    }

    fn invocation(&self) -> &dyn PluginInvocation {
        match self {
            PluginKind::Tap(tap) => tap,
            PluginKind::Target(target) => target,
            PluginKind::Mapper(mapper) => mapper,
        }
    }
}

impl PluginInvocation for PluginKind {
    fn spawn_args(&self) -> Vec<OsString> {
        self.invocation().spawn_args()
    }

    fn config_files(&self) -> Vec<&Path> {
        self.invocation().config_files()
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.invocation().env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_args_follow_singer_conventions() {
        let tap = PluginKind::Tap(TapInvocation {
            config: Some("tap.json".into()),
            catalog: Some("catalog.json".into()),
            state: None,
        });
        assert_eq!(
            tap.spawn_args(),
            ["--config", "tap.json", "--catalog", "catalog.json"]
                .map(OsString::from)
                .to_vec()
        );
        assert_eq!(
            tap.config_files(),
            [Path::new("tap.json"), Path::new("catalog.json")]
        );
        assert_eq!(tap.role(), StageRole::Extractor);
    }

    #[test]
    fn target_without_config_has_no_args() {
        let target = PluginKind::Target(TargetInvocation::default());
        assert!(target.spawn_args().is_empty());
        assert!(target.config_files().is_empty());
        assert_eq!(target.env().get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
    }
}
