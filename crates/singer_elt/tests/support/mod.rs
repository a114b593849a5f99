#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use singer_elt::{StageCommand, StageRole};

pub const GRACE: Duration = Duration::from_millis(500);

/// Writes an executable `/bin/sh` script into `dir`.
pub fn write_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\nset -eu\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// A stage backed by a fake plugin script.
pub fn fake_stage(dir: &Path, name: &str, role: StageRole, body: &str) -> StageCommand {
    StageCommand::new(name, role, write_executable(dir, name, body))
}

pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}
