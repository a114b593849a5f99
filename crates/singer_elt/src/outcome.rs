use std::{fmt, process::ExitStatus};

use serde_json::Value;

use crate::StageRole;

/// Verdict of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    ExtractorFailed {
        code: i32,
    },
    MapperFailed {
        code: i32,
    },
    LoaderFailed {
        code: i32,
    },
    ExtractorAndLoaderFailed {
        extractor_code: i32,
        loader_code: i32,
    },
    /// A stage emitted a line larger than half the configured buffer size.
    OutputLineLimitExceeded {
        stage: String,
        role: StageRole,
        limit: usize,
        buffer_size: usize,
    },
    /// Forwarding plumbing broke independently of the plugins, e.g. a capture file.
    SinkFailure {
        channel: String,
        message: String,
    },
    /// The caller cancelled the run.
    Aborted,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    /// Process exit code the CLI uses for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::ExtractorFailed { .. } => 10,
            RunOutcome::MapperFailed { .. } => 11,
            RunOutcome::LoaderFailed { .. } => 12,
            RunOutcome::ExtractorAndLoaderFailed { .. } => 13,
            RunOutcome::OutputLineLimitExceeded { .. } => 14,
            RunOutcome::SinkFailure { .. } => 15,
            RunOutcome::Aborted => 17,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Success => f.write_str("Extract and load complete"),
            RunOutcome::ExtractorFailed { code } => {
                write!(f, "Extractor failed (exit code {code})")
            }
            RunOutcome::MapperFailed { code } => write!(f, "Mapper failed (exit code {code})"),
            RunOutcome::LoaderFailed { code } => write!(f, "Loader failed (exit code {code})"),
            RunOutcome::ExtractorAndLoaderFailed {
                extractor_code,
                loader_code,
            } => write!(
                f,
                "Extractor and loader failed \
                 (extractor exit code {extractor_code}, loader exit code {loader_code})"
            ),
            RunOutcome::OutputLineLimitExceeded {
                stage,
                role,
                limit,
                buffer_size,
            } => write!(
                f,
                "Output line length limit exceeded: {role} `{stage}` emitted a message larger than \
                 {} (half of the {} buffer size). Raise `buffer_size` to at least twice the \
                 largest expected message and try again.",
                human_bytes(*limit),
                human_bytes(*buffer_size)
            ),
            RunOutcome::SinkFailure { channel, message } => {
                write!(f, "Output of {channel} could not be delivered: {message}")
            }
            RunOutcome::Aborted => f.write_str("Run aborted"),
        }
    }
}

fn human_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl StageExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or the negated signal number for a signalled process.
    pub fn effective_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub role: StageRole,
    pub exit: StageExit,
    /// The pipeline stopped this stage (killed it or closed its output); its exit code does
    /// not count toward the outcome.
    pub terminated_by_pipeline: bool,
}

impl StageReport {
    fn failed(&self) -> Option<i32> {
        (!self.terminated_by_pipeline && !self.exit.success()).then(|| self.exit.effective_code())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Stages in spawn order.
    pub stages: Vec<StageReport>,
    /// `value` of the last Singer STATE message the loader emitted.
    pub final_state: Option<Value>,
    /// Lines the extractor delivered into the chain.
    pub records_forwarded: u64,
}

impl RunReport {
    pub fn stage(&self, role: StageRole) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.role == role)
    }
}

/// Facts gathered by the runner that are not exit codes.
#[derive(Debug, Default)]
pub(crate) struct RunFacts {
    pub(crate) aborted: bool,
    pub(crate) line_limit: Option<RunOutcome>,
    pub(crate) plumbing: Option<RunOutcome>,
}

/// Combines stage exits and runner facts into one outcome.
///
/// Precedence: abort, line limit, extractor+loader, extractor, mapper, loader, plumbing.
pub(crate) fn derive_outcome(stages: &[StageReport], facts: RunFacts) -> RunOutcome {
    if facts.aborted {
        return RunOutcome::Aborted;
    }
    if let Some(line_limit) = facts.line_limit {
        return line_limit;
    }

    let failed = |role: StageRole| {
        stages
            .iter()
            .filter(|stage| stage.role == role)
            .find_map(StageReport::failed)
    };
    let extractor = failed(StageRole::Extractor);
    let mapper = failed(StageRole::Mapper);
    let loader = failed(StageRole::Loader);

    match (extractor, mapper, loader) {
        (Some(extractor_code), _, Some(loader_code)) => RunOutcome::ExtractorAndLoaderFailed {
            extractor_code,
            loader_code,
        },
        (Some(code), _, None) => RunOutcome::ExtractorFailed { code },
        (None, Some(code), _) => RunOutcome::MapperFailed { code },
        (None, None, Some(code)) => RunOutcome::LoaderFailed { code },
        (None, None, None) => facts.plumbing.unwrap_or(RunOutcome::Success),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(role: StageRole, code: i32) -> StageReport {
        StageReport {
            name: role.to_string(),
            role,
            exit: StageExit {
                code: Some(code),
                signal: None,
            },
            terminated_by_pipeline: false,
        }
    }

    #[test]
    fn exit_code_combinations() {
        let cases = [
            (0, 0, RunOutcome::Success),
            (1, 0, RunOutcome::ExtractorFailed { code: 1 }),
            (0, 2, RunOutcome::LoaderFailed { code: 2 }),
            (
                1,
                2,
                RunOutcome::ExtractorAndLoaderFailed {
                    extractor_code: 1,
                    loader_code: 2,
                },
            ),
        ];
        for (extractor, loader, expected) in cases {
            let stages = [
                stage(StageRole::Extractor, extractor),
                stage(StageRole::Loader, loader),
            ];
            assert_eq!(
                derive_outcome(&stages, RunFacts::default()),
                expected,
                "extractor={extractor} loader={loader}"
            );
        }
    }

    #[test]
    fn killed_extractor_does_not_count() {
        let mut extractor = stage(StageRole::Extractor, 0);
        extractor.exit = StageExit {
            code: None,
            signal: Some(15),
        };
        extractor.terminated_by_pipeline = true;
        let stages = [extractor, stage(StageRole::Loader, 1)];
        assert_eq!(
            derive_outcome(&stages, RunFacts::default()),
            RunOutcome::LoaderFailed { code: 1 }
        );
    }

    #[test]
    fn mapper_failure_fails_an_otherwise_clean_run() {
        let stages = [
            stage(StageRole::Extractor, 0),
            stage(StageRole::Mapper, 1),
            stage(StageRole::Loader, 0),
        ];
        assert_eq!(
            derive_outcome(&stages, RunFacts::default()),
            RunOutcome::MapperFailed { code: 1 }
        );
    }

    #[test]
    fn line_limit_wins_over_exit_codes_and_plumbing_loses() {
        let limit = RunOutcome::OutputLineLimitExceeded {
            stage: "tap".into(),
            role: StageRole::Extractor,
            limit: 512,
            buffer_size: 1024,
        };
        let stages = [stage(StageRole::Extractor, 1), stage(StageRole::Loader, 0)];
        let facts = RunFacts {
            line_limit: Some(limit.clone()),
            ..RunFacts::default()
        };
        assert_eq!(derive_outcome(&stages, facts), limit);

        let plumbing = RunOutcome::SinkFailure {
            channel: "tap stdout".into(),
            message: "disk full".into(),
        };
        let facts = RunFacts {
            plumbing: Some(plumbing.clone()),
            ..RunFacts::default()
        };
        assert_eq!(
            derive_outcome(&stages, facts),
            RunOutcome::ExtractorFailed { code: 1 }
        );
        let clean = [stage(StageRole::Extractor, 0), stage(StageRole::Loader, 0)];
        let facts = RunFacts {
            plumbing: Some(plumbing.clone()),
            ..RunFacts::default()
        };
        assert_eq!(derive_outcome(&clean, facts), plumbing);
    }

    #[test]
    fn signalled_stage_reports_negative_code() {
        let exit = StageExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit.effective_code(), -9);
        assert!(!exit.success());
    }

    #[test]
    fn line_limit_message_mentions_buffer_size() {
        let message = RunOutcome::OutputLineLimitExceeded {
            stage: "tap-github".into(),
            role: StageRole::Extractor,
            limit: 5 * 1024 * 1024,
            buffer_size: 10 * 1024 * 1024,
        }
        .to_string();
        assert!(message.contains("5.0 MiB"), "{message}");
        assert!(message.contains("10.0 MiB"), "{message}");
        assert!(message.contains("buffer_size"), "{message}");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let outcomes = [
            RunOutcome::Success,
            RunOutcome::ExtractorFailed { code: 1 },
            RunOutcome::MapperFailed { code: 1 },
            RunOutcome::LoaderFailed { code: 1 },
            RunOutcome::ExtractorAndLoaderFailed {
                extractor_code: 1,
                loader_code: 1,
            },
            RunOutcome::SinkFailure {
                channel: String::new(),
                message: String::new(),
            },
            RunOutcome::Aborted,
        ];
        let mut codes: Vec<_> = outcomes.iter().map(RunOutcome::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), outcomes.len());
    }
}
