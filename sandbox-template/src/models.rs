use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap as Map, fmt};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct BuildId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct InstanceId(pub String);

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What gets baked into an image. Build steps run in order and a nonzero
/// exit aborts the rest of the build.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub base_image: String,
    pub user: String,
    pub build_env: Map<String, String>,
    pub build_steps: Vec<String>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Capacity {
    pub cpus: u32,
    pub memory_mb: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Capacity {
            cpus: 2,
            memory_mb: 2048,
        }
    }
}

/// Hex digest of an `ImageSpec`, see `hasher::fingerprint`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Fingerprint(pub String);

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub alias: Alias,
    pub image: ImageSpec,
    pub capacity: Capacity,
    pub fingerprint: Fingerprint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltImage {
    pub image_id: ImageId,
    pub build_id: BuildId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildResult {
    pub image_id: ImageId,
    pub build_id: BuildId,
    pub alias: Alias,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub label: String,
    pub command: String,
}

impl Check {
    pub fn new<L: Into<String>, C: Into<String>>(label: L, command: C) -> Check {
        Check {
            label: label.into(),
            command: command.into(),
        }
    }
}

/// Everything the verifier needs besides the alias. The runtime environment
/// is separate from the build environment because instances do not inherit
/// variables set at build time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPlan {
    pub runtime_env: Map<String, String>,
    pub checks: Vec<Check>,
    pub smoke: Option<Check>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckKind {
    Command,
    Smoke,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOutcome {
    pub label: String,
    pub command: String,
    pub kind: CheckKind,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub passed: bool,
}

impl CheckOutcome {
    pub fn new(check: &Check, kind: CheckKind, output: CommandOutput) -> CheckOutcome {
        CheckOutcome {
            label: check.label.clone(),
            command: check.command.clone(),
            kind,
            exit_code: output.exit_code,
            passed: output.exit_code == 0,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VerificationReport {
    pub alias: Alias,
    pub instance: InstanceId,
    pub entries: Vec<CheckOutcome>,
    pub teardown_error: Option<String>,
}

impl VerificationReport {
    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.entries.iter().filter(|entry| !entry.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Why a verify run ending with this report should exit nonzero, if it
    /// should. A failed teardown always fails the run, failed checks only
    /// under `VerifyPolicy::Strict`.
    pub fn exit_error(&self, policy: VerifyPolicy) -> Option<String> {
        if let Some(teardown_error) = &self.teardown_error {
            return Some(teardown_error.clone());
        }

        let failed = self.failures().count();
        match policy {
            VerifyPolicy::Strict if failed > 0 => {
                Some(format!("{} verification checks failed", failed))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateDefinition {
    pub alias: Alias,
    pub image: ImageSpec,
    pub capacity: Capacity,
    pub verification: VerificationPlan,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyPolicy {
    /// Failed checks are reported but do not fail the run.
    Lenient,
    /// Any failed check fails the run.
    Strict,
}
