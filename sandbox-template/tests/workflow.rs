//! Builder and verifier driven against an in-memory sandbox service.

use std::{
    cell::RefCell,
    collections::BTreeMap as Map,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

use sandbox_template::{
    frontends::BuiltinFrontend,
    models::{
        Alias, BuildId, BuildRequest, BuiltImage, Capacity, Check, CheckKind, CommandOutput,
        ImageId, ImageSpec, InstanceId, VerificationPlan,
    },
    Builder, Error, Result, SandboxInstance, SandboxService, TemplateFrontend, Verifier,
};

type ExecFn = dyn Fn(&str, &Map<String, String>) -> Result<CommandOutput>;

#[derive(Default)]
struct State {
    builds: Vec<BuildRequest>,
    acquired: Vec<(Alias, Map<String, String>)>,
    executed: Vec<String>,
    kills: usize,
}

struct FakeService {
    state: Rc<RefCell<State>>,
    build_error: Option<String>,
    image_id: String,
    acquire_error: Option<String>,
    kill_error: Option<String>,
    exec: Rc<ExecFn>,
}

impl FakeService {
    fn new(state: &Rc<RefCell<State>>) -> FakeService {
        FakeService {
            state: state.clone(),
            build_error: None,
            image_id: "sha256:0123abcd".into(),
            acquire_error: None,
            kill_error: None,
            exec: Rc::new(shell),
        }
    }
}

impl SandboxService for FakeService {
    fn build_template(
        &mut self,
        request: &BuildRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<BuiltImage> {
        let mut state = self.state.borrow_mut();
        state.builds.push(request.clone());

        for (index, step) in request.image.build_steps.iter().enumerate() {
            progress(&format!(
                "STEP {}/{}: RUN {}",
                index + 1,
                request.image.build_steps.len(),
                step
            ));
        }

        if let Some(error) = &self.build_error {
            return Err(Error::RemoteBuild(error.clone()));
        }

        Ok(BuiltImage {
            image_id: ImageId(self.image_id.clone()),
            build_id: BuildId(format!("build-{}", state.builds.len())),
        })
    }

    fn acquire_instance(
        &mut self,
        alias: &Alias,
        runtime_env: &Map<String, String>,
        _capacity: &Capacity,
    ) -> Result<Box<dyn SandboxInstance>> {
        if let Some(error) = &self.acquire_error {
            return Err(Error::Remote(error.clone()));
        }

        self.state
            .borrow_mut()
            .acquired
            .push((alias.clone(), runtime_env.clone()));

        Ok(Box::new(FakeInstance {
            id: InstanceId("sandbox-fake".into()),
            env: runtime_env.clone(),
            state: self.state.clone(),
            kill_error: self.kill_error.clone(),
            exec: self.exec.clone(),
        }))
    }
}

struct FakeInstance {
    id: InstanceId,
    env: Map<String, String>,
    state: Rc<RefCell<State>>,
    kill_error: Option<String>,
    exec: Rc<ExecFn>,
}

impl SandboxInstance for FakeInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.state.borrow_mut().executed.push(command.to_string());
        (self.exec)(command, &self.env)
    }

    fn kill(&mut self) -> Result<()> {
        self.state.borrow_mut().kills += 1;

        match &self.kill_error {
            Some(error) => Err(Error::Remote(error.clone())),
            None => Ok(()),
        }
    }
}

/// Runs each `&&` separated part of `command` by resolving its first word
/// against the PATH of the instance, the way a shell reports a missing
/// binary.
fn shell(command: &str, env: &Map<String, String>) -> Result<CommandOutput> {
    let path = env.get("PATH").map(String::as_str).unwrap_or("");
    let dirs = path.split(':').collect::<Vec<_>>();
    let mut stdout = String::new();

    for part in command.split("&&") {
        let mut words = part.split_whitespace();
        let program = words.next().unwrap_or("");

        let found = match program {
            "exit" => {
                let code = words.next().and_then(|code| code.parse().ok()).unwrap_or(0);
                if code != 0 {
                    return Ok(CommandOutput {
                        exit_code: code,
                        stdout,
                        stderr: String::new(),
                    });
                }
                continue;
            }
            "rustc" | "cargo" | "rustup" => dirs.contains(&"/usr/local/cargo/bin"),
            "cd" | "echo" => true,
            _ => dirs.contains(&"/usr/bin"),
        };

        if !found {
            return Ok(CommandOutput {
                exit_code: 127,
                stdout,
                stderr: format!("/bin/sh: 1: {}: not found\n", program),
            });
        }

        stdout.push_str(&format!("{} 1.0.0\n", program));
    }

    Ok(CommandOutput {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    })
}

fn state() -> Rc<RefCell<State>> {
    Rc::new(RefCell::new(State::default()))
}

fn image() -> ImageSpec {
    ImageSpec {
        base_image: "docker.io/library/ubuntu:22.04".into(),
        user: "root".into(),
        build_env: vec![("CARGO_HOME".to_string(), "/usr/local/cargo".to_string())]
            .into_iter()
            .collect(),
        build_steps: vec![
            "apt-get update && apt-get install -y curl".into(),
            "curl -sSf https://sh.rustup.rs | sh -s -- -y".into(),
        ],
    }
}

fn plan(commands: &[&str]) -> VerificationPlan {
    VerificationPlan {
        runtime_env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())]
            .into_iter()
            .collect(),
        checks: commands
            .iter()
            .enumerate()
            .map(|(index, command)| Check::new(format!("check {}", index), *command))
            .collect(),
        smoke: None,
    }
}

fn alias() -> Alias {
    Alias("rust-toolchain".into())
}

// =============================================================================
// BUILDER
// =============================================================================

#[test]
fn build_reports_image_and_alias() {
    let state = state();
    let mut builder = Builder::new(FakeService::new(&state));

    let mut progress = Vec::new();
    let result = builder
        .build(&alias(), &image(), Capacity::default(), &mut |line| {
            progress.push(line.to_string())
        })
        .unwrap();

    assert_eq!(result.image_id, ImageId("sha256:0123abcd".into()));
    assert_eq!(result.alias, alias());
    assert!(!result.build_id.0.is_empty());
    assert_eq!(progress.len(), 2);
    assert!(progress[0].starts_with("STEP 1/2"));

    let state = state.borrow();
    assert_eq!(state.builds.len(), 1);
    assert_eq!(state.builds[0].image, image());
}

#[test]
fn build_failure_carries_service_diagnostic() {
    let state = state();
    let mut service = FakeService::new(&state);
    service.build_error = Some("step 2: curl: (6) Could not resolve host".into());
    let mut builder = Builder::new(service);

    let err = builder
        .build(&alias(), &image(), Capacity::default(), &mut |_| {})
        .unwrap_err();

    match err {
        Error::RemoteBuild(message) => assert!(message.contains("Could not resolve host")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(state.borrow().builds.len(), 1);
}

#[test]
fn build_without_image_id_is_an_error() {
    let state = state();
    let mut service = FakeService::new(&state);
    service.image_id = String::new();
    let mut builder = Builder::new(service);

    let err = builder
        .build(&alias(), &image(), Capacity::default(), &mut |_| {})
        .unwrap_err();

    assert!(matches!(err, Error::RemoteBuild(_)));
}

#[test]
fn split_steps_are_rejected_before_submission() {
    let state = state();
    let mut builder = Builder::new(FakeService::new(&state));

    let mut image = image();
    image.build_steps = vec![
        "curl -sSf https://sh.rustup.rs \\".into(),
        "| sh -s -- -y".into(),
    ];

    let err = builder
        .build(&alias(), &image, Capacity::default(), &mut |_| {})
        .unwrap_err();

    assert!(matches!(err, Error::InvalidSpec { .. }));
    assert!(state.borrow().builds.is_empty());
}

#[test]
fn rebuilding_the_same_spec_is_independent() {
    let state = state();
    let mut builder = Builder::new(FakeService::new(&state));

    let first = builder
        .build(&alias(), &image(), Capacity::default(), &mut |_| {})
        .unwrap();
    let second = builder
        .build(&alias(), &image(), Capacity::default(), &mut |_| {})
        .unwrap();

    assert_eq!(first.alias, second.alias);
    assert_ne!(first.build_id, second.build_id);

    let state = state.borrow();
    assert_eq!(state.builds[0].fingerprint, state.builds[1].fingerprint);
}

#[test]
fn build_env_is_submitted_literally() {
    let state = state();
    let mut builder = Builder::new(FakeService::new(&state));

    let mut image = image();
    image
        .build_env
        .insert("PATH".into(), "/usr/local/cargo/bin:$PATH".into());

    builder
        .build(&alias(), &image, Capacity::default(), &mut |_| {})
        .unwrap();

    assert_eq!(
        state.borrow().builds[0].image.build_env["PATH"],
        "/usr/local/cargo/bin:$PATH"
    );
}

// =============================================================================
// VERIFIER
// =============================================================================

#[test]
fn one_entry_per_check_in_order() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));
    let definition = BuiltinFrontend::new().definition().unwrap();

    let mut streamed = Vec::new();
    let report = verifier
        .verify(
            &definition.alias,
            &definition.verification,
            definition.capacity,
            &mut |outcome| streamed.push(outcome.label.clone()),
        )
        .unwrap();

    let expected = definition
        .verification
        .checks
        .iter()
        .chain(definition.verification.smoke.iter())
        .map(|check| check.label.clone())
        .collect::<Vec<_>>();
    let labels = report
        .entries
        .iter()
        .map(|entry| entry.label.clone())
        .collect::<Vec<_>>();

    assert_eq!(labels, expected);
    assert_eq!(streamed, expected);
    assert!(report.all_passed());
    assert_eq!(report.entries.last().map(|entry| entry.kind), Some(CheckKind::Smoke));
    assert!(report.teardown_error.is_none());
    assert_eq!(state.borrow().kills, 1);
}

#[test]
fn failing_checks_do_not_stop_the_run() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));
    let plan = plan(&[
        "git --version",
        "exit 1",
        "echo ok",
        "exit 2",
        "git status",
        "echo done",
    ]);

    let report = verifier
        .verify(&alias(), &plan, Capacity::default(), &mut |_| {})
        .unwrap();

    assert_eq!(report.entries.len(), 6);
    assert_eq!(report.failures().count(), 2);
    assert_eq!(
        report
            .failures()
            .map(|entry| entry.exit_code)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(!report.all_passed());
    assert_eq!(state.borrow().executed.len(), 6);
    assert_eq!(state.borrow().kills, 1);
}

#[test]
fn path_without_toolchain_fails_only_toolchain_checks() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));
    let mut definition = BuiltinFrontend::new().definition().unwrap();
    definition
        .verification
        .runtime_env
        .insert("PATH".into(), "/usr/sbin:/usr/bin:/sbin:/bin".into());

    let report = verifier
        .verify(
            &definition.alias,
            &definition.verification,
            definition.capacity,
            &mut |_| {},
        )
        .unwrap();

    for entry in report.entries.iter() {
        if entry.label == "git" {
            assert!(entry.passed, "{:?}", entry);
        } else {
            assert!(!entry.passed, "{:?}", entry);
            assert_eq!(entry.exit_code, 127);
            assert!(entry.stderr.contains("not found"));
        }
    }
    assert_eq!(state.borrow().kills, 1);
}

#[test]
fn instance_gets_the_runtime_env() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));
    let plan = plan(&["git --version"]);

    verifier
        .verify(&alias(), &plan, Capacity::default(), &mut |_| {})
        .unwrap();

    let state = state.borrow();
    assert_eq!(state.acquired, vec![(alias(), plan.runtime_env.clone())]);
}

#[test]
fn instance_is_killed_when_exec_fails() {
    let state = state();
    let mut service = FakeService::new(&state);
    service.exec = Rc::new(|command: &str, env: &Map<String, String>| {
        if command == "boom" {
            Err(Error::Remote("connection reset".into()))
        } else {
            shell(command, env)
        }
    });
    let mut verifier = Verifier::new(service);
    let plan = plan(&["git --version", "echo one", "boom", "echo never"]);

    let err = verifier
        .verify(&alias(), &plan, Capacity::default(), &mut |_| {})
        .unwrap_err();

    assert!(err.to_string().contains("connection reset"));
    let state = state.borrow();
    assert_eq!(state.executed.len(), 3);
    assert_eq!(state.kills, 1);
}

#[test]
fn instance_is_killed_when_reporting_panics() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));
    let plan = plan(&["git --version", "echo one"]);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        verifier.verify(&alias(), &plan, Capacity::default(), &mut |_| {
            panic!("terminal went away")
        })
    }));

    assert!(result.is_err());
    assert_eq!(state.borrow().kills, 1);
}

#[test]
fn teardown_failure_keeps_the_report() {
    let state = state();
    let mut service = FakeService::new(&state);
    service.kill_error = Some("no such container".into());
    let mut verifier = Verifier::new(service);
    let plan = plan(&["git --version", "exit 3"]);

    let report = verifier
        .verify(&alias(), &plan, Capacity::default(), &mut |_| {})
        .unwrap();

    assert_eq!(report.entries.len(), 2);
    assert!(report
        .teardown_error
        .as_deref()
        .map(|error| error.contains("no such container"))
        .unwrap_or(false));
    assert_eq!(state.borrow().kills, 1);
}

#[test]
fn acquisition_failure_runs_nothing() {
    let state = state();
    let mut service = FakeService::new(&state);
    service.acquire_error = Some("image not known".into());
    let mut verifier = Verifier::new(service);

    let err = verifier
        .verify(&alias(), &plan(&["git --version"]), Capacity::default(), &mut |_| {})
        .unwrap_err();

    match err {
        Error::InstanceAcquisition { alias, reason } => {
            assert_eq!(alias, "rust-toolchain");
            assert!(reason.contains("image not known"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let state = state.borrow();
    assert!(state.executed.is_empty());
    assert_eq!(state.kills, 0);
}

#[test]
fn invalid_plan_is_rejected_before_acquiring() {
    let state = state();
    let mut verifier = Verifier::new(FakeService::new(&state));

    let err = verifier
        .verify(&alias(), &plan(&["cargo build &&"]), Capacity::default(), &mut |_| {})
        .unwrap_err();

    assert!(matches!(err, Error::InvalidSpec { .. }));
    assert!(state.borrow().acquired.is_empty());
}
