use blake3;
use log::{debug, info, warn};
use std::{
    collections::{BTreeMap as Map, VecDeque},
    fs::{self, File},
    io::{BufRead, BufReader},
    process::{Command, Output, Stdio},
    time::{SystemTime, UNIX_EPOCH},
};
use tempfile::TempDir;

use crate::{
    config::Credential,
    error::{Error, Result},
    hasher,
    models::{
        Alias, BuildId, BuildRequest, BuiltImage, Capacity, CommandOutput, Fingerprint, ImageId,
        ImageSpec, InstanceId,
    },
    services::{SandboxInstance, SandboxService},
};

const LABEL_FINGERPRINT: &str = "io.sandbox.template.fingerprint";
const LABEL_ALIAS: &str = "io.sandbox.template.alias";

/// Lines of build output kept for the error message of a failed build.
const DIAGNOSTIC_LINES: usize = 20;

/// `podman exec` uses this exit code for its own failures, as opposed to
/// the command it runs.
const PODMAN_ERROR_EXIT: i32 = 125;

#[derive(Clone, Debug)]
struct Podman {
    program: String,
    base_args: Vec<String>,
}

impl Podman {
    fn new(url: Option<String>) -> Podman {
        Podman {
            program: "podman".into(),
            base_args: url
                .map(|url| vec!["--url".to_string(), url])
                .unwrap_or_default(),
        }
    }

    fn command(&self, args: &[String], credential: Option<&Credential>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);

        let (subcommand, rest) = match args.split_first() {
            Some((subcommand, rest)) => (Some(subcommand), rest),
            None => (None, args),
        };
        command.args(subcommand);

        if let Some(credential) = credential {
            command.arg("--creds").arg(credential.expose());
        }

        command.args(rest);

        debug!(
            "podman {}{}",
            args.join(" "),
            credential
                .map(|credential| format!(" --creds {}:***", credential.user()))
                .unwrap_or_default()
        );

        command
    }
}

/// Builds and runs sandbox images through the podman CLI, either locally or
/// against a remote podman service when a connection url is given.
pub struct PodmanService {
    podman: Podman,
    credential: Credential,
}

impl PodmanService {
    pub fn connect(url: Option<String>, credential: Credential) -> Result<PodmanService> {
        let podman = Podman::new(url);

        let output = podman
            .command(
                &[
                    "version".to_string(),
                    "--format".to_string(),
                    "{{.Client.Version}}".to_string(),
                ],
                None,
            )
            .output()
            .map_err(|err| Error::Configuration(format!("couldn't run podman: {}", err)))?;

        if !output.status.success() {
            return Err(Error::Configuration(format!(
                "podman is not usable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(
            "using podman {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );

        Ok(PodmanService { podman, credential })
    }
}

impl SandboxService for PodmanService {
    fn build_template(
        &mut self,
        request: &BuildRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<BuiltImage> {
        let started_at = now_nanos();
        let temp_dir = TempDir::new()?;

        let containerfile_path = temp_dir.path().join("Containerfile");
        fs::write(
            &containerfile_path,
            render_containerfile(&request.alias, &request.image, &request.fingerprint)?,
        )?;

        let iidfile_path = temp_dir.path().join("image-id");
        let stderr_path = temp_dir.path().join("build.log");
        let stderr = File::create(&stderr_path)?;

        let args = vec![
            "build".to_string(),
            "--tag".into(),
            request.alias.0.clone(),
            "--file".into(),
            path_arg(&containerfile_path)?,
            "--iidfile".into(),
            path_arg(&iidfile_path)?,
            "--cpu-period".into(),
            "100000".into(),
            "--cpu-quota".into(),
            (u64::from(request.capacity.cpus) * 100_000).to_string(),
            "--memory".into(),
            format!("{}m", request.capacity.memory_mb),
            path_arg(temp_dir.path())?,
        ];

        let mut child = self
            .podman
            .command(&args, Some(&self.credential))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| Error::RemoteBuild(format!("couldn't run podman build: {}", err)))?;

        let mut tail = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut read_error = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();

            // Build output is not always utf-8, so lines are decoded lossily.
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(&['\r', '\n'][..]);
                        progress(line);

                        if tail.len() == DIAGNOSTIC_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                    Err(err) => {
                        read_error = Some(err);
                        break;
                    }
                }
            }
        }

        let status = child.wait()?;
        if let Some(err) = read_error {
            return Err(Error::RemoteBuild(format!(
                "couldn't read podman build output: {}",
                err
            )));
        }

        if !status.success() {
            let log = fs::read_to_string(&stderr_path).unwrap_or_default();
            let diagnostic = last_lines(&log, DIAGNOSTIC_LINES)
                .unwrap_or_else(|| tail.into_iter().collect::<Vec<_>>().join("\n"));

            return Err(Error::RemoteBuild(if diagnostic.is_empty() {
                format!("podman build exited with {}", status)
            } else {
                diagnostic
            }));
        }

        let image_id = fs::read_to_string(&iidfile_path)?.trim().to_string();
        temp_dir.close()?;

        Ok(BuiltImage {
            image_id: ImageId(image_id),
            build_id: BuildId(hasher::build_id(&request.fingerprint, started_at)),
        })
    }

    fn acquire_instance(
        &mut self,
        alias: &Alias,
        runtime_env: &Map<String, String>,
        capacity: &Capacity,
    ) -> Result<Box<dyn SandboxInstance>> {
        let name = instance_name(alias, now_nanos());

        let mut args = vec![
            "run".to_string(),
            "--detach".into(),
            "--name".into(),
            name.clone(),
            "--label".into(),
            format!("{}={}", LABEL_ALIAS, alias.0),
            "--cpus".into(),
            capacity.cpus.to_string(),
            "--memory".into(),
            format!("{}m", capacity.memory_mb),
        ];

        for (key, value) in runtime_env.iter() {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        args.extend(vec![alias.0.clone(), "sleep".into(), "infinity".into()]);

        let output = self
            .podman
            .command(&args, Some(&self.credential))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Error::InstanceAcquisition {
                alias: alias.0.clone(),
                reason: format!("couldn't run podman run: {}", err),
            })?;

        if !output.status.success() {
            return Err(Error::InstanceAcquisition {
                alias: alias.0.clone(),
                reason: stderr_reason(&output),
            });
        }

        Ok(Box::new(PodmanInstance {
            podman: self.podman.clone(),
            id: InstanceId(name),
        }))
    }
}

struct PodmanInstance {
    podman: Podman,
    id: InstanceId,
}

impl SandboxInstance for PodmanInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let args = vec![
            "exec".to_string(),
            self.id.0.clone(),
            "/bin/sh".into(),
            "-c".into(),
            command.into(),
        ];

        let output = self
            .podman
            .command(&args, None)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Error::Remote(format!("couldn't run podman exec: {}", err)))?;

        let exit_code = match output.status.code() {
            Some(PODMAN_ERROR_EXIT) if podman_failed(&output) => {
                return Err(Error::Remote(stderr_reason(&output)));
            }
            Some(code) => code,
            None => return Err(Error::Remote(stderr_reason(&output))),
        };

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn kill(&mut self) -> Result<()> {
        let args = vec![
            "rm".to_string(),
            "--force".into(),
            "--time".into(),
            "0".into(),
            self.id.0.clone(),
        ];

        let output = self.podman.command(&args, None).stdin(Stdio::null()).output()?;

        if !output.status.success() {
            return Err(Error::Teardown {
                instance: self.id.0.clone(),
                reason: stderr_reason(&output),
            });
        }

        Ok(())
    }
}

/// Turns an image spec into a Containerfile.
///
/// Environment values are escaped so the builder bakes them in verbatim, and
/// every step gets its own exec-form `RUN` so it reaches the shell as one
/// command.
pub fn render_containerfile(
    alias: &Alias,
    spec: &ImageSpec,
    fingerprint: &Fingerprint,
) -> Result<String> {
    let mut containerfile = String::new();

    containerfile.push_str(&format!("FROM {}\n", spec.base_image));
    containerfile.push_str(&format!(
        "LABEL {}={} {}={}\n",
        LABEL_ALIAS,
        quote(&alias.0),
        LABEL_FINGERPRINT,
        quote(&fingerprint.0)
    ));

    for (key, value) in spec.build_env.iter() {
        containerfile.push_str(&format!("ENV {}={}\n", key, quote(value)));
    }

    containerfile.push_str(&format!("USER {}\n", spec.user));

    for step in spec.build_steps.iter() {
        let exec_form = serde_json::to_string(&["/bin/sh", "-c", step.as_str()])?;
        containerfile.push_str(&format!("RUN {}\n", exec_form));
    }

    Ok(containerfile)
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' || c == '$' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn instance_name(alias: &Alias, nanos: u128) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(alias.0.as_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("sandbox-{}", &hex[..12])
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or_default()
}

fn path_arg(path: &std::path::Path) -> Result<String> {
    path.to_str()
        .map(String::from)
        .ok_or_else(|| Error::Configuration(format!("{:?} is not valid utf-8", path)))
}

fn last_lines(text: &str, count: usize) -> Option<String> {
    let lines = text.lines().filter(|line| !line.trim().is_empty()).collect::<Vec<_>>();
    if lines.is_empty() {
        return None;
    }

    let start = lines.len().saturating_sub(count);
    Some(lines[start..].join("\n"))
}

/// Whether podman itself failed rather than the command it ran. Podman
/// reports its own errors on stderr prefixed with `Error:`.
fn podman_failed(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr)
        .trim_start()
        .starts_with("Error:")
}

fn stderr_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();

    if stderr.is_empty() {
        warn!("podman exited with {} and no output", output.status);
        format!("podman exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}
