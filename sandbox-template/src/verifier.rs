use log::{debug, error, info};

use crate::{
    error::{Error, Result},
    models::{
        Alias, Capacity, Check, CheckKind, CheckOutcome, CommandOutput, InstanceId,
        VerificationPlan, VerificationReport,
    },
    services::{SandboxInstance, SandboxService},
    validate::validate_plan,
};

pub struct Verifier {
    service: Box<dyn SandboxService>,
}

impl Verifier {
    pub fn new<S>(service: S) -> Verifier
    where
        S: 'static + SandboxService,
    {
        Verifier {
            service: Box::new(service),
        }
    }

    /// Starts one instance of `alias`, runs every check of `plan` in order
    /// and tears the instance down again.
    ///
    /// Failing checks never stop the run; each one ends up in the report and
    /// is handed to `on_outcome` as soon as it finishes. The instance is
    /// killed exactly once whatever happens. A failed teardown is recorded
    /// in the report unless the checks themselves could not be run, in which
    /// case that error is returned and the teardown failure only logged.
    pub fn verify(
        &mut self,
        alias: &Alias,
        plan: &VerificationPlan,
        capacity: Capacity,
        on_outcome: &mut dyn FnMut(&CheckOutcome),
    ) -> Result<VerificationReport> {
        validate_plan(plan)?;

        let instance = self
            .service
            .acquire_instance(alias, &plan.runtime_env, &capacity)
            .map_err(|err| match err {
                Error::InstanceAcquisition { .. } => err,
                other => Error::InstanceAcquisition {
                    alias: alias.0.clone(),
                    reason: other.to_string(),
                },
            })?;

        let instance_id = instance.id().clone();
        info!("acquired instance {} of {}", instance_id, alias);

        let mut guard = InstanceGuard::new(instance);
        let run = run_checks(&mut guard, plan, on_outcome);
        let teardown = guard.release();

        match (run, teardown) {
            (Ok(entries), teardown) => {
                let teardown_error = teardown.err().map(|err| {
                    error!("{}", err);
                    err.to_string()
                });

                Ok(VerificationReport {
                    alias: alias.clone(),
                    instance: instance_id,
                    entries,
                    teardown_error,
                })
            }
            (Err(err), teardown) => {
                if let Err(teardown_err) = teardown {
                    error!("{}", teardown_err);
                }

                Err(err)
            }
        }
    }
}

fn run_checks(
    instance: &mut InstanceGuard,
    plan: &VerificationPlan,
    on_outcome: &mut dyn FnMut(&CheckOutcome),
) -> Result<Vec<CheckOutcome>> {
    let checks = plan
        .checks
        .iter()
        .map(|check| (check, CheckKind::Command))
        .chain(plan.smoke.iter().map(|check| (check, CheckKind::Smoke)));

    let mut entries = Vec::with_capacity(plan.checks.len() + 1);

    for (check, kind) in checks {
        let output = run_check(instance, check)?;
        let outcome = CheckOutcome::new(check, kind, output);

        if outcome.passed {
            info!("check {:?} passed", outcome.label);
        } else {
            info!(
                "check {:?} failed with exit code {}",
                outcome.label, outcome.exit_code
            );
        }

        on_outcome(&outcome);
        entries.push(outcome);
    }

    Ok(entries)
}

fn run_check(instance: &mut InstanceGuard, check: &Check) -> Result<CommandOutput> {
    debug!("running {:?}: {}", check.label, check.command);

    instance.exec(&check.command).map_err(|err| match err {
        Error::Remote(reason) => Error::Remote(format!("check {:?}: {}", check.label, reason)),
        other => other,
    })
}

/// Owns an instance until it is released, killing it on drop if a panic
/// unwinds past the verifier.
struct InstanceGuard {
    id: InstanceId,
    instance: Option<Box<dyn SandboxInstance>>,
}

impl InstanceGuard {
    fn new(instance: Box<dyn SandboxInstance>) -> InstanceGuard {
        InstanceGuard {
            id: instance.id().clone(),
            instance: Some(instance),
        }
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        match self.instance.as_mut() {
            Some(instance) => instance.exec(command),
            None => Err(Error::Remote(format!(
                "instance {} was already released",
                self.id
            ))),
        }
    }

    fn release(mut self) -> Result<()> {
        match self.instance.take() {
            Some(instance) => kill(instance, &self.id),
            None => Ok(()),
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            if let Err(err) = kill(instance, &self.id) {
                error!("{}", err);
            }
        }
    }
}

fn kill(mut instance: Box<dyn SandboxInstance>, id: &InstanceId) -> Result<()> {
    info!("tearing down instance {}", id);

    instance.kill().map_err(|err| match err {
        Error::Teardown { .. } => err,
        other => Error::Teardown {
            instance: id.0.clone(),
            reason: other.to_string(),
        },
    })
}
