//! Checks run on template definitions before anything is sent to the
//! sandbox service.
//!
//! Build steps and checks are opaque shell strings, so the best we can do is
//! catch commands that are obviously incomplete. The usual culprit is one
//! logical command split over two list entries, which the service would run
//! as two broken commands.

use log::warn;
use std::collections::BTreeSet as Set;

use crate::{
    error::{Error, Result},
    models::{ImageSpec, VerificationPlan},
};

pub fn validate_image_spec(spec: &ImageSpec) -> Result<()> {
    check_word("base image", &spec.base_image)?;
    check_word("execution user", &spec.user)?;

    for (name, value) in spec.build_env.iter() {
        check_env_entry("build env", name, value)?;

        if value.contains('$') {
            warn!(
                "build env {} = {:?} is baked literally, `$` references are not expanded",
                name, value
            );
        }
    }

    if spec.build_steps.is_empty() {
        return Err(Error::invalid("build steps", "no build steps given"));
    }

    for (index, step) in spec.build_steps.iter().enumerate() {
        check_command(step).map_err(|reason| Error::invalid(format!("build step {}", index), reason))?;
    }

    Ok(())
}

pub fn validate_plan(plan: &VerificationPlan) -> Result<()> {
    for (name, value) in plan.runtime_env.iter() {
        check_env_entry("runtime env", name, value)?;
    }

    if plan.checks.is_empty() {
        return Err(Error::invalid("verification checks", "no checks given"));
    }

    let mut labels = Set::new();
    for check in plan.checks.iter().chain(plan.smoke.iter()) {
        if check.label.trim().is_empty() {
            return Err(Error::invalid(
                format!("check {:?}", check.command),
                "label is empty",
            ));
        }

        if !labels.insert(check.label.as_str()) {
            return Err(Error::invalid(
                format!("check {:?}", check.label),
                "label is used more than once",
            ));
        }

        check_command(&check.command)
            .map_err(|reason| Error::invalid(format!("check {:?}", check.label), reason))?;
    }

    Ok(())
}

/// Returns why `command` can't be run on its own, if it can't.
pub fn check_command(command: &str) -> std::result::Result<(), String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err("command is empty".into());
    }

    if trimmed.ends_with('\\') {
        return Err(
            "command ends with a line continuation; join the pieces into one entry".into(),
        );
    }

    for operator in &["&&", "||", "|"] {
        if trimmed.ends_with(operator) || trimmed.starts_with(operator) {
            return Err(format!(
                "command has a dangling `{}`; join the pieces into one entry",
                operator
            ));
        }
    }

    shell_words::split(trimmed).map_err(|_| "command has unbalanced quotes".to_string())?;

    Ok(())
}

fn check_word(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(what, "is empty"));
    }

    if value.chars().any(char::is_whitespace) {
        return Err(Error::invalid(what, format!("{:?} contains whitespace", value)));
    }

    Ok(())
}

fn check_env_entry(what: &str, name: &str, value: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_name = match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };

    if !valid_name {
        return Err(Error::invalid(
            what,
            format!("{:?} is not a valid variable name", name),
        ));
    }

    if value.contains('\n') || value.contains('\0') {
        return Err(Error::invalid(
            what,
            format!("value of {} contains a newline or NUL byte", name),
        ));
    }

    Ok(())
}
