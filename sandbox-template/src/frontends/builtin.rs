use crate::{
    error::Result,
    models::{Alias, Capacity, Check, ImageSpec, TemplateDefinition, VerificationPlan},
    services::TemplateFrontend,
};

const DEFAULT_ALIAS: &str = "rust-toolchain";

const BASE_IMAGE: &str = "docker.io/library/ubuntu:22.04";
const RUSTUP_HOME: &str = "/usr/local/rustup";
const CARGO_HOME: &str = "/usr/local/cargo";

// Spelled out in full: a `$PATH` reference would be baked in literally.
const TOOLCHAIN_PATH: &str =
    "/usr/local/cargo/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const BUILD_STEPS: &[&str] = &[
    "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends build-essential ca-certificates curl git pkg-config libssl-dev && rm -rf /var/lib/apt/lists/*",
    "curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y --no-modify-path --profile minimal --default-toolchain stable",
    "rustup component add clippy rustfmt",
    "chmod -R a+w /usr/local/rustup /usr/local/cargo",
];

const CHECKS: &[(&str, &str)] = &[
    ("rustc", "rustc --version"),
    ("cargo", "cargo --version"),
    ("rustup", "rustup --version"),
    ("clippy", "cargo clippy --version"),
    ("rustfmt", "cargo fmt --version"),
    ("git", "git --version"),
];

const SMOKE_CHECK: (&str, &str) = (
    "hello world",
    "cd /tmp && rm -rf smoke && cargo new --quiet smoke && cd smoke && cargo run --quiet",
);

/// The Rust toolchain template, used when no template file is around.
pub struct BuiltinFrontend;

impl BuiltinFrontend {
    pub fn new() -> BuiltinFrontend {
        BuiltinFrontend
    }
}

fn toolchain_env() -> Vec<(String, String)> {
    vec![
        ("RUSTUP_HOME".into(), RUSTUP_HOME.into()),
        ("CARGO_HOME".into(), CARGO_HOME.into()),
        ("PATH".into(), TOOLCHAIN_PATH.into()),
    ]
}

impl TemplateFrontend for BuiltinFrontend {
    fn definition(&mut self) -> Result<TemplateDefinition> {
        let image = ImageSpec {
            base_image: BASE_IMAGE.into(),
            user: "root".into(),
            build_env: toolchain_env().into_iter().collect(),
            build_steps: BUILD_STEPS.iter().map(|step| step.to_string()).collect(),
        };

        let verification = VerificationPlan {
            runtime_env: toolchain_env().into_iter().collect(),
            checks: CHECKS
                .iter()
                .map(|(label, command)| Check::new(*label, *command))
                .collect(),
            smoke: Some(Check::new(SMOKE_CHECK.0, SMOKE_CHECK.1)),
        };

        Ok(TemplateDefinition {
            alias: Alias(DEFAULT_ALIAS.into()),
            image,
            capacity: Capacity::default(),
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{validate_image_spec, validate_plan};

    #[test]
    fn builtin_template_is_valid() {
        let definition = BuiltinFrontend::new().definition().unwrap();

        validate_image_spec(&definition.image).unwrap();
        validate_plan(&definition.verification).unwrap();
    }

    #[test]
    fn runtime_path_reaches_the_toolchain() {
        let definition = BuiltinFrontend::new().definition().unwrap();
        let path = &definition.verification.runtime_env["PATH"];

        assert!(path.split(':').any(|dir| dir == "/usr/local/cargo/bin"));
        assert!(!path.contains('$'));
        assert_eq!(
            definition.image.build_env["PATH"],
            definition.verification.runtime_env["PATH"]
        );
    }
}
