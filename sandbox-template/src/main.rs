use anyhow::{anyhow, Result};
use log::{info, warn};
use std::{
    env,
    io::stdout,
    path::{Path, PathBuf},
};
use structopt::StructOpt;

use sandbox_template::{
    backends::{render_containerfile, PodmanService},
    config::Credential,
    console::Console,
    frontends::{find_template_file, BuiltinFrontend, TemplateFileFrontend},
    hasher::fingerprint,
    models::{Alias, TemplateDefinition, VerifyPolicy},
    validate::validate_image_spec,
    Builder, TemplateFrontend, Verifier,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sandbox-template",
    about = "Builds and verifies sandbox images preloaded with a Rust toolchain."
)]
struct Opt {
    #[structopt(short, long, global = true, parse(from_os_str))]
    /// Template file to use instead of searching for sandbox-template.yml.
    file: Option<PathBuf>,

    #[structopt(long, global = true)]
    /// Podman service url. The local podman is used when unset.
    url: Option<String>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Builds the template image and registers it under its alias.
    Build {
        #[structopt(long)]
        alias: Option<String>,

        #[structopt(long)]
        cpus: Option<u32>,

        #[structopt(long)]
        memory_mb: Option<u64>,
    },
    /// Starts an instance of a built image and runs the template's checks.
    Verify {
        #[structopt(long)]
        alias: Option<String>,

        #[structopt(long)]
        /// Exit nonzero when any check fails.
        strict: bool,
    },
    /// Prints the Containerfile for the template without building anything.
    Render,
}

fn load_definition(file: Option<&Path>) -> Result<TemplateDefinition> {
    let template_file_path = match file {
        Some(path) => Some(path.to_path_buf()),
        None => find_template_file(env::current_dir()?),
    };

    let definition = match template_file_path {
        Some(path) => {
            info!("found template file {:?}", path);
            TemplateFileFrontend::new(path).definition()?
        }
        None => {
            info!("no template file found, using the built-in rust toolchain template");
            BuiltinFrontend::new().definition()?
        }
    };

    Ok(definition)
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let mut console = Console::new(stdout());
    let mut definition = load_definition(opt.file.as_deref())?;
    info!("template alias {:?}", definition.alias.0);

    match opt.command {
        Command::Render => {
            validate_image_spec(&definition.image)?;

            let containerfile = render_containerfile(
                &definition.alias,
                &definition.image,
                &fingerprint(&definition.image),
            )?;
            print!("{}", containerfile);
        }
        Command::Build {
            alias,
            cpus,
            memory_mb,
        } => {
            if let Some(alias) = alias {
                definition.alias = Alias(alias);
            }
            if let Some(cpus) = cpus {
                definition.capacity.cpus = cpus;
            }
            if let Some(memory_mb) = memory_mb {
                definition.capacity.memory_mb = memory_mb;
            }

            let credential = Credential::from_env()?;
            let service = PodmanService::connect(opt.url, credential)?;
            info!("connected to podman");

            let mut builder = Builder::new(service);
            let result = builder.build(
                &definition.alias,
                &definition.image,
                definition.capacity,
                &mut |line| {
                    if let Err(err) = console.progress(line) {
                        warn!("couldn't print build output: {}", err);
                    }
                },
            )?;

            console.built(&result)?;
        }
        Command::Verify { alias, strict } => {
            if let Some(alias) = alias {
                definition.alias = Alias(alias);
            }

            let policy = if strict {
                VerifyPolicy::Strict
            } else {
                VerifyPolicy::Lenient
            };

            let credential = Credential::from_env()?;
            let service = PodmanService::connect(opt.url, credential)?;
            info!("connected to podman");

            console.info(&format!("verifying {}", definition.alias))?;

            let mut verifier = Verifier::new(service);
            let report = verifier.verify(
                &definition.alias,
                &definition.verification,
                definition.capacity,
                &mut |outcome| {
                    if let Err(err) = console.outcome(outcome) {
                        warn!("couldn't print check outcome: {}", err);
                    }
                },
            )?;

            console.summary(&report)?;

            if let Some(message) = report.exit_error(policy) {
                return Err(anyhow!(message));
            }

            if !report.all_passed() {
                info!("some checks failed, rerun with --strict to fail on them");
            }
        }
    }

    Ok(())
}
