mod podman;

pub use podman::{render_containerfile, PodmanService};
