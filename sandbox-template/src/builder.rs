use log::{debug, info};

use crate::{
    error::{Error, Result},
    hasher::fingerprint,
    models::{Alias, BuildRequest, BuildResult, Capacity, ImageSpec},
    services::SandboxService,
    validate::validate_image_spec,
};

pub struct Builder {
    service: Box<dyn SandboxService>,
}

impl Builder {
    pub fn new<S>(service: S) -> Builder
    where
        S: 'static + SandboxService,
    {
        Builder {
            service: Box::new(service),
        }
    }

    /// Submits `image` once and waits for it. There is no retry, building
    /// the same spec again is always safe.
    pub fn build(
        &mut self,
        alias: &Alias,
        image: &ImageSpec,
        capacity: Capacity,
        progress: &mut dyn FnMut(&str),
    ) -> Result<BuildResult> {
        if alias.0.trim().is_empty() {
            return Err(Error::invalid("alias", "is empty"));
        }

        validate_image_spec(image)?;

        let request = BuildRequest {
            alias: alias.clone(),
            image: image.clone(),
            capacity,
            fingerprint: fingerprint(image),
        };
        info!(
            "building {} from {} ({} steps, fingerprint {})",
            alias,
            image.base_image,
            image.build_steps.len(),
            request.fingerprint.0
        );

        let built = self.service.build_template(&request, progress)?;
        debug!("service returned {:?}", built);

        if built.image_id.0.is_empty() {
            return Err(Error::RemoteBuild(
                "the service reported success without an image id".into(),
            ));
        }

        info!("built {} as image {}", alias, built.image_id.0);

        Ok(BuildResult {
            image_id: built.image_id,
            build_id: built.build_id,
            alias: alias.clone(),
        })
    }
}
