use blake3;
use std::hash::{Hash, Hasher};

use crate::models::{Fingerprint, ImageSpec};

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct Blake3Writer<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for Blake3Writer<'a> {
            fn finish(&self) -> u64 {
                unreachable!("blake3 digests are read through finalize")
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut Blake3Writer(self))
    }
}

/// Content digest of an image spec. Stable across runs, changes with any
/// field of the image spec.
pub fn fingerprint(spec: &ImageSpec) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.input(spec);
    Fingerprint(hasher.finalize().to_hex().to_string())
}

/// Short identifier for one build attempt. Two builds of the same spec get
/// different ids.
pub fn build_id(fingerprint: &Fingerprint, started_at_nanos: u128) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(fingerprint.0.as_bytes());
    hasher.update(&started_at_nanos.to_le_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ImageSpec {
        ImageSpec {
            base_image: "ubuntu:22.04".into(),
            user: "root".into(),
            build_env: vec![("CARGO_HOME".to_string(), "/usr/local/cargo".to_string())]
                .into_iter()
                .collect(),
            build_steps: vec!["apt-get update".into()],
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(&spec()), fingerprint(&spec()));
    }

    #[test]
    fn fingerprint_follows_step_order() {
        let mut a = spec();
        a.build_steps.push("true".into());
        let mut b = spec();
        b.build_steps.insert(0, "true".into());

        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&spec()));
    }

    #[test]
    fn build_ids_differ_per_attempt() {
        let fingerprint = fingerprint(&spec());
        let first = build_id(&fingerprint, 1);
        let second = build_id(&fingerprint, 2);

        assert_eq!(first.len(), 16);
        assert_ne!(first, second);
    }
}
