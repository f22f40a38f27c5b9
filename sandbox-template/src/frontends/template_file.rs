use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    collections::BTreeMap as Map,
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    models::{Alias, Capacity, Check, ImageSpec, TemplateDefinition, VerificationPlan},
    services::TemplateFrontend,
};

pub const TEMPLATE_FILE_NAMES: &[&str] = &["sandbox-template.yml", "sandbox-template.yaml"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    pub alias: Option<String>,

    pub image: Image,

    #[serde(default)]
    pub capacity: Capacity,

    pub verify: Verify,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Image {
    pub base: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub env: MapList,

    pub steps: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Verify {
    #[serde(default)]
    pub env: MapList,

    pub checks: Vec<Check>,

    pub smoke: Option<Check>,
}

fn default_user() -> String {
    "root".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::List(Vec::new())
    }
}

impl MapList {
    pub fn to_map(self) -> Map<String, String> {
        match self {
            MapList::Map(map) => map,
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        match value.find('=') {
            Some(split_index) => (
                value[..split_index].to_string(),
                value[split_index + 1..].to_string(),
            ),
            None => (value, String::new()),
        }
    }
}

/// Looks for a template file in `path` and each of its parents.
pub fn find_template_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for name in TEMPLATE_FILE_NAMES {
            let template_file_path = path.join(name);
            if template_file_path.exists() {
                return Some(template_file_path);
            }
        }
    }

    None
}

pub struct TemplateFileFrontend {
    path: PathBuf,
}

impl TemplateFileFrontend {
    pub fn new<P: Into<PathBuf>>(path: P) -> TemplateFileFrontend {
        TemplateFileFrontend { path: path.into() }
    }

    fn default_alias(&self) -> Result<String> {
        self.path
            .canonicalize()?
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .map(|name| name.to_lowercase())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "couldn't derive an alias from {:?}, set `alias` in the template file",
                    self.path
                ))
            })
    }
}

impl TemplateFrontend for TemplateFileFrontend {
    fn definition(&mut self) -> Result<TemplateDefinition> {
        let template_file = File::open(&self.path)?;
        let file: TemplateFile = serde_yaml::from_reader(template_file)?;

        let alias = match file.alias {
            Some(alias) => alias,
            None => self.default_alias()?,
        };

        let image = ImageSpec {
            base_image: file.image.base,
            user: file.image.user,
            build_env: file.image.env.to_map(),
            build_steps: file.image.steps,
        };

        let verification = VerificationPlan {
            runtime_env: file.verify.env.to_map(),
            checks: file.verify.checks,
            smoke: file.verify.smoke,
        };

        Ok(TemplateDefinition {
            alias: Alias(alias),
            image,
            capacity: file.capacity,
            verification,
        })
    }
}
