use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    env,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    directives::DataFolder,
    models::{BuildContext, ImageName, ImageSpec, PackageInfo},
};

pub const HOME_ENV: &str = "INSTALL_DIRECTIVES_HOME";
pub const PYTHON_ENV: &str = "INSTALL_DIRECTIVES_PYTHON";
const DEFAULT_PYTHON: &str = "python3";
const IMAGES_DIR: &str = "docker_images";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectivesFile {
    pub module: Option<String>,

    pub data_folder: Option<DataFolderSetting>,

    pub engine: Option<Engine>,

    #[serde(default)]
    pub external_images: Vec<String>,

    #[serde(default)]
    pub images: Vec<ImageEntry>,

    #[serde(default)]
    pub secrets: Vec<SecretEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataFolderSetting {
    Enabled(bool),
    Path(PathBuf),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Docker,
    Podman,
}

impl Engine {
    pub fn program(self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Docker
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(value: &str) -> Result<Engine, String> {
        match value.to_lowercase().as_str() {
            "docker" => Ok(Engine::Docker),
            "podman" => Ok(Engine::Podman),
            other => Err(format!("unknown container engine: {:?}", other)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageEntry {
    pub name: String,

    pub parent: Option<String>,

    pub context: Option<PathBuf>,

    pub dockerfile: Option<PathBuf>,

    pub target: Option<String>,

    #[serde(default)]
    pub args: MapList,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub error_if_exists: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl Default for MapList {
    fn default() -> Self {
        MapList::List(Vec::new())
    }
}

impl MapList {
    pub fn into_map(self) -> Map<String, String> {
        match self {
            MapList::Map(map) => map,
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        match value.find('=') {
            Some(split_index) => {
                let (key, value) = value.split_at(split_index);
                (key.into(), value[1..].into())
            }
            None => (value, "".into()),
        }
    }
}

impl DirectivesFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DirectivesFile> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("could not open {:?}", path))?;
        let directives = serde_yaml::from_reader(file)
            .with_context(|| format!("could not parse {:?}", path))?;
        info!("loaded directives from {:?}", path);

        Ok(directives)
    }

    pub fn module_name(&self, package: &PackageInfo) -> String {
        self.module
            .clone()
            .unwrap_or_else(|| package.name.clone())
    }

    pub fn data_folder(&self, home: &Path) -> DataFolder {
        match &self.data_folder {
            None | Some(DataFolderSetting::Enabled(true)) => DataFolder::Default,
            Some(DataFolderSetting::Enabled(false)) => DataFolder::Disabled,
            Some(DataFolderSetting::Path(path)) => DataFolder::Custom(expand_home(path, home)),
        }
    }

    pub fn external_images(&self) -> Set<ImageName> {
        self.external_images
            .iter()
            .map(|name| ImageName(name.clone()))
            .collect()
    }

    /// Image specs with contexts resolved against the installed module.
    /// Relative contexts are taken from `<module dir>/docker_images`.
    pub fn image_specs(&self, module_dir: &Path) -> Vec<ImageSpec<BuildContext>> {
        let images_dir = module_dir.join(IMAGES_DIR);

        self.images
            .iter()
            .cloned()
            .map(|entry| {
                let path = match entry.context {
                    Some(context) if context.is_absolute() => context,
                    Some(context) => images_dir.join(context),
                    None => images_dir.join(&entry.name),
                };

                let context = BuildContext {
                    path,
                    dockerfile: entry.dockerfile.unwrap_or_else(|| "Dockerfile".into()),
                    target: entry.target,
                    build_args: entry.args.into_map(),
                };

                ImageSpec {
                    name: ImageName(entry.name),
                    parent: entry.parent.map(ImageName),
                    context,
                }
            })
            .collect()
    }
}

/// Finds the directives file shipped inside an installed module.
pub fn find_directives_file<P: AsRef<Path>>(module_dir: P) -> Option<PathBuf> {
    let module_dir = module_dir.as_ref();

    for file_name in &["install_directives.yaml", "install_directives.yml"] {
        let path = module_dir.join(file_name);
        if path.exists() {
            return Some(path);
        }
    }

    debug!("no directives file in {:?}", module_dir);
    None
}

/// Process-wide settings taken from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub home: PathBuf,
    pub python: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        let home = match env::var_os(HOME_ENV) {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir().ok_or_else(|| anyhow!("Couldn't determine the home directory."))?,
        };

        let python = env::var_os(PYTHON_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PYTHON));

        Ok(Settings { home, python })
    }
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
