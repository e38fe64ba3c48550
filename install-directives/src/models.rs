use std::{collections::BTreeMap as Map, fmt, path::PathBuf, str::FromStr};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

impl ImageName {
    pub fn new<N: Into<String>>(name: N) -> ImageName {
        ImageName(name.into())
    }

    /// The tag an image is built under for a given package version.
    pub fn versioned(&self, version: &str) -> String {
        format!("{}:{}", self.0, version)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageName {
    fn from(name: &str) -> ImageName {
        ImageName(name.into())
    }
}

/// A named image with an optional parent. The context is handed to the
/// build action untouched.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ImageSpec<C> {
    pub name: ImageName,
    pub parent: Option<ImageName>,
    pub context: C,
}

impl<C> ImageSpec<C> {
    pub fn new<N: Into<ImageName>>(name: N, parent: Option<N>, context: C) -> ImageSpec<C> {
        ImageSpec {
            name: name.into(),
            parent: parent.map(Into::into),
            context,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BuildContext {
    pub path: PathBuf,
    /// Relative to `path`.
    pub dockerfile: PathBuf,
    pub target: Option<String>,
    pub build_args: Map<String, String>,
}

impl BuildContext {
    pub fn new<P: Into<PathBuf>>(path: P) -> BuildContext {
        BuildContext {
            path: path.into(),
            dockerfile: PathBuf::from("Dockerfile"),
            target: None,
            build_args: Default::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub summary: String,
    pub home_page: String,
    pub author: String,
    pub author_email: String,
    pub license: String,
    pub location: PathBuf,
    pub requires: Vec<String>,
    pub required_by: Vec<String>,
    pub editable: bool,
}

/// Package names are compared with dashes folded into underscores.
pub fn normalize_package_name(name: &str) -> String {
    name.replace('-', "_")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Install,
    Uninstall,
    Plan,
}

impl Action {
    pub const VARIANTS: &'static [&'static str] = &["install", "uninstall", "plan"];
}

impl FromStr for Action {
    type Err = String;

    fn from_str(value: &str) -> Result<Action, String> {
        match value.to_lowercase().as_str() {
            "install" => Ok(Action::Install),
            "uninstall" => Ok(Action::Uninstall),
            "plan" => Ok(Action::Plan),
            other => Err(format!("unknown action: {:?}", other)),
        }
    }
}
