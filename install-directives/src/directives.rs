//! Post-install and pre-uninstall bookkeeping for a package.
//!
//! Each package gets a base directory under
//! `~/.python_installdirectives/<package>` holding the version recorded by
//! the last successful install, and optionally a data folder that lives
//! exactly as long as the package does.

use anyhow::Context;
use log::{debug, error, info, warn};
use std::{
    collections::BTreeMap as Map,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::{models::PackageInfo, services::InstallDirectives};

const BASE_DIR_NAME: &str = ".python_installdirectives";
const VERSION_FILE: &str = "version";

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error(
        "Install directive \"install\" failed; you may need to manually intervene to remove leftover pieces"
    )]
    InstallFailed(#[source] anyhow::Error),

    #[error(
        "Install directive \"uninstall\" failed; you may need to manually intervene to remove leftover pieces"
    )]
    UninstallFailed(#[source] anyhow::Error),

    #[error("{} does not exist; was install-directives ever run for {package}?", .base_dir.display())]
    NotYetInstalled { package: String, base_dir: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFolder {
    /// `~/.<package>`
    Default,
    Custom(PathBuf),
    Disabled,
}

impl Default for DataFolder {
    fn default() -> Self {
        DataFolder::Default
    }
}

/// Where a package's bookkeeping lives on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub base_dir: PathBuf,
    pub data_folder: Option<PathBuf>,
}

impl Layout {
    pub fn new(home: &Path, package_name: &str, data_folder: &DataFolder) -> Layout {
        let data_folder = match data_folder {
            DataFolder::Default => Some(home.join(format!(".{}", package_name))),
            DataFolder::Custom(path) => Some(path.clone()),
            DataFolder::Disabled => None,
        };

        Layout {
            base_dir: home.join(BASE_DIR_NAME).join(package_name),
            data_folder,
        }
    }

    pub fn version_file(&self) -> PathBuf {
        self.base_dir.join(VERSION_FILE)
    }

    fn recorded_version(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(self.version_file()) {
            Ok(version) => {
                let version = version.trim();
                Ok(if version.is_empty() {
                    None
                } else {
                    Some(version.to_owned())
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Runs a package's directives with the surrounding bookkeeping.
pub struct Dispatcher<D> {
    package: PackageInfo,
    layout: Layout,
    directives: D,
}

impl<D: InstallDirectives> Dispatcher<D> {
    pub fn new(package: PackageInfo, layout: Layout, directives: D) -> Dispatcher<D> {
        Dispatcher {
            package,
            layout,
            directives,
        }
    }

    pub fn package(&self) -> &PackageInfo {
        &self.package
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn install(&mut self) -> Result<(), DirectiveError> {
        info!("Running install directive \"install\"");

        match self.try_install() {
            Ok(()) => {
                info!("Finished install directive \"install\"");
                Ok(())
            }
            Err(err) => {
                error!("{:?}", err);
                if let Err(cleanup) = fs::remove_dir_all(&self.layout.base_dir) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(
                            "could not remove {}: {}",
                            self.layout.base_dir.display(),
                            cleanup
                        );
                    }
                }
                Err(DirectiveError::InstallFailed(err))
            }
        }
    }

    fn try_install(&mut self) -> anyhow::Result<()> {
        let base_dir = &self.layout.base_dir;
        fs::create_dir_all(base_dir)
            .with_context(|| format!("could not create {}", base_dir.display()))?;
        debug!("Folder {} ensured to exist", base_dir.display());

        if let Some(data_folder) = &self.layout.data_folder {
            fs::create_dir_all(data_folder)
                .with_context(|| format!("could not create {}", data_folder.display()))?;
            debug!("Folder {} ensured to exist", data_folder.display());
        }

        let old_version = self.layout.recorded_version()?;
        let new_version = self.package.version.as_str();
        match old_version.as_deref() {
            Some(old_version) if old_version != new_version => {
                debug!("Version change: {} => {}", old_version, new_version);
            }
            _ => debug!("No version change"),
        }

        self.directives
            .install(old_version.as_deref(), new_version)?;

        fs::write(self.layout.version_file(), new_version)
            .context("could not record the installed version")?;

        Ok(())
    }

    pub fn uninstall(&mut self) -> Result<(), DirectiveError> {
        info!("Running install directive \"uninstall\"");

        if !self.layout.base_dir.is_dir() {
            return Err(DirectiveError::NotYetInstalled {
                package: self.package.name.clone(),
                base_dir: self.layout.base_dir.clone(),
            });
        }

        match self.try_uninstall() {
            Ok(()) => {
                info!("Finished install directive \"uninstall\"");
                Ok(())
            }
            Err(err) => {
                error!("{:?}", err);
                Err(DirectiveError::UninstallFailed(err))
            }
        }
    }

    fn try_uninstall(&mut self) -> anyhow::Result<()> {
        self.directives.uninstall(&self.package.version)?;

        if let Some(data_folder) = &self.layout.data_folder {
            match fs::remove_dir_all(data_folder) {
                Ok(()) => debug!("Removed {}", data_folder.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!("Data folder does not exist")
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("could not remove {}", data_folder.display()))
                }
            }
        }

        fs::remove_dir_all(&self.layout.base_dir)
            .with_context(|| format!("could not remove {}", self.layout.base_dir.display()))?;

        Ok(())
    }
}

type Factory = Box<dyn Fn(&PackageInfo) -> anyhow::Result<Box<dyn InstallDirectives>>>;

/// Directives registered by package name.
#[derive(Default)]
pub struct Registry {
    factories: Map<String, Factory>,
}

impl Registry {
    pub fn new() -> Registry {
        Default::default()
    }

    pub fn register<N, F>(&mut self, package_name: N, factory: F) -> &mut Registry
    where
        N: AsRef<str>,
        F: 'static + Fn(&PackageInfo) -> anyhow::Result<Box<dyn InstallDirectives>>,
    {
        let name = crate::models::normalize_package_name(package_name.as_ref());
        self.factories.insert(name, Box::new(factory));
        self
    }

    pub fn contains(&self, package_name: &str) -> bool {
        self.factories
            .contains_key(&crate::models::normalize_package_name(package_name))
    }

    /// `None` when nothing is registered for the package.
    pub fn directives_for(
        &self,
        package: &PackageInfo,
    ) -> Option<anyhow::Result<Box<dyn InstallDirectives>>> {
        self.factories
            .get(&crate::models::normalize_package_name(&package.name))
            .map(|factory| factory(package))
    }
}
