use anyhow::Result;
use log::debug;

use crate::models::{BuildContext, Image, ImageId, PackageInfo};

/// Hooks run around a package's install and uninstall.
pub trait InstallDirectives {
    /// `old_version` is the version recorded by the previous install, if any.
    fn install(&mut self, old_version: Option<&str>, new_version: &str) -> Result<()> {
        let _ = (old_version, new_version);
        debug!("No install directive \"install\"");
        Ok(())
    }

    fn uninstall(&mut self, version: &str) -> Result<()> {
        let _ = version;
        debug!("No install directive \"uninstall\"");
        Ok(())
    }
}

impl<D: InstallDirectives + ?Sized> InstallDirectives for Box<D> {
    fn install(&mut self, old_version: Option<&str>, new_version: &str) -> Result<()> {
        (**self).install(old_version, new_version)
    }

    fn uninstall(&mut self, version: &str) -> Result<()> {
        (**self).uninstall(version)
    }
}

/// Directives that do nothing beyond the bookkeeping of the dispatcher.
pub struct NoDirectives;

impl InstallDirectives for NoDirectives {}

pub trait PackageQuery {
    fn package(&mut self, name: &str) -> Result<PackageInfo>;
}

pub trait ImageBackend {
    fn get_image(&mut self, reference: &str) -> Result<Option<Image>>;

    fn build_image(
        &mut self,
        tag: &str,
        context: &BuildContext,
        labels: &[(&str, &str)],
    ) -> Result<ImageId>;

    fn tag_image(&mut self, source: &str, target: &str) -> Result<()>;

    fn remove_image(&mut self, id: &ImageId, force: bool) -> Result<()>;

    fn secret_exists(&mut self, name: &str) -> Result<bool>;

    fn create_secret(&mut self, name: &str, value: &str) -> Result<()>;

    fn remove_secret(&mut self, name: &str) -> Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    UpToDate,
    Missing,
    Failed,
}

/// Receives the planned sweep and the outcome of every step in it.
pub trait SweepProgress {
    fn planned(&mut self, verb: &str, items: &[String]) -> Result<()>;

    fn finished(&mut self, index: usize, outcome: Outcome) -> Result<()>;
}

pub struct Silent;

impl SweepProgress for Silent {
    fn planned(&mut self, _verb: &str, _items: &[String]) -> Result<()> {
        Ok(())
    }

    fn finished(&mut self, _index: usize, _outcome: Outcome) -> Result<()> {
        Ok(())
    }
}

/// Source of secret values that were not supplied up front.
pub trait SecretPrompt {
    fn prompt(&mut self, name: &str) -> Result<String>;
}
