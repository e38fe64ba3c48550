use anyhow::{Context, Result};
use log::{debug, info};
use std::{
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;

use crate::{
    models::{normalize_package_name, PackageInfo},
    services::PackageQuery,
};

const NOT_FOUND_MARKER: &str = "Package(s) not found";
const EDITABLE_VERSION: &str = "0.0.0";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("No such package {0} on your system")]
    PackageNotFound(String),

    #[error("`pip show {name}` failed: {stderr}")]
    PipFailed { name: String, stderr: String },
}

/// Looks packages up through `<python> -m pip`.
pub struct PipQuery {
    python: PathBuf,
}

impl PipQuery {
    pub fn new<P: Into<PathBuf>>(python: P) -> PipQuery {
        PipQuery {
            python: python.into(),
        }
    }

    fn pip(&self) -> Command {
        let mut command = Command::new(&self.python);
        command.args(&["-m", "pip"]);
        command
    }

    /// Whether pip knows of a newer release. This queries the index and is slow.
    /// Editable installs are never outdated.
    pub fn is_outdated(&mut self, package: &PackageInfo) -> Result<bool> {
        if package.editable {
            debug!("{} is installed in editable mode", package.name);
            return Ok(false);
        }

        let output = self
            .pip()
            .args(&["list", "--outdated"])
            .output()
            .with_context(|| format!("could not run {}", self.python.display()))?;

        let name = normalize_package_name(&package.name);
        let outdated = outdated_names(&String::from_utf8_lossy(&output.stdout))
            .any(|candidate| normalize_package_name(candidate) == name);

        Ok(outdated)
    }
}

impl PackageQuery for PipQuery {
    fn package(&mut self, name: &str) -> Result<PackageInfo> {
        debug!("querying pip for {}", name);
        let output = self
            .pip()
            .args(&["show", name, "--no-color"])
            .output()
            .with_context(|| format!("could not run {}", self.python.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if stderr.contains(NOT_FOUND_MARKER) {
                return Err(PackageError::PackageNotFound(name.into()).into());
            }

            return Err(PackageError::PipFailed {
                name: name.into(),
                stderr,
            }
            .into());
        }

        let mut package = parse_pip_show(&String::from_utf8_lossy(&output.stdout));

        if package.editable {
            if let Some(version) = describe_checkout(&package.location) {
                info!("editable install of {} at {}", package.name, version);
                package.version = version;
            }
        }

        Ok(package)
    }
}

/// Parses the `Key: Value` report printed by `pip show`.
pub fn parse_pip_show(report: &str) -> PackageInfo {
    let mut package = PackageInfo::default();

    for line in report.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();

        match key {
            "Name" => package.name = normalize_package_name(value),
            "Version" => package.version = value.into(),
            "Summary" => package.summary = value.into(),
            "Home-page" => package.home_page = value.into(),
            "Author" => package.author = value.into(),
            "Author-email" => package.author_email = value.into(),
            "License" => package.license = value.into(),
            "Location" => package.location = PathBuf::from(value),
            "Requires" => package.requires = split_list(value),
            "Required-by" => package.required_by = split_list(value),
            _ => (),
        }
    }

    package.editable = package.version == EDITABLE_VERSION;
    package
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Package names from the column report of `pip list --outdated`.
fn outdated_names(report: &str) -> impl Iterator<Item = &str> {
    report
        .lines()
        .skip_while(|line| !line.starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
}

/// Version of a source checkout, as `git describe` reports it.
fn describe_checkout(location: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(&["describe", "--tags", "--always"])
        .current_dir(location)
        .output()
        .ok()?;

    if !output.status.success() {
        debug!("git describe failed in {}", location.display());
        return None;
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    let version = version.trim_start_matches('v');
    if version.is_empty() {
        None
    } else {
        Some(version.to_owned())
    }
}
