use anyhow::{anyhow, bail, Context, Result};
use ignore::WalkBuilder;
use log::debug;
use number_prefix::NumberPrefix;
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};
use tar::Builder as TarBuilder;
use tempfile::TempDir;

use crate::{
    config::Engine,
    models::{BuildContext, Image, ImageId},
    services::ImageBackend,
};

/// Lower-cased fragments of the messages docker and podman print when an
/// image or secret does not exist.
const MISSING_MARKERS: &[&str] = &["no such image", "image not known", "no such secret", "not found"];

/// Drives a docker compatible command line client.
pub struct CliBackend {
    program: PathBuf,
}

#[derive(Debug, Deserialize)]
struct InspectedImage {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Config", default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectedConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<Map<String, String>>,
}

impl CliBackend {
    pub fn new<P: Into<PathBuf>>(program: P) -> CliBackend {
        CliBackend {
            program: program.into(),
        }
    }

    pub fn for_engine(engine: Engine) -> CliBackend {
        CliBackend::new(engine.program())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("running {} {}", self.program.display(), args.join(" "));
        Command::new(&self.program)
            .args(args)
            .output()
            .with_context(|| format!("could not run {}", self.program.display()))
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        expect_success(&output, &args.join(" "))?;
        Ok(output)
    }
}

fn expect_success(output: &Output, what: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    bail!(
        "`{}` failed: {}",
        what,
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr).to_lowercase();
    MISSING_MARKERS.iter().any(|marker| stderr.contains(marker))
}

fn parse_inspect(json: &[u8]) -> Result<Option<Image>> {
    let images: Vec<InspectedImage> = serde_json::from_slice(json)?;

    Ok(images.into_iter().next().map(|image| Image {
        id: ImageId(image.id),
        labels: image
            .config
            .and_then(|config| config.labels)
            .unwrap_or_else(Default::default),
    }))
}

/// Writes the build context to a tar archive, leaving out whatever
/// `.dockerignore` excludes. Returns the number of file bytes archived.
fn archive_context(context_dir: &Path, archive_path: &Path) -> Result<u64> {
    let archive = {
        let mut options = OpenOptions::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.write(true).create(true).open(archive_path)?
    };

    let mut tar = TarBuilder::new(archive);
    let walk = WalkBuilder::new(context_dir)
        .add_custom_ignore_filename(".dockerignore")
        .ignore(false)
        .git_global(false)
        .git_ignore(false)
        .git_exclude(false)
        .hidden(false)
        .parents(false)
        .build();

    let mut context_size = 0;
    for result in walk {
        let entry = result?;
        let relative = entry.path().strip_prefix(context_dir)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        tar.append_path_with_name(entry.path(), relative)?;

        let metadata = entry.metadata()?;
        if metadata.is_file() {
            context_size += metadata.len();
        }
    }

    tar.finish()?;

    Ok(context_size)
}

impl ImageBackend for CliBackend {
    fn get_image(&mut self, reference: &str) -> Result<Option<Image>> {
        let output = self.run(&["image", "inspect", reference])?;

        if !output.status.success() {
            if is_missing(&output.stderr) {
                return Ok(None);
            }
            expect_success(&output, "image inspect")?;
        }

        parse_inspect(&output.stdout)
    }

    fn build_image(
        &mut self,
        tag: &str,
        context: &BuildContext,
        labels: &[(&str, &str)],
    ) -> Result<ImageId> {
        if !context.path.is_dir() {
            bail!("build context {:?} is not a directory", context.path);
        }

        let temp_dir = TempDir::new()?;
        let archive_path = temp_dir.path().join("context.tar");
        let iid_path = temp_dir.path().join("iid");

        let context_size = archive_context(&context.path, &archive_path)?;
        match NumberPrefix::binary(context_size as f32) {
            NumberPrefix::Standalone(bytes) => {
                debug!("Archived build context for {} ({} bytes)", tag, bytes)
            }
            NumberPrefix::Prefixed(prefix, n) => {
                debug!("Archived build context for {} ({:.1} {}B)", tag, n, prefix)
            }
        };

        let dockerfile = context
            .dockerfile
            .to_str()
            .ok_or_else(|| anyhow!("the dockerfile path is not valid utf-8"))?;
        let iid_file = iid_path
            .to_str()
            .ok_or_else(|| anyhow!("the temporary directory path is not valid utf-8"))?;

        let mut args = vec![
            "build".to_owned(),
            "--rm".to_owned(),
            "--file".to_owned(),
            dockerfile.to_owned(),
            "--tag".to_owned(),
            tag.to_owned(),
            "--iidfile".to_owned(),
            iid_file.to_owned(),
        ];
        if let Some(target) = &context.target {
            args.push("--target".into());
            args.push(target.clone());
        }
        for (key, value) in context.build_args.iter() {
            args.push("--build-arg".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push("-".into());

        debug!("running {} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::from(File::open(&archive_path)?))
            .output()
            .with_context(|| format!("could not run {}", self.program.display()))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("{}", line);
        }
        expect_success(&output, &format!("build {}", tag))?;

        let image_id = fs::read_to_string(&iid_path)
            .context("the engine did not report an image id")?
            .trim()
            .to_owned();

        temp_dir.close()?;

        Ok(ImageId(image_id))
    }

    fn tag_image(&mut self, source: &str, target: &str) -> Result<()> {
        self.run_checked(&["tag", source, target])?;
        Ok(())
    }

    fn remove_image(&mut self, id: &ImageId, force: bool) -> Result<()> {
        if force {
            self.run_checked(&["image", "rm", "--force", &id.0])?;
        } else {
            self.run_checked(&["image", "rm", &id.0])?;
        }
        Ok(())
    }

    fn secret_exists(&mut self, name: &str) -> Result<bool> {
        let output = self.run(&["secret", "inspect", name])?;

        if output.status.success() {
            return Ok(true);
        }
        if is_missing(&output.stderr) {
            return Ok(false);
        }

        expect_success(&output, "secret inspect")?;
        Ok(false)
    }

    fn create_secret(&mut self, name: &str, value: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&["secret", "create", name, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not run {}", self.program.display()))?;

        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("could not open stdin of {}", self.program.display()))?
            .write_all(value.as_bytes())?;

        let output = child.wait_with_output()?;
        expect_success(&output, "secret create")
    }

    fn remove_secret(&mut self, name: &str) -> Result<()> {
        self.run_checked(&["secret", "rm", name])?;
        Ok(())
    }
}
