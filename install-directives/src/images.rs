use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{
    hasher::spec_digest,
    models::{BuildContext, BuildPolicy, ImageId, ImageName, ImageSpec},
    order::{self, SweepError},
    services::{ImageBackend, Outcome, SecretPrompt, SweepProgress},
};

pub const LABEL_PACKAGE: &str = "io.install-directives.package";
pub const LABEL_HASH: &str = "io.install-directives.hash";

/// Builds, tags and removes the images belonging to one package version.
pub struct ImageManager<'b> {
    backend: &'b mut dyn ImageBackend,
    package_name: String,
    version: String,
    specs: Vec<ImageSpec<BuildContext>>,
    external: Set<ImageName>,
}

impl<'b> ImageManager<'b> {
    pub fn new<P, V>(
        backend: &'b mut dyn ImageBackend,
        package_name: P,
        version: V,
        specs: Vec<ImageSpec<BuildContext>>,
        external: Set<ImageName>,
    ) -> ImageManager<'b>
    where
        P: Into<String>,
        V: Into<String>,
    {
        ImageManager {
            backend,
            package_name: package_name.into(),
            version: version.into(),
            specs,
            external,
        }
    }

    fn ensure_images(&self) -> Result<()> {
        if self.specs.is_empty() {
            bail!("package {} does not use container images", self.package_name);
        }

        Ok(())
    }

    pub fn build_images(
        &mut self,
        policy: BuildPolicy,
        progress: &mut dyn SweepProgress,
    ) -> Result<Vec<ImageName>> {
        self.ensure_images()?;

        let ImageManager {
            backend,
            package_name,
            version,
            specs,
            external,
        } = self;
        let package_name: &str = package_name;
        let version: &str = version;
        let specs: &[ImageSpec<BuildContext>] = specs;
        let external: &Set<ImageName> = external;

        let planned = order::compute_build_order(specs, external)?
            .into_iter()
            .map(|spec| spec.name.versioned(version))
            .collect::<Vec<_>>();
        progress.planned("Building", &planned)?;

        let mut index = 0;
        let mut ids: Map<ImageName, ImageId> = Map::new();
        let built = order::build_all(specs, external, |spec| {
            let tag = spec.name.versioned(version);
            let parent_id = spec.parent.as_ref().and_then(|parent| ids.get(parent));
            let digest = spec_digest(&(spec, parent_id), version);

            let result = build_image(&mut **backend, package_name, spec, &tag, &digest, policy);
            report(&mut *progress, index, result.as_ref().map(|(outcome, _)| *outcome));
            index += 1;

            let (_, id) = result?;
            ids.insert(spec.name.clone(), id);
            Ok(())
        });

        Ok(built.map_err(with_resume_hint)?)
    }

    pub fn remove_images(&mut self, progress: &mut dyn SweepProgress) -> Result<Vec<ImageName>> {
        self.ensure_images()?;

        let ImageManager {
            backend,
            version,
            specs,
            external,
            ..
        } = self;
        let version: &str = version;
        let specs: &[ImageSpec<BuildContext>] = specs;
        let external: &Set<ImageName> = external;

        let planned = order::compute_removal_order(specs, external)?
            .into_iter()
            .map(|spec| spec.name.versioned(version))
            .collect::<Vec<_>>();
        progress.planned("Removing", &planned)?;

        let mut index = 0;
        let removed = order::remove_all(specs, external, |spec| {
            let tag = spec.name.versioned(version);
            debug!("Removing image {}", tag);

            let outcome = match backend.get_image(&tag) {
                Ok(Some(image)) => backend
                    .remove_image(&image.id, true)
                    .map(|_| Outcome::Done),
                Ok(None) => {
                    warn!("Image {} could not be found; ignoring", tag);
                    Ok(Outcome::Missing)
                }
                Err(err) => Err(err),
            };

            report(&mut *progress, index, outcome.as_ref().map(|outcome| *outcome));
            index += 1;

            outcome.map(|_| ())
        });

        Ok(removed.map_err(with_resume_hint)?)
    }

    pub fn set_secret(
        &mut self,
        name: &str,
        value: Option<&str>,
        error_if_exists: bool,
        prompt: &mut dyn SecretPrompt,
    ) -> Result<()> {
        self.ensure_images()?;

        if self.backend.secret_exists(name)? {
            if error_if_exists {
                bail!("Secret {} already exists", name);
            }

            warn!("Secret {} already exists; ignoring", name);
            return Ok(());
        }

        let value = match value {
            Some(value) => value.to_owned(),
            None => prompt.prompt(name)?,
        };

        self.backend.create_secret(name, &value)?;
        info!("Created secret {}", name);

        Ok(())
    }

    pub fn remove_secret(&mut self, name: &str, error_if_not_exists: bool) -> Result<()> {
        if !self.backend.secret_exists(name)? {
            if error_if_not_exists {
                bail!("Secret {} does not exist", name);
            }

            warn!("Secret {} does not exist; ignoring", name);
            return Ok(());
        }

        self.backend.remove_secret(name)?;
        info!("Removed secret {}", name);

        Ok(())
    }
}

fn build_image(
    backend: &mut dyn ImageBackend,
    package_name: &str,
    spec: &ImageSpec<BuildContext>,
    tag: &str,
    digest: &str,
    policy: BuildPolicy,
) -> Result<(Outcome, ImageId)> {
    if policy == BuildPolicy::IfChanged {
        if let Some(image) = backend.get_image(tag)? {
            if image.labels.get(LABEL_HASH).map(String::as_str) == Some(digest) {
                debug!("Image {} is up to date", tag);
                backend.tag_image(tag, &spec.name.0)?;
                return Ok((Outcome::UpToDate, image.id));
            }
        }
    }

    debug!("Building image {}", tag);
    let labels = [(LABEL_PACKAGE, package_name), (LABEL_HASH, digest)];
    let id = backend.build_image(tag, &spec.context, &labels)?;
    debug!("Built image {} ({})", tag, id.0);

    backend.tag_image(tag, &spec.name.0)?;

    Ok((Outcome::Done, id))
}

/// A broken progress display must not turn a finished step into a failure.
fn report(
    progress: &mut dyn SweepProgress,
    index: usize,
    outcome: Result<Outcome, &anyhow::Error>,
) {
    let marker = outcome.unwrap_or(Outcome::Failed);
    if let Err(err) = progress.finished(index, marker) {
        warn!("could not report progress: {}", err);
    }
}

fn with_resume_hint(err: SweepError) -> anyhow::Error {
    match err {
        SweepError::Order(err) => err.into(),
        err => {
            let pending = err
                .not_completed()
                .iter()
                .map(|name| name.0.clone())
                .collect::<Vec<_>>()
                .join(", ");

            anyhow::Error::new(err).context(format!("images left to handle manually: {}", pending))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::models::Image;
    use crate::order::OrderError;

    /// In-memory engine keyed by tag.
    #[derive(Default)]
    pub struct FakeBackend {
        pub images: Map<String, Image>,
        pub secrets: Map<String, String>,
        pub calls: Vec<String>,
        pub fail_build: Option<String>,
        next_id: usize,
    }

    impl ImageBackend for FakeBackend {
        fn get_image(&mut self, reference: &str) -> Result<Option<Image>> {
            Ok(self.images.get(reference).cloned())
        }

        fn build_image(
            &mut self,
            tag: &str,
            _context: &BuildContext,
            labels: &[(&str, &str)],
        ) -> Result<ImageId> {
            self.calls.push(format!("build {}", tag));
            if self.fail_build.as_deref() == Some(tag) {
                bail!("build of {} failed", tag);
            }

            self.next_id += 1;
            let image = Image {
                id: ImageId(format!("sha256:{}", self.next_id)),
                labels: labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            };
            self.images.insert(tag.into(), image.clone());
            Ok(image.id)
        }

        fn tag_image(&mut self, source: &str, target: &str) -> Result<()> {
            self.calls.push(format!("tag {} {}", source, target));
            let image = self
                .images
                .get(source)
                .cloned()
                .ok_or_else(|| anyhow!("no such image {}", source))?;
            self.images.insert(target.into(), image);
            Ok(())
        }

        fn remove_image(&mut self, id: &ImageId, force: bool) -> Result<()> {
            self.calls.push(format!("remove {} force={}", id.0, force));
            self.images.retain(|_, image| image.id != *id);
            Ok(())
        }

        fn secret_exists(&mut self, name: &str) -> Result<bool> {
            Ok(self.secrets.contains_key(name))
        }

        fn create_secret(&mut self, name: &str, value: &str) -> Result<()> {
            self.secrets.insert(name.into(), value.into());
            Ok(())
        }

        fn remove_secret(&mut self, name: &str) -> Result<()> {
            self.secrets.remove(name);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordedProgress {
        pub planned: Vec<(String, Vec<String>)>,
        pub outcomes: Vec<(usize, Outcome)>,
    }

    impl SweepProgress for RecordedProgress {
        fn planned(&mut self, verb: &str, items: &[String]) -> Result<()> {
            self.planned.push((verb.into(), items.to_vec()));
            Ok(())
        }

        fn finished(&mut self, index: usize, outcome: Outcome) -> Result<()> {
            self.outcomes.push((index, outcome));
            Ok(())
        }
    }

    struct FixedPrompt(&'static str);

    impl SecretPrompt for FixedPrompt {
        fn prompt(&mut self, _name: &str) -> Result<String> {
            Ok(self.0.into())
        }
    }

    fn specs() -> Vec<ImageSpec<BuildContext>> {
        vec![
            ImageSpec::new("worker", Some("base"), BuildContext::new("images/worker")),
            ImageSpec::new("base", Some("python:3.11"), BuildContext::new("images/base")),
        ]
    }

    fn external() -> Set<ImageName> {
        vec![ImageName::from("python:3.11")].into_iter().collect()
    }

    #[test]
    fn builds_parents_first_and_tags_alias() {
        let mut backend = FakeBackend::default();
        let mut progress = RecordedProgress::default();

        let built = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::Always, &mut progress)
            .unwrap();

        assert_eq!(built, vec![ImageName::from("base"), ImageName::from("worker")]);
        assert_eq!(
            backend.calls,
            vec![
                "build base:1.0.0",
                "tag base:1.0.0 base",
                "build worker:1.0.0",
                "tag worker:1.0.0 worker",
            ]
        );
        assert_eq!(
            backend.images["worker:1.0.0"].labels[LABEL_PACKAGE],
            "pkg".to_string()
        );
        assert_eq!(
            progress.planned,
            vec![(
                "Building".to_string(),
                vec!["base:1.0.0".to_string(), "worker:1.0.0".to_string()]
            )]
        );
        assert_eq!(progress.outcomes, vec![(0, Outcome::Done), (1, Outcome::Done)]);
    }

    #[test]
    fn unchanged_images_are_skipped() {
        let mut backend = FakeBackend::default();
        ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::Always, &mut RecordedProgress::default())
            .unwrap();
        backend.calls.clear();

        let mut progress = RecordedProgress::default();
        ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::IfChanged, &mut progress)
            .unwrap();

        assert_eq!(
            backend.calls,
            vec!["tag base:1.0.0 base", "tag worker:1.0.0 worker"]
        );
        assert_eq!(
            progress.outcomes,
            vec![(0, Outcome::UpToDate), (1, Outcome::UpToDate)]
        );
        backend.calls.clear();

        ImageManager::new(&mut backend, "pkg", "1.1.0", specs(), external())
            .build_images(BuildPolicy::IfChanged, &mut RecordedProgress::default())
            .unwrap();
        assert_eq!(backend.calls.len(), 4);
    }

    #[test]
    fn reinstalling_an_older_version_moves_the_alias_back() {
        let mut backend = FakeBackend::default();
        for version in &["1.0.0", "1.1.0", "1.0.0"] {
            ImageManager::new(&mut backend, "pkg", *version, specs(), external())
                .build_images(BuildPolicy::IfChanged, &mut RecordedProgress::default())
                .unwrap();
        }

        assert_eq!(backend.images["worker:1.0.0"].id, ImageId("sha256:2".into()));
        assert_eq!(backend.images["worker"].id, backend.images["worker:1.0.0"].id);
        assert_eq!(backend.images["base"].id, backend.images["base:1.0.0"].id);
        assert_eq!(
            backend
                .calls
                .iter()
                .filter(|call| call.starts_with("build"))
                .count(),
            4
        );
    }

    #[test]
    fn changed_parent_rebuilds_children() {
        let mut backend = FakeBackend::default();
        ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::IfChanged, &mut RecordedProgress::default())
            .unwrap();
        backend.calls.clear();

        let mut changed = specs();
        changed[1].context.target = Some("slim".into());
        let mut progress = RecordedProgress::default();
        ImageManager::new(&mut backend, "pkg", "1.0.0", changed, external())
            .build_images(BuildPolicy::IfChanged, &mut progress)
            .unwrap();

        assert_eq!(
            backend.calls,
            vec![
                "build base:1.0.0",
                "tag base:1.0.0 base",
                "build worker:1.0.0",
                "tag worker:1.0.0 worker",
            ]
        );
        assert_eq!(progress.outcomes, vec![(0, Outcome::Done), (1, Outcome::Done)]);
    }

    struct BrokenProgress;

    impl SweepProgress for BrokenProgress {
        fn planned(&mut self, _verb: &str, _items: &[String]) -> Result<()> {
            Ok(())
        }

        fn finished(&mut self, _index: usize, _outcome: Outcome) -> Result<()> {
            bail!("terminal went away")
        }
    }

    #[test]
    fn progress_failures_do_not_fail_the_sweep() {
        let mut backend = FakeBackend::default();

        let built = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::Always, &mut BrokenProgress)
            .unwrap();
        assert_eq!(built, vec![ImageName::from("base"), ImageName::from("worker")]);

        let removed = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .remove_images(&mut BrokenProgress)
            .unwrap();
        assert_eq!(removed, vec![ImageName::from("worker"), ImageName::from("base")]);
        assert!(backend.images.is_empty());
    }

    #[test]
    fn failed_build_names_remaining_images() {
        let mut backend = FakeBackend {
            fail_build: Some("base:1.0.0".into()),
            ..Default::default()
        };
        let mut progress = RecordedProgress::default();

        let err = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::Always, &mut progress)
            .unwrap_err();

        assert_eq!(err.to_string(), "images left to handle manually: base, worker");
        let sweep = err.downcast_ref::<SweepError>().unwrap();
        assert_eq!(
            sweep.not_completed(),
            vec![ImageName::from("base"), ImageName::from("worker")]
        );
        assert_eq!(backend.calls, vec!["build base:1.0.0"]);
        assert_eq!(progress.outcomes, vec![(0, Outcome::Failed)]);
    }

    #[test]
    fn configuration_errors_surface_before_any_build() {
        let mut backend = FakeBackend::default();

        let err = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), Set::new())
            .build_images(BuildPolicy::Always, &mut RecordedProgress::default())
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<OrderError>(),
            Some(OrderError::UnknownDependency { .. })
        ));
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn removal_ignores_missing_images() {
        let mut backend = FakeBackend::default();
        ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .build_images(BuildPolicy::Always, &mut RecordedProgress::default())
            .unwrap();
        backend.images.remove("worker:1.0.0");
        backend.images.remove("worker");
        backend.calls.clear();

        let mut progress = RecordedProgress::default();
        let removed = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external())
            .remove_images(&mut progress)
            .unwrap();

        assert_eq!(removed, vec![ImageName::from("worker"), ImageName::from("base")]);
        assert_eq!(backend.calls, vec!["remove sha256:1 force=true"]);
        assert!(backend.images.is_empty());
        assert_eq!(
            progress.outcomes,
            vec![(0, Outcome::Missing), (1, Outcome::Done)]
        );
    }

    #[test]
    fn packages_without_images_are_rejected() {
        let mut backend = FakeBackend::default();
        let mut manager = ImageManager::new(&mut backend, "pkg", "1.0.0", Vec::new(), Set::new());

        let err = manager
            .build_images(BuildPolicy::Always, &mut RecordedProgress::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "package pkg does not use container images");
        assert!(manager.remove_images(&mut RecordedProgress::default()).is_err());
    }

    #[test]
    fn secrets_are_prompted_and_guarded() {
        let mut backend = FakeBackend::default();
        let mut manager = ImageManager::new(&mut backend, "pkg", "1.0.0", specs(), external());
        let mut prompt = FixedPrompt("hunter2");

        manager.set_secret("db", None, true, &mut prompt).unwrap();
        manager.set_secret("token", Some("abc"), true, &mut prompt).unwrap();
        assert!(manager.set_secret("db", None, true, &mut prompt).is_err());
        manager.set_secret("db", Some("other"), false, &mut prompt).unwrap();

        manager.remove_secret("token", true).unwrap();
        assert!(manager.remove_secret("token", true).is_err());
        manager.remove_secret("token", false).unwrap();

        assert_eq!(backend.secrets.len(), 1);
        assert_eq!(backend.secrets["db"], "hunter2");
    }
}
