use anyhow::Result;
use log::{debug, info};
use std::collections::BTreeSet as Set;

use crate::{
    config::SecretEntry,
    images::ImageManager,
    models::{BuildContext, BuildPolicy, ImageName, ImageSpec},
    services::{ImageBackend, InstallDirectives, SecretPrompt, SweepProgress},
};

/// Directives described by a package's directives file: secrets are
/// created and images built on install, and both are removed again on
/// uninstall.
pub struct ConfiguredDirectives {
    pub package_name: String,
    pub specs: Vec<ImageSpec<BuildContext>>,
    pub external: Set<ImageName>,
    pub secrets: Vec<SecretEntry>,
    pub policy: BuildPolicy,
    pub backend: Box<dyn ImageBackend>,
    pub progress: Box<dyn SweepProgress>,
    pub prompt: Box<dyn SecretPrompt>,
}

impl InstallDirectives for ConfiguredDirectives {
    fn install(&mut self, old_version: Option<&str>, new_version: &str) -> Result<()> {
        let ConfiguredDirectives {
            package_name,
            specs,
            external,
            secrets,
            policy,
            backend,
            progress,
            prompt,
        } = self;

        if specs.is_empty() {
            debug!("{} declares no images", package_name);
            return Ok(());
        }

        match old_version {
            Some(old_version) if old_version != new_version => info!(
                "Images of {} {} are left in place next to {}",
                package_name, old_version, new_version
            ),
            _ => (),
        }

        let mut images = ImageManager::new(
            &mut **backend,
            package_name.clone(),
            new_version,
            specs.clone(),
            external.clone(),
        );

        for secret in secrets.iter() {
            images.set_secret(&secret.name, None, secret.error_if_exists, &mut **prompt)?;
        }
        images.build_images(*policy, &mut **progress)?;

        Ok(())
    }

    fn uninstall(&mut self, version: &str) -> Result<()> {
        let ConfiguredDirectives {
            package_name,
            specs,
            external,
            secrets,
            backend,
            progress,
            ..
        } = self;

        if specs.is_empty() {
            debug!("{} declares no images", package_name);
            return Ok(());
        }

        let mut images = ImageManager::new(
            &mut **backend,
            package_name.clone(),
            version,
            specs.clone(),
            external.clone(),
        );

        images.remove_images(&mut **progress)?;
        for secret in secrets.iter() {
            images.remove_secret(&secret.name, false)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        images::tests::{FakeBackend, RecordedProgress},
        services::Silent,
    };
    use std::{cell::RefCell, rc::Rc};

    /// Lets a test keep looking at the fake engine after handing it over.
    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<FakeBackend>>);

    impl ImageBackend for Shared {
        fn get_image(&mut self, reference: &str) -> Result<Option<crate::models::Image>> {
            self.0.borrow_mut().get_image(reference)
        }

        fn build_image(
            &mut self,
            tag: &str,
            context: &BuildContext,
            labels: &[(&str, &str)],
        ) -> Result<crate::models::ImageId> {
            self.0.borrow_mut().build_image(tag, context, labels)
        }

        fn tag_image(&mut self, source: &str, target: &str) -> Result<()> {
            self.0.borrow_mut().tag_image(source, target)
        }

        fn remove_image(&mut self, id: &crate::models::ImageId, force: bool) -> Result<()> {
            self.0.borrow_mut().remove_image(id, force)
        }

        fn secret_exists(&mut self, name: &str) -> Result<bool> {
            self.0.borrow_mut().secret_exists(name)
        }

        fn create_secret(&mut self, name: &str, value: &str) -> Result<()> {
            self.0.borrow_mut().create_secret(name, value)
        }

        fn remove_secret(&mut self, name: &str) -> Result<()> {
            self.0.borrow_mut().remove_secret(name)
        }
    }

    struct Answer;

    impl SecretPrompt for Answer {
        fn prompt(&mut self, name: &str) -> Result<String> {
            Ok(format!("{}-value", name))
        }
    }

    fn directives(backend: Shared, specs: Vec<ImageSpec<BuildContext>>) -> ConfiguredDirectives {
        ConfiguredDirectives {
            package_name: "demo".into(),
            specs,
            external: Set::new(),
            secrets: vec![SecretEntry {
                name: "demo_token".into(),
                error_if_exists: false,
            }],
            policy: BuildPolicy::IfChanged,
            backend: Box::new(backend),
            progress: Box::new(RecordedProgress::default()),
            prompt: Box::new(Answer),
        }
    }

    fn specs() -> Vec<ImageSpec<BuildContext>> {
        vec![
            ImageSpec::new("demo-api", Some("demo-base"), BuildContext::new("api")),
            ImageSpec::new("demo-base", None, BuildContext::new("base")),
        ]
    }

    #[test]
    fn install_then_uninstall() {
        let backend = Shared::default();
        let mut directives = directives(backend.clone(), specs());

        directives.install(None, "0.3.0").unwrap();
        {
            let engine = backend.0.borrow();
            assert_eq!(engine.secrets["demo_token"], "demo_token-value");
            assert!(engine.images.contains_key("demo-base:0.3.0"));
            assert!(engine.images.contains_key("demo-api"));
            assert_eq!(engine.calls[0], "build demo-base:0.3.0");
        }

        directives.uninstall("0.3.0").unwrap();
        let engine = backend.0.borrow();
        assert!(engine.images.is_empty());
        assert!(engine.secrets.is_empty());
    }

    #[test]
    fn nothing_to_do_without_images() {
        let backend = Shared::default();
        let mut directives = directives(backend.clone(), Vec::new());
        directives.progress = Box::new(Silent);

        directives.install(None, "0.3.0").unwrap();
        directives.uninstall("0.3.0").unwrap();

        let engine = backend.0.borrow();
        assert!(engine.calls.is_empty());
        assert!(engine.secrets.is_empty());
    }
}
