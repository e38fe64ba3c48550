use anyhow::Result;
use log::{info, LevelFilter};
use std::{
    env,
    io::stdout,
    path::{Path, PathBuf},
};
use structopt::StructOpt;

use crate::{
    backends::CliBackend,
    config::{find_directives_file, DirectivesFile, Engine, Settings},
    directives::{Dispatcher, Layout, Registry},
    hooks::ConfiguredDirectives,
    models::{normalize_package_name, Action, BuildPolicy, PackageInfo},
    order,
    package::PipQuery,
    services::{InstallDirectives, PackageQuery, Silent, SweepProgress},
    terminal::{HiddenPrompt, TerminalProgress},
};

pub const LOG_ENV: &str = "INSTALL_DIRECTIVES_LOG";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "install-directives",
    about = "Runs the install and uninstall directives of an installed Python package."
)]
pub struct Opt {
    /// Name of the installed package. Dashes and underscores are interchangeable.
    #[structopt(parse(from_str = normalize_package_name))]
    pub package: String,

    /// Directive to run. `plan` only shows what would happen.
    #[structopt(possible_values = Action::VARIANTS, case_insensitive = true)]
    pub action: Action,

    #[structopt(short, long)]
    /// Be verbose.
    pub verbose: bool,

    #[structopt(long, parse(from_os_str))]
    /// Directives file to use instead of the one shipped with the package.
    pub config: Option<PathBuf>,

    #[structopt(long)]
    /// Container engine to use, `docker` or `podman`.
    pub engine: Option<Engine>,

    #[structopt(long)]
    /// Build images even when an identical build already exists.
    pub rebuild: bool,

    #[structopt(long)]
    /// With `plan`, also ask pip whether a newer release is available.
    pub outdated: bool,
}

/// Per-image steps log at debug.
fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

pub fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(default_level(verbose));

    if let Ok(filters) = env::var(LOG_ENV) {
        builder.parse_filters(&filters);
    }

    let _ = builder.try_init();
}

/// Entry point of the `install-directives` binary. Packages found in
/// `registry` use the registered directives, every other package uses its
/// directives file.
pub fn run(registry: &Registry) -> Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let settings = Settings::from_env()?;
    let mut query = PipQuery::new(&settings.python);
    let package = query.package(&opt.package)?;
    info!("found package {} {}", package.name, package.version);

    let file = load_directives(opt.config.as_deref(), &package)?;
    let layout = Layout::new(
        &settings.home,
        &package.name,
        &file.data_folder(&settings.home),
    );

    match opt.action {
        Action::Plan => {
            let outdated = if opt.outdated {
                Some(query.is_outdated(&package)?)
            } else {
                None
            };
            print_plan(&package, &layout, &file, outdated)
        }
        Action::Install => {
            let directives = directives_for(registry, &opt, &package, &file)?;
            Dispatcher::new(package, layout, directives).install()?;
            Ok(())
        }
        Action::Uninstall => {
            let directives = directives_for(registry, &opt, &package, &file)?;
            Dispatcher::new(package, layout, directives).uninstall()?;
            Ok(())
        }
    }
}

fn module_dir(package: &PackageInfo, file: &DirectivesFile) -> PathBuf {
    package.location.join(file.module_name(package))
}

/// The explicit `--config` file, else the one inside the installed module,
/// else no directives at all.
fn load_directives(config: Option<&Path>, package: &PackageInfo) -> Result<DirectivesFile> {
    if let Some(path) = config {
        return DirectivesFile::load(path);
    }

    match find_directives_file(package.location.join(&package.name)) {
        Some(path) => DirectivesFile::load(path),
        None => {
            info!("{} ships no directives file", package.name);
            Ok(DirectivesFile::default())
        }
    }
}

fn directives_for(
    registry: &Registry,
    opt: &Opt,
    package: &PackageInfo,
    file: &DirectivesFile,
) -> Result<Box<dyn InstallDirectives>> {
    if let Some(directives) = registry.directives_for(package) {
        info!("using registered directives for {}", package.name);
        return directives;
    }

    let engine = opt.engine.or(file.engine).unwrap_or_default();
    let policy = if opt.rebuild {
        BuildPolicy::Always
    } else {
        BuildPolicy::IfChanged
    };
    let progress: Box<dyn SweepProgress> = if opt.verbose {
        Box::new(Silent)
    } else {
        Box::new(TerminalProgress::new(stdout()))
    };

    Ok(Box::new(ConfiguredDirectives {
        package_name: package.name.clone(),
        specs: file.image_specs(&module_dir(package, file)),
        external: file.external_images(),
        secrets: file.secrets.clone(),
        policy,
        backend: Box::new(CliBackend::for_engine(engine)),
        progress,
        prompt: Box::new(HiddenPrompt),
    }))
}

fn print_plan(
    package: &PackageInfo,
    layout: &Layout,
    file: &DirectivesFile,
    outdated: Option<bool>,
) -> Result<()> {
    println!("Package {} {}", package.name, package.version);
    if package.editable {
        println!("  installed in editable mode");
    }
    if let Some(outdated) = outdated {
        println!("  newer version available: {}", if outdated { "yes" } else { "no" });
    }
    println!("  base directory: {}", layout.base_dir.display());
    match &layout.data_folder {
        Some(data_folder) => println!("  data folder: {}", data_folder.display()),
        None => println!("  data folder: none"),
    }

    let specs = file.image_specs(&module_dir(package, file));
    if specs.is_empty() {
        println!("No images.");
        return Ok(());
    }

    let external = file.external_images();

    println!("Build order:");
    for spec in order::compute_build_order(&specs, &external)? {
        println!("  {}", spec.name.versioned(&package.version));
    }

    println!("Removal order:");
    for spec in order::compute_removal_order(&specs, &external)? {
        println!("  {}", spec.name.versioned(&package.version));
    }

    Ok(())
}
