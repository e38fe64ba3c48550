//! Post-install and pre-uninstall directives for packages installed through
//! pip, and dependency ordered building of the container images they ship.

pub mod backends;
pub mod cli;
pub mod config;
pub mod directives;
pub mod hasher;
pub mod hooks;
pub mod images;
pub mod models;
pub mod order;
pub mod package;
pub mod services;
pub mod terminal;

pub use directives::{DataFolder, DirectiveError, Dispatcher, Layout, Registry};
pub use models::{BuildContext, ImageName, ImageSpec, PackageInfo};
pub use order::{
    build_all, compute_build_order, compute_removal_order, remove_all, OrderError, SweepError,
};
pub use services::{ImageBackend, InstallDirectives, PackageQuery};
