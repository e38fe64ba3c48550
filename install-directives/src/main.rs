use anyhow::Result;

use install_directives::{cli, Registry};

fn main() -> Result<()> {
    cli::run(&Registry::new())
}
