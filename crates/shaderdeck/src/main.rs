mod bindings;
mod cli;
mod inspect;
mod media;
mod paths;
mod reload;
mod run;

use anyhow::Result;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::run(cli)
}
