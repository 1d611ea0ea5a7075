use clap::Parser;
use miette::{IntoDiagnostic, Result};

mod common;
mod daemon;
mod data;

#[derive(Parser)]
#[clap(name = "Cdnsd")]
#[clap(bin_name = "cdnsd")]
#[clap(author, version, about, long_about = None)]
enum Cdnsd {
    /// Run the chain followers and the DNS server
    Daemon(daemon::Args),
    /// Inspect the materialized zone store
    Data(data::Args),
}

fn main() -> Result<()> {
    let args = Cdnsd::parse();

    match args {
        Cdnsd::Daemon(x) => daemon::run(&x).into_diagnostic()?,
        Cdnsd::Data(x) => data::run(&x).into_diagnostic()?,
    };

    Ok(())
}
