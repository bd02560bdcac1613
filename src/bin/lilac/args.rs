use camino::Utf8PathBuf;
use clap::Parser;
use lilac::CmdlineTarget;

/// `lilac [pkg[:runner] ...]` (§6 CLI).
#[derive(Debug, Clone, Parser)]
#[command(name = "lilac", author, about, version)]
pub struct Args {
    /// Be verbose. Repeat for more detail (0=error .. 4=trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the configuration file.
    #[arg(short, long, env = "LILAC_CONFIG", default_value = "/etc/lilac.toml")]
    pub config: Utf8PathBuf,

    /// Acquire the process-wide lock unconditionally, failing fast if
    /// another invocation already holds it (§5 shared resources).
    #[arg(short, long)]
    pub force: bool,

    /// Packages to build, optionally tagged with an opaque runner
    /// (`pkgbase:runner`). With none given, runs a full batch over every
    /// managed package.
    pub targets: Vec<CmdlineTarget>,
}
