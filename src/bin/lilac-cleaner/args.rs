use camino::Utf8PathBuf;
use clap::Parser;

/// `lilac-cleaner [-f] [DIR]` (§6 Cleaner CLI).
#[derive(Debug, Clone, Parser)]
#[command(name = "lilac-cleaner", author, about, version)]
pub struct Args {
    /// Be verbose.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Actually delete candidates instead of printing what would be removed.
    #[arg(short, long)]
    pub force: bool,

    /// Directory to clean. Defaults to the current directory.
    #[arg(default_value = ".")]
    pub dir: Utf8PathBuf,
}
