use camino::Utf8Path;
use clap::Parser;
use color_eyre::eyre::Result;

mod args;
mod cleaner;

use args::Args;
use cleaner::Verdict;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    lilac::tracing::init(args.verbose, false);
    tracing::debug!("{args:?}");

    let dir = args.dir.canonicalize_utf8().unwrap_or(args.dir.clone());
    let candidates = cleaner::scan(&dir)?;

    let mut removed = 0usize;
    for candidate in &candidates {
        if candidate.verdict != Verdict::Remove {
            continue;
        }
        if args.force {
            let result = if candidate.path.is_dir() {
                std::fs::remove_dir_all(&candidate.path)
            } else {
                std::fs::remove_file(&candidate.path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %candidate.path, error = %e, "Failed to remove"),
            }
        } else {
            println!("Would remove {}", relative(&dir, &candidate.path));
        }
    }

    if args.force {
        tracing::info!(removed, "Cleanup finished");
    }

    Ok(())
}

fn relative<'a>(root: &Utf8Path, path: &'a Utf8Path) -> &'a Utf8Path {
    path.strip_prefix(root).unwrap_or(path)
}
