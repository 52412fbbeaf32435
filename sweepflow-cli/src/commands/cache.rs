use crate::output;

use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::Result;

use sweepflow_engine::{CacheKey, ContentCache};

/// Manage the result cache
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Result cache directory (default: ~/.sweepflow/cache)
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached results
    List,

    /// Remove cached results
    Clear {
        /// Remove a single entry by its full key instead of all
        key: Option<String>,
    },

    /// Show cache directory path
    Path,
}

pub async fn execute(args: CacheArgs) -> Result<()> {
    let cache = match &args.cache_dir {
        Some(dir) => ContentCache::with_cache_dir(dir),
        None => ContentCache::new(),
    };

    match args.command {
        CacheCommand::List => {
            output::status(
                "Results",
                &format!("cached in {}", cache.cache_dir().display()),
            );

            match cache.list().await {
                Ok(entries) => {
                    if entries.is_empty() {
                        output::dim("  No results cached");
                    } else {
                        for entry in &entries {
                            let slots: Vec<&str> =
                                entry.outputs.keys().map(String::as_str).collect();
                            println!(
                                "  {}  {}@{}  [{}]",
                                entry.key.short(),
                                entry.step,
                                entry.version,
                                slots.join(", ")
                            );
                        }
                        println!();
                        output::dim(&format!("  {} result(s) total", entries.len()));
                    }
                }
                Err(e) => {
                    output::error(&format!("Failed to list results: {}", e));
                    std::process::exit(1);
                }
            }
        }

        CacheCommand::Clear { key: Some(key) } => {
            let Some(key) = CacheKey::parse(&key) else {
                color_eyre::eyre::bail!("Invalid cache key '{}': expected 64 hex digits", key);
            };

            match cache.remove(&key).await {
                Ok(true) => output::success(&format!("Removed {}", key.short())),
                Ok(false) => output::warning(&format!("No cached result for {}", key.short())),
                Err(e) => {
                    output::error(&format!("Failed to remove {}: {}", key.short(), e));
                    std::process::exit(1);
                }
            }
        }

        CacheCommand::Clear { key: None } => match cache.clear().await {
            Ok(()) => output::success("Result cache cleared"),
            Err(e) => {
                output::error(&format!("Failed to clear cache: {}", e));
                std::process::exit(1);
            }
        },

        CacheCommand::Path => {
            println!("{}", cache.cache_dir().display());
        }
    }

    Ok(())
}
