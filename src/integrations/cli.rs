// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use fdgate::config::Settings;
use fdgate::governor::{current_open_file_limit, raise_open_file_limit};
use fdgate::{FileIndex, GovernorLimits, OwnerId, PreallocationMode, ResourceGovernor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the open file limit and raise it to the configured ceiling.
    Limits,
    /// Create a file at its final size. Existing files are only ever shrunk.
    /// Relative paths are taken from the configured download folder.
    Preallocate {
        path: PathBuf,
        length: u64,
        /// none, sparse or full. Defaults to the configured mode.
        #[arg(long)]
        mode: Option<PreallocationMode>,
    },
}

pub fn run(command: Commands, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Limits => {
            let (soft, hard) = current_open_file_limit()?;
            println!("Open file limit: soft {} hard {}", soft, hard);
            match raise_open_file_limit(settings.max_open_files) {
                Some(change) => println!("Raised soft limit from {} to {}", change.from, change.to),
                None => println!(
                    "Soft limit already at or above min(hard, {})",
                    settings.max_open_files
                ),
            }
        }
        Commands::Preallocate { path, length, mode } => {
            let path = resolve_target(path, settings);
            let mode = mode.unwrap_or(settings.preallocation);
            tracing::info!("Preallocating {:?} to {} bytes ({})", path, length, mode);

            let mut governor = ResourceGovernor::new(GovernorLimits::from(settings));
            governor.checkout_file(OwnerId(0), FileIndex(0), &path, true, mode, length)?;
            governor.release_file(OwnerId(0), FileIndex(0));
            governor.teardown();

            let size = fs::metadata(&path)?.len();
            println!("{} is {} bytes", path.display(), size);
        }
    }
    Ok(())
}

/// Relative paths are placed under the configured download folder, if any.
fn resolve_target(path: PathBuf, settings: &Settings) -> PathBuf {
    match &settings.download_folder {
        Some(folder) if path.is_relative() => folder.join(path),
        _ => path,
    }
}
