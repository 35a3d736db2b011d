// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod integrations;

use std::env;
use std::fs;
use std::path::PathBuf;

use fdgate::config;

use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;

use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use clap::Parser;

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = base_data_dir.join("logs");

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _guard = if fs::create_dir_all(&log_dir).is_ok() {
        let general_log = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(31)
            .filename_prefix("fdgate")
            .filename_suffix("log")
            .build(&log_dir)?;
        let (non_blocking_general, guard) = tracing_appender::non_blocking(general_log);

        let quiet_filter = Targets::new().with_default(DEFAULT_LOG_FILTER);
        let general_layer = fmt::layer()
            .with_writer(non_blocking_general)
            .with_ansi(false)
            .with_filter(quiet_filter);

        let _ = tracing_subscriber::registry().with(general_layer).try_init();
        Some(guard)
    } else {
        let _ = tracing_subscriber::registry().try_init();
        None
    };

    tracing::info!("STARTING FDGATE");

    let cli = integrations::cli::Cli::parse();
    let settings = config::load_settings();

    if let Err(e) = integrations::cli::run(cli.command, &settings) {
        tracing::error!("Command failed: {}", e);
        return Err(e);
    }

    Ok(())
}
