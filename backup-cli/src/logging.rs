// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG` wins; otherwise warn, `-v` info, `-vv` or `--debug` debug.
pub fn init_logging(debug: bool, verbose: u8) -> Result<(), anyhow::Error> {
    let level = if debug || verbose > 1 {
        tracing::Level::DEBUG
    } else if verbose == 1 {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    let env_filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("warn")
            .add_directive(format!("backup_archive={level}").parse()?)
            .add_directive(format!("secret_recovery={level}").parse()?)
            .add_directive(format!("backupctl={level}").parse()?)
            // frame error summaries are logged under this target
            .add_directive(format!("backup={level}").parse()?)
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(debug)
                .with_thread_ids(debug)
                .with_file(debug)
                .with_line_number(debug),
        )
        .with(env_filter)
        .init();

    Ok(())
}
