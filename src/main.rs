#![deny(clippy::implicit_return)]
#![allow(clippy::needless_return)]

mod application;
mod configuration;
mod domain;
mod infrastructure;

use std::env;
use std::io;
use std::process;

use anyhow::Error;
use tracing_appender::non_blocking::WorkerGuard;
use yansi::Paint;

use crate::application::cli;
use crate::application::cli::Mode;
use crate::application::server;
use crate::application::terminal;

fn handle_error(err: Error) {
    eprintln!(
        "{}",
        Paint::red(format!(
            "Oh no! chatrelay has failed with the following app version and error.\n\nVersion: {}\nCommit: {}\nError: {}",
            env!("CARGO_PKG_VERSION"),
            env!("VERGEN_GIT_DESCRIBE"),
            err
        ))
    );

    let backtrace = err.backtrace();
    if backtrace.to_string() == "disabled backtrace" {
        let args = env::args().collect::<Vec<String>>().join(" ");
        eprintln!("\nRunning the following can help explain further what the issue is:");
        eprintln!("\nRUST_BACKTRACE=1 {args}");
    } else {
        eprintln!("\n{}", backtrace);
    }

    process::exit(1);
}

fn debug_logging_requested() -> bool {
    return env::var("RUST_LOG")
        .unwrap_or_else(|_| return "".to_string())
        .contains("chatrelay");
}

/// The chat front end owns the terminal, so its logs go to a file and only
/// when asked for. The relay logs to stderr.
fn init_tracing(mode: Mode) -> Option<WorkerGuard> {
    match mode {
        Mode::Chat => {
            if !debug_logging_requested() {
                return None;
            }

            let debug_log_dir = env::var("CHATRELAY_LOG_DIR").unwrap_or_else(|_| {
                return dirs::cache_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("chatrelay")
                    .to_string_lossy()
                    .to_string();
            });

            let file_appender = tracing_appender::rolling::never(debug_log_dir, "debug.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .json()
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(writer)
                .init();

            return Some(guard);
        }
        Mode::Serve => {
            let level = if debug_logging_requested() {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };

            tracing_subscriber::fmt()
                .json()
                .with_max_level(level)
                .with_writer(io::stderr)
                .init();

            return None;
        }
    }
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        better_panic::Settings::auto().create_panic_handler()(panic_info);
    }));

    let mode = match cli::parse().await {
        Ok(Some(mode)) => mode,
        Ok(None) => process::exit(0),
        Err(err) => {
            handle_error(err);
            return;
        }
    };

    let log_guard = init_tracing(mode);

    let res = match mode {
        Mode::Serve => server::start().await,
        Mode::Chat => terminal::start().await,
    };

    drop(log_guard);
    if let Err(err) = res {
        handle_error(err);
    }

    process::exit(0);
}
