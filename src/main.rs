use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use todo_vdir::logging::init_tracing;
use todo_vdir::{AppError, Collection, QueryOptions, Settings};

/// Exit status for mistakes in the invocation or configuration.
const USER_ERROR: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {:#}", error);
            let user_error = error
                .downcast_ref::<AppError>()
                .map(AppError::is_user_error)
                .unwrap_or(false);
            if user_error {
                ExitCode::from(USER_ERROR)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(config) = args.next().map(PathBuf::from) else {
        bail!("usage: todo-vdir <config.yaml> [LIST...]");
    };
    let settings = Settings::load(&config)?;

    let cache_path = settings.resolved_cache_path()?;
    let log_dir = cache_path
        .parent()
        .map(|dir| dir.join("logs"))
        .context("cache path has no parent directory")?;
    init_tracing(&log_dir)?;

    let collection = Collection::open(settings)?;
    let options = QueryOptions {
        lists: args.collect(),
        ..QueryOptions::default()
    };
    let result = collection.todos(&options)?;
    for warning in &result.warnings {
        eprintln!("{}", warning);
    }
    println!("{}", serde_json::to_string_pretty(&result.todos)?);
    Ok(())
}
