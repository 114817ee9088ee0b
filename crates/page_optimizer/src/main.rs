//! Optimizes a page and reports which deferred assets were loaded.

use anyhow::Error;
use env_logger::{Builder, Env};
use log::{error, info};
use page_optimizer::{Options, run};
use std::env;
use std::process::exit;
use tokio::runtime::Runtime;

fn main() {
    let _log_init: Result<(), _> = Builder::from_env(Env::default().filter_or("RUST_LOG", "warn"))
        .is_test(false)
        .try_init();
    let options = match Options::from_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            error!("{err}");
            exit(2);
        }
    };
    let outcome = Runtime::new()
        .map_err(Error::from)
        .and_then(|runtime| runtime.block_on(run(&options)));
    match outcome {
        Ok(report) => {
            info!(
                "[OPTIMIZE] {}: {} fetches, loaded {:?}, score {}",
                report.input,
                report.fetches.len(),
                report.status.loaded_assets,
                report.status.report.performance_score
            );
        }
        Err(err) => {
            error!("error: {err}");
            exit(1);
        }
    }
}
