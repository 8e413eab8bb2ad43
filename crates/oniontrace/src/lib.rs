#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![allow(clippy::print_stderr)] // Allowed in this crate only.
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

pub mod config;

mod circuit;
mod driver;
mod evloop;
mod logger;
mod logging;
mod player;
mod recorder;
mod timer;
mod torctl;
mod tracefile;

use std::process::ExitCode;

use anyhow::Context as _;
use tracing::{error, info};

use crate::config::Config;
use crate::driver::Driver;
use crate::evloop::EventManager;

/// Run the controller: parse `args`, connect to the daemon, and drive the
/// main loop until it stops.
///
/// `args` holds the `key=value` configuration tokens, program name
/// excluded. Returns the process exit status: success only when the main
/// loop exited cleanly.
pub fn main_main<I>(args: I) -> ExitCode
where
    I: IntoIterator<Item = String>,
{
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("oniontrace: configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::install(config.log_level) {
        eprintln!("oniontrace: unable to install tracing subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    info!(
        "starting oniontrace v{} on host {} pid {}",
        env!("CARGO_PKG_VERSION"),
        hostname,
        std::process::id()
    );

    match run(config) {
        Ok(()) => {
            info!("exiting cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("exiting with failure: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Construct the event loop and driver, then run until stopped.
fn run(config: Config) -> anyhow::Result<()> {
    let mut manager = EventManager::new().context("creating event manager")?;
    let mut driver = Driver::new(config);
    driver.start(&mut manager).context("starting driver")?;

    info!("entering main loop");
    let result = manager.run(&mut driver);
    info!("main loop finished");

    driver.stop(&mut manager);
    result.context("main loop")?;
    Ok(())
}
