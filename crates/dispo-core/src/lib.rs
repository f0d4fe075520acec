pub mod accounts;
pub mod aggregate;
pub mod cli;
pub mod commands;
pub mod config;
pub mod date;
pub mod error;
pub mod filter;
pub mod grid;
pub mod i18n;
pub mod remote;
pub mod render;
pub mod selection;
pub mod session;
pub mod settings;
pub mod stats;
pub mod storage;
pub mod user;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  error,
  info,
  warn
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting dispo CLI"
  );
  debug!(
    overrides = pre.rc_overrides.len(),
    "preprocessed rc overrides"
  );

  let mut cfg = config::Config::load(
    cli.disporc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async \
         runtime"
      )?;

  runtime.block_on(async {
    let mut session =
      session::Session::open(
        &cfg, &data_dir
      )
      .with_context(|| {
        format!(
          "failed to open session at \
           {}",
          data_dir.display()
        )
      })?;

    let mut renderer =
      render::Renderer::new(
        &cfg,
        session.settings()
      )?;

    commands::dispatch(
      &mut session,
      &cfg,
      &mut renderer,
      cli.command,
      wait_for_shutdown_signal()
    )
    .await?;

    session.close()
  })?;

  info!("done");
  Ok(())
}

/// Resolves on SIGINT or SIGTERM; only
/// `watch` ever waits on it.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
  use tokio::signal::unix::{
    SignalKind,
    signal
  };

  let streams =
    signal(SignalKind::interrupt())
      .and_then(|int| {
        Ok((
          int,
          signal(
            SignalKind::terminate()
          )?
        ))
      });

  match streams {
    | Ok((mut int, mut term)) => {
      let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
      };
      info!(
        signal = name,
        "stopping watch"
      );
    }
    | Err(error) => {
      warn!(
        %error,
        "signal handlers unavailable; \
         watch stops on ctrl-c only"
      );
      wait_for_ctrl_c().await;
    }
  }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
  wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
  match tokio::signal::ctrl_c().await {
    | Ok(()) => {
      info!("ctrl-c; stopping watch")
    }
    | Err(error) => {
      error!(
        %error,
        "cannot listen for ctrl-c"
      );
      std::future::pending::<()>()
        .await
    }
  }
}
