pub mod auth;
pub mod backend;
pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod datetime;
pub mod keys;
pub mod pending;
pub mod record;
pub mod remote;
pub mod render;
pub mod subscription;
pub mod tracker;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info,
  warn
};

use crate::backend::{
  DocumentBackend,
  FsBackend
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
    "starting dayboard"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.rc.as_deref()
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

  let store =
    datastore::DataStore::open(
      &data_dir
    )
    .with_context(|| {
      format!(
        "failed to open datastore at \
         {}",
        data_dir.display()
      )
    })?;

  let backend = open_backend(
    &cfg, &data_dir
  )?;

  let mut auth =
    auth::AuthService::new(
      &store.session_path
    )?;
  let remote = match &backend {
    | Some(backend) => {
      auth = auth
        .with_backend(backend.clone());
      remote::RecordStore::new(
        backend.clone()
      )
    }
    | None => {
      remote::RecordStore::offline()
    }
  };

  let tracker = tracker::Tracker::open(
    store.cache.clone(),
    remote,
    auth.current_user()
  )
  .with_autosave(
    cfg.flag("sync.autosave")
  );

  let now = datetime::local_now();
  let selected = match cli
    .date
    .as_deref()
  {
    | Some(expr) => {
      keys::DayKey::from_date(
        datetime::parse_date_expr(
          expr, &now
        )?
      )
    }
    | None => keys::day_key(&now)
  };

  let renderer =
    render::Renderer::new(&cfg)?;
  let inv = cli::Invocation::parse(
    &cfg, cli.rest
  )?;

  let mut app = commands::App {
    cfg,
    store,
    auth,
    tracker,
    renderer,
    now,
    selected
  };
  commands::dispatch(&mut app, inv)?;

  info!("done");
  Ok(())
}

/// Opens the shared document store
/// when it is enabled. A store that
/// cannot be opened leaves the
/// process offline rather than
/// failing every command.
fn open_backend(
  cfg: &config::Config,
  data_dir: &std::path::Path
) -> anyhow::Result<
  Option<Arc<dyn DocumentBackend>>
> {
  let Some(dir) =
    config::resolve_remote_dir(
      cfg, data_dir
    )
  else {
    debug!("remote store disabled");
    return Ok(None);
  };

  let poll = cfg.poll_interval()?;
  match FsBackend::open(&dir) {
    | Ok(backend) => {
      let backend: Arc<
        dyn DocumentBackend
      > = Arc::new(
        backend
          .with_poll_interval(poll)
      );
      debug!(remote = %backend.describe(), "remote store ready");
      Ok(Some(backend))
    }
    | Err(err) => {
      warn!(
        dir = %dir.display(),
        error = %format!("{err:#}"),
        "remote store unavailable; \
         working offline"
      );
      Ok(None)
    }
  }
}
