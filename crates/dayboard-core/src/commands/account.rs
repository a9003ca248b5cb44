use anyhow::{
  anyhow,
  bail
};
use tracing::{
  info,
  instrument,
  warn
};

use super::App;
use crate::auth::AccessStatus;
use crate::subscription::Subscription;
use crate::tracker::SyncOutcome;

const PASSWORD_ENV: &str =
  "DAYBOARD_PASSWORD";
const ACCESS_KEY_ENV: &str =
  "DAYBOARD_ACCESS_KEY";

fn arg_or_env(
  args: &[String],
  idx: usize,
  env: &str
) -> Option<String> {
  args
    .get(idx)
    .cloned()
    .or_else(|| std::env::var(env).ok())
    .filter(|v| !v.is_empty())
}

/// Applies every queued identity
/// change to the tracker so its cache
/// namespace follows the session.
fn follow_identity(
  app: &mut App,
  changes: &mut Subscription<
    Option<crate::auth::User>
  >
) -> anyhow::Result<()> {
  while let Some(user) =
    changes.try_recv()
  {
    app.tracker.switch_identity(user)?;
  }
  Ok(())
}

#[instrument(skip(app, args))]
pub(super) fn cmd_signup(
  app: &mut App,
  args: &[String]
) -> anyhow::Result<()> {
  let email = args.first().ok_or_else(
    || {
      anyhow!(
        "usage: dayboard signup EMAIL \
         [PASSWORD]"
      )
    }
  )?;
  let password =
    arg_or_env(args, 1, PASSWORD_ENV)
      .ok_or_else(|| {
        anyhow!(
          "password required (argument \
           or {PASSWORD_ENV})"
        )
      })?;

  let mut changes =
    app.auth.on_auth_change();
  let signup =
    app.auth.sign_up(email, &password)?;
  follow_identity(app, &mut changes)?;

  println!(
    "Account created for {}.",
    signup.user.email
  );
  match signup.access_key {
    | Some(key) => {
      println!("Access key: {key}");
      println!(
        "First sign-in: dayboard login \
         {} PASSWORD {key}",
        signup.user.email
      );
    }
    | None => {
      warn!("no access key stored for new account");
      println!(
        "The access key could not be \
         stored. Run `dayboard access {} \
         issue` to provision one.",
        signup.user.email
      );
    }
  }
  Ok(())
}

#[instrument(skip(app, args))]
pub(super) fn cmd_login(
  app: &mut App,
  args: &[String]
) -> anyhow::Result<()> {
  let email = args.first().ok_or_else(
    || {
      anyhow!(
        "usage: dayboard login EMAIL \
         [PASSWORD] [ACCESS_KEY]"
      )
    }
  )?;
  let password =
    arg_or_env(args, 1, PASSWORD_ENV)
      .ok_or_else(|| {
        anyhow!(
          "password required (argument \
           or {PASSWORD_ENV})"
        )
      })?;
  let access_key = arg_or_env(
    args,
    2,
    ACCESS_KEY_ENV
  );

  let mut changes =
    app.auth.on_auth_change();
  let user = app.auth.sign_in(
    email,
    &password,
    access_key.as_deref()
  )?;
  follow_identity(app, &mut changes)?;
  info!(uid = %user.uid, "session started");

  println!(
    "Signed in as {}.",
    user.email
  );
  match app.tracker.sync()? {
    | SyncOutcome::Merged {
      days,
      weeks,
      months
    } => {
      println!(
        "Loaded {days} days, {weeks} \
         weeks, {months} months."
      )
    }
    | SyncOutcome::Failed(reason) => {
      println!(
        "Could not load records yet: \
         {reason}"
      )
    }
    | SyncOutcome::Guest
    | SyncOutcome::Offline => {}
  }
  Ok(())
}

#[instrument(skip(app))]
pub(super) fn cmd_logout(
  app: &mut App
) -> anyhow::Result<()> {
  let Some(user) =
    app.auth.current_user()
  else {
    println!("Not signed in.");
    return Ok(());
  };

  let mut changes =
    app.auth.on_auth_change();
  app.auth.sign_out()?;
  follow_identity(app, &mut changes)?;
  println!(
    "Signed out {}. Cached records for \
     this account were removed.",
    user.email
  );
  Ok(())
}

#[instrument(skip(app))]
pub(super) fn cmd_whoami(
  app: &mut App
) -> anyhow::Result<()> {
  match app.auth.current_user() {
    | Some(user) => {
      println!(
        "{} (uid {})",
        user.email, user.uid
      )
    }
    | None => println!("guest"),
  }
  println!(
    "cache: {} ({} unsaved)",
    app.tracker.namespace(),
    app.tracker.unsynced().len()
  );
  println!(
    "data:  {}",
    app.store.data_dir.display()
  );
  let remote = app
    .tracker
    .remote()
    .backend()
    .map(|b| b.describe())
    .unwrap_or_else(|| {
      "off".to_string()
    });
  println!("remote: {remote}");
  Ok(())
}

#[instrument(skip(app, args))]
pub(super) fn cmd_access(
  app: &mut App,
  args: &[String]
) -> anyhow::Result<()> {
  let email = args.first().ok_or_else(
    || {
      anyhow!(
        "usage: dayboard access EMAIL \
         [issue]"
      )
    }
  )?;

  match args
    .get(1)
    .map(|a| a.to_ascii_lowercase())
    .as_deref()
  {
    | None => {
      let status =
        app.auth.access_status(email)?;
      let text = match status {
        | AccessStatus::NotProvisioned => {
          "not provisioned"
        }
        | AccessStatus::KeyRequired => {
          "access key required for the \
           first sign-in"
        }
        | AccessStatus::Validated => {
          "validated; no key needed"
        }
      };
      println!("{email}: {text}");
    }
    | Some("issue") => {
      let key = app
        .auth
        .reissue_access_key(email)?;
      println!(
        "New access key for {email}: \
         {key}"
      );
    }
    | Some(other) => {
      bail!(
        "unknown access action: {other}"
      )
    }
  }
  Ok(())
}
