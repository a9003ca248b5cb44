use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dayboard_core::auth::{AccessRecord, User};
use dayboard_core::backend::FsBackend;
use dayboard_core::datastore::{DataStore, Namespace};
use dayboard_core::datetime::local_now;
use dayboard_core::keys::{DayKey, day_key};
use dayboard_core::record::DayRecord;
use dayboard_core::remote::RecordStore;
use tempfile::{TempDir, tempdir};

const EMAIL: &str = "a@x.com";
const PASSWORD: &str = "secret1";

/// One machine: its own data directory and rc file, sharing a remote dir.
struct Machine {
    _home: TempDir,
    data: PathBuf,
    rc: PathBuf,
    remote: PathBuf,
}

impl Machine {
    fn new(remote: &Path) -> Self {
        let home = tempdir().expect("tempdir");
        let data = home.path().join("data");
        let rc = home.path().join("dayboardrc");
        fs::write(
            &rc,
            format!(
                "color=off\nremote.poll_ms=20\nremote.location={}\n",
                remote.display()
            ),
        )
        .expect("write rc");
        Self {
            _home: home,
            data,
            rc,
            remote: remote.to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        let mut argv: Vec<OsString> = vec![
            "dayboard".into(),
            "-q".into(),
            "--data".into(),
            self.data.clone().into_os_string(),
            "--rc".into(),
            self.rc.clone().into_os_string(),
        ];
        argv.extend(args.iter().map(OsString::from));
        dayboard_core::run(argv)
    }

    fn access_key(&self) -> String {
        let raw = fs::read_to_string(self.remote.join("accessKeys").join("a@x_com.json"))
            .expect("access record written");
        let record: AccessRecord = serde_json::from_str(&raw).expect("access record");
        record.key
    }

    fn signed_in_user(&self) -> Option<User> {
        let raw = fs::read_to_string(self.data.join("session.json")).ok()?;
        Some(serde_json::from_str(&raw).expect("session"))
    }

    fn sign_up_and_in(&self) -> User {
        self.run(&["signup", EMAIL, PASSWORD]).expect("signup");
        let key = self.access_key();
        self.run(&["login", EMAIL, PASSWORD, key.as_str()]).expect("login");
        self.signed_in_user().expect("session written")
    }

    fn remote_day(&self, user: &User, day: &DayKey) -> DayRecord {
        let backend = FsBackend::open(&self.remote).expect("open remote");
        RecordStore::new(Arc::new(backend))
            .read_day(&user.uid, day)
            .expect("read remote day")
    }
}

fn day(raw: &str) -> DayKey {
    raw.parse().expect("day key")
}

#[test]
fn clear_then_save_empties_the_remote_day() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    let user = laptop.sign_up_and_in();
    let gym = day("2024-02-10");

    laptop
        .run(&["--date", "2024-02-10", "task", "9", "gym"])
        .expect("task");
    assert_eq!(
        laptop.remote_day(&user, &gym).task(9).map(|e| e.text.as_str()),
        Some("gym")
    );

    laptop.run(&["--date", "2024-02-10", "clear"]).expect("clear");
    assert!(laptop.remote_day(&user, &gym).task(9).is_some());

    // Any record command refreshes from the remote first; the clear holds.
    laptop.run(&["--date", "2024-02-10", "day"]).expect("day");
    laptop.run(&["--date", "2024-02-10", "save"]).expect("save");
    assert!(laptop.remote_day(&user, &gym).is_empty());
}

#[test]
fn edits_made_without_autosave_survive_the_next_command() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    let user = laptop.sign_up_and_in();
    let gym = day("2024-02-10");

    laptop
        .run(&["--date", "2024-02-10", "task", "9", "gym"])
        .expect("task");
    laptop
        .run(&[
            "--rc-set",
            "sync.autosave=off",
            "--date",
            "2024-02-10",
            "task",
            "9",
            "swim",
        ])
        .expect("offline edit");
    assert_eq!(
        laptop.remote_day(&user, &gym).task(9).map(|e| e.text.as_str()),
        Some("gym")
    );

    laptop.run(&["--date", "2024-02-10", "pending"]).expect("pending");
    laptop.run(&["--date", "2024-02-10", "save"]).expect("save");
    assert_eq!(
        laptop.remote_day(&user, &gym).task(9).map(|e| e.text.as_str()),
        Some("swim")
    );
}

#[test]
fn done_daily_completes_only_present_current_tasks() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    let user = laptop.sign_up_and_in();

    // Hour 0 is never in the future, whatever the time of day.
    laptop.run(&["task", "0", "wake up"]).expect("task");
    laptop.run(&["done", "daily", "0"]).expect("done");
    let today = day_key(&local_now());
    assert!(laptop.remote_day(&user, &today).task(0).expect("task").done);

    assert!(laptop.run(&["done", "daily", "23"]).is_err());
    assert!(laptop.run(&["done", "weekly", "1"]).is_err());
    laptop.run(&["pending", "daily"]).expect("pending");
}

#[test]
fn logout_drops_the_account_cache_and_another_machine_catches_up() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    let user = laptop.sign_up_and_in();
    laptop
        .run(&["--date", "2024-03-01", "note", "shipped", "it"])
        .expect("note");

    let store = DataStore::open(&laptop.data).expect("datastore");
    let cache_file = store
        .cache
        .path_for(&Namespace::for_uid(Some(user.uid.as_str())));
    assert!(cache_file.exists());

    laptop.run(&["logout"]).expect("logout");
    assert!(!cache_file.exists());
    assert!(laptop.signed_in_user().is_none());
    laptop.run(&["whoami"]).expect("whoami");

    // The key was used once; the second machine only needs the password.
    let desktop = Machine::new(remote.path());
    desktop.run(&["login", EMAIL, PASSWORD]).expect("login");
    let desktop_store = DataStore::open(&desktop.data).expect("datastore");
    let doc = desktop_store
        .cache
        .load(&Namespace::for_uid(Some(user.uid.as_str())));
    assert_eq!(
        doc.records.days.get(&day("2024-03-01")).map(|d| d.note.as_str()),
        Some("shipped it")
    );
}

#[test]
fn validated_access_cannot_be_reset_by_a_stranger() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    laptop.sign_up_and_in();
    laptop.run(&["logout"]).expect("logout");

    let stranger = Machine::new(remote.path());
    assert!(stranger.run(&["access", EMAIL, "issue"]).is_err());
    stranger.run(&["access", EMAIL]).expect("status is public");
    stranger.run(&["login", EMAIL, PASSWORD]).expect("owner still gets in");
}

#[test]
fn watch_returns_for_guests_and_after_the_requested_count() {
    let remote = tempdir().expect("tempdir");
    let laptop = Machine::new(remote.path());
    laptop.run(&["task", "0", "guest task"]).expect("guest task");
    laptop.run(&["watch"]).expect("guest watch ends");

    laptop.sign_up_and_in();
    laptop.run(&["watch", "1"]).expect("one live report");
}
