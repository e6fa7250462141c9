//! End-to-end behavior of the session engine against the in-memory boundary.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use p4engine::mock::DEFAULT_CONFIG_FILE;
use p4engine::{
    CommandId, MockBoundary, OwnerId, P4Error, P4Session, ResolveChoice, SessionConfig, SessionRegistry,
};

fn run_async<T>(f: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

fn admin_config() -> SessionConfig {
    SessionConfig::new("localhost:6666")
        .with_user("admin")
        .with_workspace("admin_space")
}

#[test]
fn info_round_trip() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        let session = P4Session::open(mock.clone(), admin_config()).await.unwrap();
        let me = OwnerId::new();
        let bundle = session.run(me, "info", &[]).await.unwrap();
        assert!(bundle.tagged_count() >= 1);
        assert_eq!(bundle.command, "info");

        let recorded = mock.commands();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].tagged);
        assert_eq!(recorded[0].cmd_id, bundle.cmd_id.unwrap());
        session.close().await.unwrap();
        assert_eq!(mock.open_connections(), 0);
    });
}

#[test]
fn concurrent_owners_see_only_their_results() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        mock.on_command("echo", |cmd| {
            let word = cmd.args().first().cloned().unwrap_or_default();
            std::thread::sleep(Duration::from_millis(20));
            cmd.tagged(&[("word", word.as_str())]);
            true
        });
        let registry = SessionRegistry::new(mock.clone(), admin_config());

        let mut tasks = Vec::new();
        for word in ["alpha", "beta", "gamma"] {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let owner = OwnerId::new();
                let session = registry.session_for(owner);
                session.run(owner, "echo", &[word.to_string()]).await.unwrap();
                (owner, word)
            }));
        }
        for task in tasks {
            let (owner, word) = task.await.unwrap();
            let last = registry.last_results(owner).unwrap();
            let record = &last.tagged.as_ref().unwrap()[0];
            assert_eq!(record.get("word").map(String::as_str), Some(word));
        }
        assert_eq!(registry.len(), 3);
        registry.close_all().await.unwrap();
    });
}

#[test]
fn commands_on_one_session_are_serialized() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observer = mock.clone();
        let seen = peak.clone();
        mock.on_command("slow", move |_| {
            let running = observer.running_commands().len();
            seen.fetch_max(running, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            true
        });
        let session = P4Session::new(mock.clone(), admin_config());
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                session.run(OwnerId::new(), "slow", &[]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    });
}

#[test]
fn cancel_from_another_task() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        mock.on_command("sync", |cmd| {
            cmd.info(0, "starting");
            if cmd.wait_for_cancel(Duration::from_secs(5)) {
                return cmd.interrupted();
            }
            true
        });
        let session = P4Session::open(mock.clone(), admin_config()).await.unwrap();
        let me = OwnerId::new();
        let cmd_id = session.next_command_id(me);
        let runner = session.clone();
        let task =
            tokio::spawn(async move { runner.run_command(me, "sync", cmd_id, true, &[]).await });

        while !mock.running_commands().contains(&cmd_id) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let canceler = session.clone();
        tokio::spawn(async move { canceler.cancel_command(cmd_id) })
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        let P4Error::Canceled { cmd_id: canceled, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(canceled, cmd_id);
        // The session is still usable afterwards.
        session.run(me, "info", &[]).await.unwrap();
    });
}

#[test]
fn owner_mismatch_is_rejected_without_contact() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        let owner = OwnerId::new();
        let session = P4Session::builder(mock.clone(), admin_config())
            .owner(owner)
            .build();
        let err = session.run(OwnerId::new(), "info", &[]).await.unwrap_err();
        assert!(matches!(err, P4Error::ThreadMismatch { .. }));
        assert_eq!(mock.connect_count(), 0);

        session.set_owner(None);
        session.run(OwnerId::new(), "info", &[]).await.unwrap();
    });
}

#[test]
fn idle_disconnect_then_transparent_reconnect() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        let config = admin_config().with_idle_timeout(Some(Duration::from_millis(40)));
        let session = P4Session::new(mock.clone(), config);
        let me = OwnerId::new();

        session.run(me, "info", &[]).await.unwrap();
        assert!(session.is_connected());
        assert!(session.idle_timer_running());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_connected());
        assert_eq!(mock.open_connections(), 0);

        session.run(me, "info", &[]).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(mock.connect_count(), 2);
    });
}

#[test]
fn activity_keeps_connection_alive() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        let config = admin_config().with_idle_timeout(Some(Duration::from_millis(80)));
        let session = P4Session::new(mock.clone(), config);
        let me = OwnerId::new();
        for _ in 0..5 {
            session.run(me, "info", &[]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mock.connect_count(), 1);
        assert!(session.is_connected());
    });
}

#[test]
fn resolve_prompt_pauses_keep_alive() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        mock.on_command("resolve", |cmd| {
            let choice = cmd.resolve("//depot/a.txt");
            // Still alive even though the handler took longer than the run timeout.
            cmd.keep_alive() && choice == ResolveChoice::AcceptTheirs
        });
        let config = admin_config().with_run_timeout(Duration::from_millis(20));
        let session = P4Session::new(mock.clone(), config);
        session.set_resolve_handler(Some(Arc::new(|_: CommandId, _: &str| {
            std::thread::sleep(Duration::from_millis(60));
            ResolveChoice::AcceptTheirs
        })));
        session.run(OwnerId::new(), "resolve", &[]).await.unwrap();
    });
}

#[test]
fn login_flow_unlocks_protected_commands() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new().with_login("admin", "s3cret"));
        mock.on_command("opened", |_| true);
        let session = P4Session::open(mock.clone(), admin_config()).await.unwrap();
        let me = OwnerId::new();

        let err = session.run(me, "opened", &[]).await.unwrap_err();
        assert!(matches!(err, P4Error::Command(_)));

        session.login(me, "s3cret", &[]).await.unwrap();
        session.run(me, "opened", &[]).await.unwrap();

        // A reconnect keeps the ticket and never logs in again.
        session.reconnect().await.unwrap();
        session.run(me, "opened", &[]).await.unwrap();
        let logins = mock
            .command_names()
            .iter()
            .filter(|name| *name == "login")
            .count();
        assert_eq!(logins, 1);
    });
}

#[test]
fn connection_discovered_from_working_directory() {
    run_async(async {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(DEFAULT_CONFIG_FILE),
            "P4PORT=localhost:6666\nP4USER=admin\nP4CLIENT=admin_space\n",
        )
        .unwrap();
        let nested = root.path().join("src").join("lib");
        std::fs::create_dir_all(&nested).unwrap();

        let mock = Arc::new(MockBoundary::new());
        let session = P4Session::new(mock.clone(), SessionConfig::from_cwd(&nested));
        let bundle = session.run(OwnerId::new(), "info", &[]).await.unwrap();
        let record = &bundle.tagged.as_ref().unwrap()[0];
        assert_eq!(record.get("clientName").map(String::as_str), Some("admin_space"));
    });
}

#[test]
fn close_cancels_running_command_and_is_idempotent() {
    run_async(async {
        let mock = Arc::new(MockBoundary::new());
        mock.on_command("hang", |cmd| {
            if cmd.wait_for_cancel(Duration::from_secs(5)) {
                return cmd.interrupted();
            }
            true
        });
        let session = P4Session::new(
            mock.clone(),
            admin_config().with_close_grace(Duration::from_millis(500)),
        );
        let me = OwnerId::new();
        let cmd_id = session.next_command_id(me);
        let runner = session.clone();
        let task =
            tokio::spawn(async move { runner.run_command(me, "hang", cmd_id, true, &[]).await });
        while !mock.running_commands().contains(&cmd_id) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(task.await.unwrap().unwrap_err().is_canceled());
        assert_eq!(mock.disconnect_count(), 1);
        assert!(matches!(
            session.run(me, "info", &[]).await.unwrap_err(),
            P4Error::Disposed
        ));
    });
}
