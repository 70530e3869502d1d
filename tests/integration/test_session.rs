//! End-to-end session flow: JSON catalog, scripted sandbox, file-backed
//! profile with a durable change log.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codequest_engine::{
    CancelToken, Catalog, ChangeLog, FailureClass, FileProfileStore, Profile, ProfileStore,
    ProfileSync, ProgressionPolicy, RetryPolicy, Session, SessionSettings, SyncStatus,
    TerminalState,
};
use support::{temp_dir, SumSandbox, SUM_PROGRAM};

fn sum_catalog() -> Catalog {
    let json = serde_json::json!({
        "challenges": [
            {
                "id": "sum",
                "title": "Sum of two",
                "description": "Read two integers and print their sum.",
                "starterSource": "using System;\\n\\nclass Program\\n{\\n    static void Main()\\n    {\\n    }\\n}\\n",
                "referenceSolution": SUM_PROGRAM,
                "oracle": {
                    "type": "table",
                    "cases": [
                        { "input": "2\n3", "output": "5" },
                        { "input": "-5\n10", "output": "5" },
                        { "input": "0\n0", "output": "0" }
                    ]
                },
                "xpReward": 40,
                "coinsReward": 5,
                "module": "Basics"
            },
            {
                "id": "product",
                "title": "Product of two",
                "referenceSolution": "x",
                "testInputs": ["2\n3"],
                "oracle": { "type": "table", "cases": [{ "input": "2\n3", "output": "6" }] }
            }
        ]
    });
    Catalog::from_json(Path::new("catalog.json"), &json.to_string())
        .expect("Catalog should parse")
}

struct Persistence {
    store: Arc<FileProfileStore>,
    sync: ProfileSync,
    profile: Profile,
    cancel: CancelToken,
}

async fn open_persistence(dir: &Path) -> Persistence {
    let store = Arc::new(FileProfileStore::new(dir.join("profile.json")));
    let mut profile = store.load().await.expect("Profile should load");
    let log = ChangeLog::open(dir.join("changes.jsonl"))
        .await
        .expect("Change log should open");
    log.replay_onto(&mut profile);
    let cancel = CancelToken::new();
    let sync = ProfileSync::spawn(store.clone(), log, RetryPolicy::default(), cancel.clone());
    Persistence {
        store,
        sync,
        profile,
        cancel,
    }
}

fn open_session(sandbox: Arc<SumSandbox>, persistence: &Persistence) -> Session {
    Session::new(
        Arc::new(sum_catalog()),
        sandbox,
        SessionSettings::default(),
    )
    .expect("Session should open")
    .with_profile(
        ProgressionPolicy::default(),
        &persistence.profile,
        persistence.sync.clone(),
    )
}

#[tokio::test]
async fn test_interactive_run_with_two_reads() {
    let dir = temp_dir("interactive");
    let persistence = open_persistence(&dir).await;
    let sandbox = Arc::new(SumSandbox::new());
    let mut session = open_session(sandbox.clone(), &persistence);
    session
        .set_source(SUM_PROGRAM)
        .expect("Source should be accepted");

    let outcome = session.run().await.expect("Run should start");
    assert_eq!(outcome.state, TerminalState::AwaitingInput);
    assert_eq!(outcome.transcript, "First: ");

    let outcome = session.submit_line("3").await.expect("First line");
    assert_eq!(outcome.state, TerminalState::AwaitingInput);
    assert_eq!(sandbox.calls(), 0, "Program should run once, after all input");

    let outcome = session.submit_line("4").await.expect("Second line");
    assert_eq!(outcome.state, TerminalState::Idle);
    assert_eq!(outcome.failure, None);
    assert!(outcome.transcript.starts_with("First: 3\n"));
    assert!(outcome.transcript.ends_with("Sum: 7\n"));
    assert_eq!(sandbox.calls(), 1);

    persistence.cancel.cancel();
}

#[tokio::test]
async fn test_compile_error_is_reported_with_markers() {
    let dir = temp_dir("compile");
    let persistence = open_persistence(&dir).await;
    let mut session = open_session(Arc::new(SumSandbox::new()), &persistence);
    let broken = SUM_PROGRAM.replace("Console.WriteLine(\"Sum: \"", "BROKEN(\"Sum: \"");
    session.set_source(broken).expect("Source should be accepted");

    let mut outcome = session.run().await.expect("Run should start");
    while outcome.state == TerminalState::AwaitingInput {
        outcome = session.submit_line("1").await.expect("Input");
    }
    assert_eq!(outcome.failure, Some(FailureClass::Compile));

    let view = session.view().expect("View");
    assert!(view
        .diagnostics
        .iter()
        .any(|d| d.message.contains("BROKEN")));
    assert!(!view.markers.is_empty());

    persistence.cancel.cancel();
}

#[tokio::test]
async fn test_first_pass_is_written_to_profile_file() {
    let dir = temp_dir("pass");
    let persistence = open_persistence(&dir).await;
    let mut session = open_session(Arc::new(SumSandbox::new()), &persistence);
    session
        .set_source(SUM_PROGRAM)
        .expect("Source should be accepted");

    let outcome = session.submit().await.expect("Submit");
    assert!(outcome.report.passed, "{}", outcome.report.message);
    assert_eq!(outcome.report.tests.len(), 3);
    assert_eq!(outcome.report.stars, Some(3));
    assert!(!outcome.already_completed);
    let delta = outcome.delta.expect("First pass should award rewards");
    assert_eq!(delta.xp_gained, 40);
    assert_eq!(delta.coins_gained, 5);

    let status = tokio::time::timeout(Duration::from_secs(5), persistence.sync.settled())
        .await
        .expect("Sync should settle");
    assert_eq!(status, SyncStatus::Synced);

    let stored = persistence.store.load().await.expect("Reload");
    assert_eq!(stored.xp, 40);
    assert_eq!(stored.coins, 5);
    assert_eq!(stored.completed_challenge_ids, vec!["sum"]);
    assert_eq!(stored.progress["sum"].stars, 3);
    assert_eq!(stored.history.len(), 1);
    assert_eq!(stored.history[0].mode, "challenge");

    // A second pass changes nothing.
    let again = session.submit().await.expect("Resubmit");
    assert!(again.report.passed);
    assert!(again.already_completed);
    assert!(again.delta.is_none());

    persistence.cancel.cancel();
}

#[tokio::test]
async fn test_failing_submission_leaves_profile_untouched() {
    let dir = temp_dir("fail");
    let persistence = open_persistence(&dir).await;
    let mut session = open_session(Arc::new(SumSandbox::new()), &persistence);
    session
        .select_challenge_by_id("product")
        .expect("Challenge should exist");
    session
        .set_source(SUM_PROGRAM)
        .expect("Source should be accepted");

    let outcome = session.submit().await.expect("Submit");
    assert!(!outcome.report.passed);
    assert_eq!(
        outcome.report.failure_class(),
        Some(FailureClass::Verification)
    );
    assert!(outcome.delta.is_none());
    assert_eq!(persistence.sync.pending().await, 0);
    assert!(!dir.join("profile.json").exists());

    persistence.cancel.cancel();
}

#[tokio::test]
async fn test_progress_survives_restart() {
    let dir = temp_dir("restart");
    {
        let persistence = open_persistence(&dir).await;
        let mut session = open_session(Arc::new(SumSandbox::new()), &persistence);
        session
            .set_source(SUM_PROGRAM)
            .expect("Source should be accepted");
        session.submit().await.expect("Submit");
        tokio::time::timeout(Duration::from_secs(5), persistence.sync.settled())
            .await
            .expect("Sync should settle");
        session.close();
        persistence.cancel.cancel();
    }

    let persistence = open_persistence(&dir).await;
    assert_eq!(persistence.profile.xp, 40);
    let session = open_session(Arc::new(SumSandbox::new()), &persistence);
    assert!(session.progression().is_completed("sum"));

    let view = session.view().expect("View");
    assert_eq!(view.completed, vec!["sum"]);
    assert_eq!(view.stars.get("sum"), Some(&3));
    assert_eq!(view.economy.xp, 40);

    persistence.cancel.cancel();
}
