//! Tests to verify that [`crate::runner::Executor`] behaves correctly, using a
//! scripted isolation provider.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::{
    err::ExecError,
    runner::model::{ExitStatus, PROGRAM_FILE, TESTINPUT_FILE},
    verdict::{Evaluator, Verdict},
};

use super::util::{count_job_dirs, executor, test_config, MockProvider};

const HELLO: &str = "print(input())";

#[test(tokio::test)]
async fn job_folder_holds_exactly_program_and_input() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider.when(HELLO).returns(0).stdout("hello\n").finish();
    let provider = Arc::new(provider);
    let exec = executor(provider.clone(), &cfg);

    let res = exec
        .execute("python", HELLO, "hello\n", Duration::from_secs(3))
        .await
        .expect("execution should succeed");
    assert_eq!(&res.stdout[..], b"hello");
    assert_eq!(res.ret_code, ExitStatus::ReturnCode(0));

    let seen = provider.seen();
    assert_eq!(seen.len(), 1);
    let job = &seen[0];
    assert_eq!(job.files, vec![PROGRAM_FILE.to_string(), TESTINPUT_FILE.to_string()]);
    assert_eq!(job.program, HELLO);
    assert_eq!(job.testinput, "hello\n");
    assert_eq!(job.command, vec!["entry".to_string()]);
    assert_eq!(job.env, vec![("LANGUAGE".to_string(), "python".to_string())]);
    assert_eq!(job.timeout, Duration::from_secs(3));
    assert!(job.dir.starts_with(root.path()));

    assert!(!job.dir.exists());
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn unsupported_language_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    // not created yet; resolving first means it never will be
    let work_dir = root.path().join("jobs");
    let cfg = test_config(&work_dir);
    let provider = Arc::new(MockProvider::new());
    let exec = executor(provider.clone(), &cfg);

    match exec
        .execute("cobol", "DISPLAY 'HI'.", "", Duration::from_secs(3))
        .await
    {
        Err(ExecError::UnsupportedLanguage(tag)) => assert_eq!(tag, "cobol"),
        other => panic!("expected unsupported language, got {:?}", other),
    }
    assert_eq!(provider.runs(), 0);
    assert!(!work_dir.exists());
}

#[test(tokio::test)]
async fn only_one_trailing_newline_is_stripped() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider.when("a").stdout("x\n\n").finish();
    provider.when("b").stdout("x").finish();
    provider.when("c").stdout("x\r\n").finish();
    provider.when("d").stdout("").finish();
    let exec = executor(Arc::new(provider), &cfg);

    for (src, expected) in [
        ("a", &b"x\n"[..]),
        ("b", &b"x"[..]),
        ("c", &b"x\r"[..]),
        ("d", &b""[..]),
    ] {
        let res = exec
            .execute("bash", src, "", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&res.stdout[..], expected, "program {:?}", src);
    }
}

#[test(tokio::test)]
async fn nonzero_exit_is_a_program_error() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider
        .when("raise 'boom'")
        .returns(1)
        .stdout("partial output")
        .stderr("-e:1:in `<main>': boom (RuntimeError)\n")
        .finish();
    let exec = executor(Arc::new(provider), &cfg);

    match exec
        .execute("ruby", "raise 'boom'", "", Duration::from_secs(3))
        .await
    {
        Err(ExecError::ProgramError(diag)) => assert!(diag.contains("boom")),
        other => panic!("expected program error, got {:?}", other),
    }
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn compile_failures_are_program_errors() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider
        .when("int main( {")
        .returns(1)
        .stderr("program.c:1:10: error: expected declaration specifiers\n")
        .finish();
    let exec = executor(Arc::new(provider), &cfg);

    let err = exec
        .execute("c", "int main( {", "", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(!err.is_infrastructure());
    assert!(matches!(err, ExecError::ProgramError(d) if d.contains("expected declaration")));
}

#[test(tokio::test)]
async fn timeouts_are_reported_and_cleaned_up() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider
        .when("sleep 10")
        .ends_with(ExitStatus::Timeout)
        .stdout("never judged")
        .finish();
    let exec = executor(Arc::new(provider), &cfg);

    let res = exec
        .execute("bash", "sleep 10", "", Duration::from_secs(3))
        .await;
    assert!(matches!(res, Err(ExecError::ProgramTimeout)));
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn provider_failures_are_infrastructure_errors() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider
        .when("echo hi")
        .infra_error("cannot connect to the docker daemon")
        .finish();
    let exec = executor(Arc::new(provider), &cfg);

    let err = exec
        .execute("bash", "echo hi", "", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn watchdog_abandons_a_hung_provider() {
    let root = tempfile::tempdir().unwrap();
    let mut cfg = test_config(root.path());
    cfg.sandbox.watchdog_grace_secs = 0;
    let mut provider = MockProvider::new();
    provider.when("echo hi").hangs().finish();
    let exec = executor(Arc::new(provider), &cfg);

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        exec.execute("bash", "echo hi", "", Duration::from_millis(200)),
    )
    .await
    .expect("watchdog should have fired")
    .unwrap_err();
    assert!(err.is_infrastructure());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn panicking_provider_still_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider.when("echo hi").panics("provider bug").finish();
    let exec = executor(Arc::new(provider), &cfg);

    let res = tokio::spawn(async move {
        exec.execute("bash", "echo hi", "", Duration::from_secs(1))
            .await
    })
    .await;
    assert!(res.unwrap_err().is_panic());
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn concurrent_jobs_never_share_a_folder() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider
        .when(HELLO)
        .stdout("hello\n")
        .delay(Duration::from_millis(50))
        .finish();
    let provider = Arc::new(provider);
    let exec = executor(provider.clone(), &cfg);

    let jobs = (0..8).map(|_| exec.execute("python", HELLO, "hello\n", Duration::from_secs(1)));
    for res in futures::future::join_all(jobs).await {
        assert_eq!(&res.unwrap().stdout[..], b"hello");
    }

    let mut dirs: Vec<_> = provider.seen().into_iter().map(|j| j.dir).collect();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 8);
    assert_eq!(count_job_dirs(root.path()), 0);
}

#[test(tokio::test)]
async fn identical_jobs_give_identical_results() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path());
    let mut provider = MockProvider::new();
    provider.when(HELLO).stdout("hello\n").finish();
    let exec = executor(Arc::new(provider), &cfg);

    let a = exec
        .execute("python", HELLO, "hello\n", Duration::from_secs(1))
        .await
        .unwrap();
    let b = exec
        .execute("python", HELLO, "hello\n", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(a, b);
}

#[test(tokio::test)]
async fn output_past_the_cap_never_passes() {
    let root = tempfile::tempdir().unwrap();
    let mut cfg = test_config(root.path());
    cfg.sandbox.stdout_size_limit = 8;
    let mut provider = MockProvider::new();
    provider.when("flood").stdout("aaaaaaaaGARBAGE").finish();
    provider.when("fits").stdout("aaaaaaaa").finish();
    let exec = executor(Arc::new(provider), &cfg);
    let evaluator = Evaluator::default();

    let outcome = exec
        .execute("bash", "flood", "", Duration::from_secs(1))
        .await;
    match &outcome {
        Err(ExecError::ProgramError(diag)) => {
            assert_eq!(diag, "output limit of 8 bytes exceeded")
        }
        other => panic!("expected program error, got {:?}", other),
    }
    assert_eq!(
        evaluator.judge(outcome, "aaaaaaaa").unwrap(),
        Verdict::RuntimeError("output limit of 8 bytes exceeded".into())
    );

    // exactly at the cap is still complete output
    let outcome = exec
        .execute("bash", "fits", "", Duration::from_secs(1))
        .await;
    assert_eq!(evaluator.judge(outcome, "aaaaaaaa").unwrap(), Verdict::Pass);
    assert_eq!(count_job_dirs(root.path()), 0);
}
