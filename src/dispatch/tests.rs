//! Unit tests for the remote task pipeline.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rstest::{fixture, rstest};

use super::{StageTimeouts, TaskDispatcher, TaskOutcome, TaskPlan};
use crate::provider::{Endpoint, InstanceHandle, InstanceId};
use crate::readiness::ReadyInstance;
use crate::shell::SshOptions;
use crate::test_support::{CommandInvocation, ScriptedRunner};

fn ready(id: u64, host: &str) -> ReadyInstance {
    ReadyInstance {
        handle: InstanceHandle {
            id: InstanceId(id),
            offer_id: id,
            created_at: SystemTime::UNIX_EPOCH,
        },
        endpoint: Endpoint {
            host: host.to_owned(),
            port: 22,
        },
    }
}

#[fixture]
fn plan() -> TaskPlan {
    TaskPlan {
        artifact_base_url: String::from("https://artifacts.example.org/load/"),
        artifacts: vec![String::from("loadtest"), String::from("start.sh")],
        launch_command: String::from("./start.sh"),
        process_pattern: String::from("loadtest"),
        log_file: String::from("task_output.log"),
        timeouts: StageTimeouts::default(),
        confirm_delay: Duration::ZERO,
    }
}

fn ssh() -> SshOptions {
    SshOptions {
        ssh_bin: String::from("ssh"),
        user: String::from("root"),
        identity_file: None,
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
        connect_timeout: Duration::from_secs(10),
    }
}

fn script_success(runner: &ScriptedRunner, host: &str, pid: &str, confirm: &str) {
    let needle = format!("root@{host}");
    runner.respond_to(&needle, Some(0), "ssh connection ok\n", "");
    runner.respond_to(&needle, Some(0), "-rwxr-xr-x loadtest\n", "");
    runner.respond_to(&needle, Some(0), pid, "");
    runner.respond_to(&needle, Some(if confirm.is_empty() { 1 } else { 0 }), confirm, "");
}

#[rstest]
fn fetch_command_downloads_and_marks_artifacts(plan: TaskPlan) {
    let command = plan
        .fetch_command()
        .unwrap_or_else(|| panic!("artifacts are configured"));
    assert_eq!(
        command,
        "wget -q -O loadtest https://artifacts.example.org/load/loadtest && \
         wget -q -O start.sh https://artifacts.example.org/load/start.sh && \
         chmod +x loadtest start.sh && ls -la loadtest start.sh"
    );
}

#[rstest]
fn launch_command_detaches_and_passes_instance_id(plan: TaskPlan) {
    assert_eq!(
        plan.launch_command(InstanceId(4242)),
        "nohup ./start.sh 4242 > task_output.log 2>&1 & echo $!"
    );
    assert_eq!(plan.confirm_command(), "pgrep -f '[l]oadtest'");
}

#[rstest]
#[case::plain("loadtest", "pgrep -f '[l]oadtest'")]
#[case::metacharacters("start.sh", "pgrep -f '[s]tart\\.sh'")]
#[case::leading_path("./run-job", "pgrep -f '\\./[r]un-job'")]
#[case::no_alphanumerics("...", "pgrep -f '\\.\\.\\.'")]
fn presence_check_cannot_match_its_own_shell(
    mut plan: TaskPlan,
    #[case] pattern: &str,
    #[case] expected: &str,
) {
    plan.process_pattern = String::from(pattern);
    assert_eq!(plan.confirm_command(), expected);
}

#[rstest]
fn no_artifacts_means_no_fetch(mut plan: TaskPlan) {
    plan.artifacts.clear();
    assert_eq!(plan.fetch_command(), None);
}

#[rstest]
#[tokio::test]
async fn probe_failure_does_not_affect_sibling(plan: TaskPlan) {
    let runner = Arc::new(ScriptedRunner::new());
    runner.respond_to("root@alpha.example", Some(255), "", "Connection refused");
    script_success(&runner, "bravo.example", "31337\n", "31337\n");
    let dispatcher = TaskDispatcher::new(Arc::clone(&runner), ssh(), plan);

    let report = dispatcher
        .dispatch(&[ready(1, "alpha.example"), ready(2, "bravo.example")])
        .await;

    assert_eq!(report.total(), 2);
    let outcomes: Vec<&TaskOutcome> = report.records.iter().map(|record| &record.outcome).collect();
    assert!(matches!(outcomes.first(), Some(TaskOutcome::ConnectivityFailed { reason }) if reason.contains("255")));
    assert_eq!(
        outcomes.get(1),
        Some(&&TaskOutcome::LaunchedConfirmed { pid: Some(31_337) })
    );
    let tally = report.tally();
    assert_eq!(tally.connectivity_failed, 1);
    assert_eq!(tally.launched_confirmed, 1);
    assert_eq!(report.succeeded(), 1);
    let rate = report.success_rate();
    assert!(rate > 0.49 && rate < 0.51, "rate {rate}");

    let alpha_calls = runner
        .invocations()
        .iter()
        .filter(|call| call.command_string().contains("alpha.example"))
        .count();
    assert_eq!(alpha_calls, 1, "probe failure must short-circuit");
}

#[rstest]
#[tokio::test]
async fn missing_process_is_launched_unconfirmed(plan: TaskPlan) {
    let runner = Arc::new(ScriptedRunner::new());
    script_success(&runner, "charlie.example", "777\n", "");
    let dispatcher = TaskDispatcher::new(Arc::clone(&runner), ssh(), plan);

    let report = dispatcher.dispatch(&[ready(3, "charlie.example")]).await;

    assert_eq!(
        report.records.first().map(|record| &record.outcome),
        Some(&TaskOutcome::LaunchedUnconfirmed { pid: Some(777) })
    );
    assert_eq!(report.succeeded(), 1);
    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(CommandInvocation::command_string)
        .collect();
    assert_eq!(commands.len(), 4);
    assert!(commands.get(2).is_some_and(|cmd| cmd.ends_with("nohup ./start.sh 3 > task_output.log 2>&1 & echo $!")));
    assert!(commands.get(3).is_some_and(|cmd| cmd.ends_with("pgrep -f '[l]oadtest'")));
}

#[rstest]
#[case::fetch(1, "fetch")]
#[case::launch(2, "launch")]
#[tokio::test]
async fn stage_failure_short_circuits(plan: TaskPlan, #[case] failing_step: usize, #[case] stage: &str) {
    let runner = Arc::new(ScriptedRunner::new());
    for step in 0..=failing_step {
        let code = if step == failing_step { 8 } else { 0 };
        runner.respond_to("root@delta.example", Some(code), "", "wget: server returned error");
    }
    let dispatcher = TaskDispatcher::new(Arc::clone(&runner), ssh(), plan);

    let report = dispatcher.dispatch(&[ready(4, "delta.example")]).await;

    let outcome = report
        .records
        .first()
        .map(|record| record.outcome.clone())
        .unwrap_or_else(|| panic!("one record expected"));
    match (stage, &outcome) {
        ("fetch", TaskOutcome::FetchFailed { reason })
        | ("launch", TaskOutcome::LaunchFailed { reason }) => {
            assert!(reason.starts_with(stage), "{reason}");
        }
        _ => panic!("unexpected outcome for {stage}: {outcome:?}"),
    }
    assert_eq!(runner.invocations().len(), failing_step + 1);
    assert!(report.success_rate() < f64::EPSILON);
}

#[rstest]
#[tokio::test]
async fn stalled_probe_times_out(mut plan: TaskPlan) {
    plan.timeouts.probe = Duration::from_millis(20);
    let runner = Arc::new(ScriptedRunner::new());
    runner.stall_on("root@echo.example");
    let dispatcher = TaskDispatcher::new(Arc::clone(&runner), ssh(), plan);

    let report = dispatcher.dispatch(&[ready(5, "echo.example")]).await;

    assert!(matches!(
        report.records.first().map(|record| &record.outcome),
        Some(TaskOutcome::ConnectivityFailed { reason }) if reason.contains("did not finish")
    ));
}

#[rstest]
#[tokio::test]
async fn empty_fleet_has_zero_rate(plan: TaskPlan) {
    let dispatcher = TaskDispatcher::new(Arc::new(ScriptedRunner::new()), ssh(), plan);
    let report = dispatcher.dispatch(&[]).await;
    assert_eq!(report.total(), 0);
    assert!(report.success_rate() < f64::EPSILON);
}
