#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use shiftcast_core::{JobCommand, JobKey, JobOutput, LaunchSpec, ProcessLauncher, SystemLauncher};

fn spec(program: &str, args: &[&str], output: JobOutput) -> LaunchSpec {
    LaunchSpec {
        key: JobKey::record(1),
        command: JobCommand {
            program: PathBuf::from(program),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        },
        output,
    }
}

#[tokio::test]
async fn terminate_stops_a_cooperative_process_with_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("logs/job.log");
    let mut process = SystemLauncher
        .launch(&spec("sleep", &["30"], JobOutput::LogFile(log.clone())))
        .unwrap();

    assert!(process.pid().is_some());
    assert!(process.try_wait().unwrap().is_none());
    let exit = process.terminate(Duration::from_secs(5)).await.unwrap();
    assert_eq!(exit.signal, Some(libc::SIGTERM));
    assert!(!exit.success());
    assert!(log.exists());
}

#[tokio::test]
async fn terminate_escalates_to_sigkill_after_grace() {
    let mut process = SystemLauncher
        .launch(&spec(
            "sh",
            &["-c", "trap '' TERM; while :; do sleep 1; done"],
            JobOutput::Inherit,
        ))
        .unwrap();
    // let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let exit = process.terminate(Duration::from_millis(300)).await.unwrap();
    assert_eq!(exit.signal, Some(libc::SIGKILL));
}

#[tokio::test]
async fn finished_process_reports_its_exit_code() {
    let mut process = SystemLauncher
        .launch(&spec("sh", &["-c", "exit 3"], JobOutput::Inherit))
        .unwrap();
    let exit = process.wait().await.unwrap();
    assert_eq!(exit.code, Some(3));
    assert_eq!(exit.to_string(), "exit code 3");

    let again = process.terminate(Duration::from_millis(100)).await.unwrap();
    assert_eq!(again.code, Some(3));
}

#[test]
fn missing_program_fails_to_launch() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let result = SystemLauncher.launch(&spec(
            "/nonexistent/shiftcast-ffmpeg",
            &[],
            JobOutput::Inherit,
        ));
        assert!(result.is_err());
    });
}
