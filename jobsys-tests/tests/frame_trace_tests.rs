// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::process::Command;

use jobsys_tests::test_log::TestLog;

fn run_trace(args: &[&str]) -> TestLog {
    let trace_frames = env!("CARGO_BIN_EXE_trace-frames");
    let out = Command::new(trace_frames)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to launch trace-frames: {e}"));

    println!("stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(out.status.success());

    let stdout = String::from_utf8(out.stdout).expect("trace output is not utf8");
    let line = stdout
        .lines()
        .find_map(|l| l.strip_prefix("Event log: "))
        .expect("no event log in the output");
    serde_json::from_str(line).unwrap_or_else(|e| panic!("malformed event log: {e}"))
}

fn check_chains(log: &TestLog, frames: u32, chains: u32) {
    for frame in 0..frames {
        for chain in 0..chains {
            let io = format!("io-{frame}-{chain}");
            let render = format!("render-{frame}-{chain}");
            let main = format!("main-{frame}-{chain}");
            assert_eq!(log.count(&io), 1, "{io}");
            assert_eq!(log.count(&render), 1, "{render}");
            assert_eq!(log.count(&main), 1, "{main}");
            assert!(log.ran_before(&io, &render));
            assert!(log.ran_before(&render, &main));
        }
    }
}

#[test]
fn test_frames_follow_dependencies() {
    let log = run_trace(&["--frames", "3", "--chains", "4"]);
    check_chains(&log, 3, 4);

    // main jobs only ever run on the thread driving the frames
    let main_threads = log.threads_of(4);
    assert_eq!(main_threads, vec!["main"]);
    assert!(log.threads_of(2).iter().all(|t| t.starts_with("jobsys-io-")));
}

#[test]
fn test_budgeted_frames_finish_every_chain() {
    let log = run_trace(&["--frames", "2", "--chains", "6", "--budget-ms", "0"]);
    check_chains(&log, 2, 6);
}

#[cfg(feature = "long-running")]
#[test]
fn test_soak_many_frames() {
    let log = run_trace(&["--frames", "500", "--chains", "32", "--workers", "8"]);
    check_chains(&log, 500, 32);
}
