#![cfg(target_os = "linux")]

mod common;

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use fishforge::cancel::CancelToken;
use fishforge::config::ProcessSettings;
use fishforge::process::{ProcessOutcome, ProcessRunner, ProcessSpec};

use common::dies_within;

#[test]
fn cancelling_kills_forked_helpers_too() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pid_file = tmp.path().join("helper.pid");
    let script = format!(
        "sleep 60 & echo $! > '{}'; echo started; wait",
        pid_file.display()
    );
    let spec = ProcessSpec::new("sh").arg("-c").arg(script);
    let runner = ProcessRunner::new(&ProcessSettings {
        reader_grace_ms: 500,
        kill_grace_ms: 300,
        ..ProcessSettings::default()
    });

    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        let pid_file = pid_file.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !pid_file.is_file() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };

    let started = Instant::now();
    let mut lines = Vec::new();
    let res = runner.run(&spec, &token, &mut |l| lines.push(l.text.clone()));
    canceller.join().expect("canceller");

    assert_eq!(res.outcome, ProcessOutcome::Cancelled);
    assert!(!res.success);
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(lines.iter().any(|l| l == "started"));

    let helper: i32 = fs::read_to_string(&pid_file)
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    assert!(
        dies_within(helper, Duration::from_secs(3)),
        "helper {helper} survived cancellation"
    );
}
