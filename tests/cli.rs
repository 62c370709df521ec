//! CLI based tests

use std::process::ExitCode;

use sluice::main as sluice_main;

#[test]
fn bad_option() {
    assert_eq!(
        sluice_main(["sluice", "--this-ridiculous-option-does-not-exist"]),
        ExitCode::FAILURE
    );
}

#[test]
fn no_mode_is_an_error() {
    assert_eq!(sluice_main(["sluice"]), ExitCode::FAILURE);
}

#[test]
fn help_is_a_normal_exit() {
    assert_eq!(sluice_main(["sluice", "--help"]), ExitCode::SUCCESS);
}

#[test]
fn bridge_without_a_daemon_fails() {
    assert_eq!(
        sluice_main([
            "sluice",
            "bridge",
            "--socket",
            "/nonexistent/path/to/sluice.sock"
        ]),
        ExitCode::FAILURE
    );
}
