/// Compile checks for the handle's ownership contract
///
/// Misuse (use after close, exit text outliving the handle) is rejected by
/// the `compile_fail` doctests on `ProcessHandle`; these cases pin down the
/// legitimate patterns that must keep compiling and running.

#[test]
fn handle_ownership_compile_pass_tests() {
    let t = trybuild::TestCases::new();

    // Shared across threads behind an Arc
    t.pass("tests/compile_pass/shared_handle.rs");

    // Exit text copied out before close
    t.pass("tests/compile_pass/exit_text_copied.rs");
}
