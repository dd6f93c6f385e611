use std::path::Path;

use assert_cmd::Command;

const LOADIMMED_UINT: u32 = 63;
const SETCURVAR_CREATE: u32 = 35;
const SAVEVAR_UINT: u32 = 41;
const UINT_TO_NONE: u32 = 62;
const RETURN: u32 = 11;

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// `$count = <value>; return;` as a version-`version` DSO file.
fn assignment_dso(version: u32, value: u32) -> Vec<u8> {
    let strings = b"$count\0";
    let code = [LOADIMMED_UINT, value, SETCURVAR_CREATE, 0, SAVEVAR_UINT, UINT_TO_NONE, RETURN];

    let mut out = Vec::new();
    put_u32(&mut out, version);
    put_u32(&mut out, strings.len() as u32);
    out.extend_from_slice(strings);
    put_u32(&mut out, 0); // global floats
    put_u32(&mut out, 0); // function strings
    put_u32(&mut out, 0); // function floats
    put_u32(&mut out, code.len() as u32);
    put_u32(&mut out, 0); // line breaks
    for w in code {
        assert!(w < 0xFF);
        out.push(w as u8);
    }
    put_u32(&mut out, 1);
    put_u32(&mut out, 0);
    put_u32(&mut out, 1);
    put_u32(&mut out, 3);
    out
}

fn write(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dirs");
    }
    std::fs::write(path, bytes).expect("write dso");
}

fn dedso() -> Command {
    Command::cargo_bin("dedso").expect("dedso binary")
}

#[test]
fn file_mode_prints_source() {
    let td = tempfile::tempdir().expect("tempdir");
    let input = td.path().join("main.cs.dso");
    write(&input, &assignment_dso(33, 5));

    let output = dedso().args(["decompile", "file"]).arg(&input).output().expect("run dedso");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "$count = 5;\nreturn;\n");
}

#[test]
fn file_mode_writes_output_file() {
    let td = tempfile::tempdir().expect("tempdir");
    let input = td.path().join("main.cs.dso");
    let dest = td.path().join("out.cs");
    write(&input, &assignment_dso(33, 7));

    dedso().args(["decompile", "file"]).arg(&input).arg("--output").arg(&dest).assert().success();
    assert_eq!(std::fs::read_to_string(&dest).expect("read output"), "$count = 7;\nreturn;\n");
}

#[test]
fn disasm_mode_lists_opcodes() {
    let td = tempfile::tempdir().expect("tempdir");
    let input = td.path().join("main.cs.dso");
    write(&input, &assignment_dso(33, 5));

    let output = dedso()
        .args(["decompile", "file", "--mode", "disasm"])
        .arg(&input)
        .output()
        .expect("run dedso");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("OP_LOADIMMED_UINT"));
    assert!(stdout.contains("OP_SETCURVAR_CREATE"));
    assert!(stdout.contains("$count"));
}

#[test]
fn version_mismatch_needs_flag() {
    let td = tempfile::tempdir().expect("tempdir");
    let input = td.path().join("old.cs.dso");
    write(&input, &assignment_dso(31, 1));

    let output = dedso().args(["decompile", "file"]).arg(&input).output().expect("run dedso");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported DSO version: 31"));

    dedso()
        .args(["decompile", "file", "--allow-version-mismatch"])
        .arg(&input)
        .assert()
        .success();
}

#[test]
fn dir_mode_continues_past_failures() {
    let td = tempfile::tempdir().expect("tempdir");
    write(&td.path().join("a.cs.dso"), &assignment_dso(33, 1));
    write(&td.path().join("nested/deeper/b.cs.dso"), &assignment_dso(33, 2));
    write(&td.path().join("broken.cs.dso"), &[1, 2, 3]);
    write(&td.path().join("ignored.txt"), b"not a dso");

    let output = dedso().args(["decompile", "dir"]).arg(td.path()).output().expect("run dedso");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("broken.cs.dso"), "stderr: {stderr}");
    assert!(stderr.contains("2 decompiled, 1 failed"), "stderr: {stderr}");

    assert_eq!(std::fs::read_to_string(td.path().join("a.cs")).expect("a.cs"), "$count = 1;\nreturn;\n");
    assert_eq!(
        std::fs::read_to_string(td.path().join("nested/deeper/b.cs")).expect("b.cs"),
        "$count = 2;\nreturn;\n"
    );
    assert!(!td.path().join("broken.cs").exists());
}

#[test]
fn dir_mode_succeeds_when_every_file_decompiles() {
    let td = tempfile::tempdir().expect("tempdir");
    write(&td.path().join("one.cs.dso"), &assignment_dso(33, 1));

    dedso().args(["decompile", "dir"]).arg(td.path()).assert().success();
    assert!(td.path().join("one.cs").exists());
}

#[test]
fn completion_script_names_binary() {
    let output = dedso().args(["completion", "bash"]).output().expect("run dedso");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("dedso"));
}
