//! End-to-end integration tests for mswasm.
//!
//! These tests verify the complete pipeline: trace text → statements →
//! replay against a fresh engine → report.

use anyhow::Result;
use mswasm::{replay, ReplayOptions, ReplayReport};

/// Helper to replay a trace with reproducible keys.
fn replay_seeded(trace: &str) -> Result<ReplayReport> {
    let options = ReplayOptions {
        seed: Some(0xC0FFEE),
        ..ReplayOptions::default()
    };
    replay(trace, &options)
}

fn trap_lines(report: &ReplayReport) -> Vec<usize> {
    report
        .output
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains(": trap: "))
        .map(|(idx, _)| idx)
        .collect()
}

#[test]
fn test_store_load_roundtrip() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 16
        store.i32 h 0x12345678
        x = load.i32 h
        "#,
    )?;

    println!("{}", report.output.join("\n"));

    assert_eq!(report.executed, 3);
    assert_eq!(report.traps, 0);
    assert_eq!(report.output[2], "line 4: x = i32:305419896");
    Ok(())
}

#[test]
fn test_use_after_free() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 8
        free h
        x = load.i32 h
        "#,
    )?;

    assert_eq!(trap_lines(&report), [2]);
    assert!(report.output[2].contains("use after free in i32.load"));
    Ok(())
}

#[test]
fn test_slice_free_rules() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 16
        s = slice h 4 12
        free s          # slices cannot free
        free h
        x = load.i32 s
        "#,
    )?;

    assert_eq!(trap_lines(&report), [2, 4]);
    assert!(report.output[2].contains("invalid free"));
    assert!(report.output[4].contains("use after free"));
    Ok(())
}

#[test]
fn test_corrupted_stored_handle() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 8
        store.handle h h
        b = load.i32_8u h
        store.i32_8 h 0x55
        c = load.handle h
        x = load.i32 c
        "#,
    )?;

    assert_eq!(trap_lines(&report), [5]);
    assert!(report.output[4].contains("corrupted"));
    assert!(report.output[5].contains("corrupted handle in i32.load"));
    Ok(())
}

#[test]
fn test_sign_and_zero_extension() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 8
        store.i64 h -2
        a = load.i32_8s h
        b = load.i32_16u h
        c = load.i64_32u h
        d = load.i64_32s h
        "#,
    )?;

    assert_eq!(report.output[2], "line 4: a = i32:-2");
    assert_eq!(report.output[3], "line 5: b = i32:65534");
    assert_eq!(report.output[4], "line 6: c = i64:4294967294");
    assert_eq!(report.output[5], "line 7: d = i64:-2");
    Ok(())
}

#[test]
fn test_floats() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 12
        store.f32 h 1.5f32
        p = add h 4
        store.f64 p -0.25f64
        a = load.f32 h
        b = load.f64 p
        "#,
    )?;

    assert_eq!(report.traps, 0);
    assert_eq!(report.output[4], "line 6: a = f32:1.5");
    assert_eq!(report.output[5], "line 7: b = f64:-0.25");
    Ok(())
}

#[test]
fn test_cursor_arithmetic_bounds() -> Result<()> {
    let report = replay_seeded(
        r#"
        h = alloc 16
        p = add h 12
        ok = load.i32 p
        q = add p 1
        bad = load.i32 q
        r = sub h 1
        neg = load.i32_8u r
        "#,
    )?;

    assert_eq!(trap_lines(&report), [4, 6]);
    assert!(report.output[4].contains("out-of-bounds handle"));
    assert!(report.output[6].contains("out-of-bounds handle"));
    Ok(())
}

#[test]
fn test_encode_is_stable_for_seed() -> Result<()> {
    let trace = "h = alloc 4\nw = encode h";
    let first = replay_seeded(trace)?;
    let second = replay_seeded(trace)?;
    assert_eq!(first.output, second.output);
    Ok(())
}

#[test]
fn test_fail_fast() -> Result<()> {
    let options = ReplayOptions {
        seed: Some(1),
        fail_fast: true,
        ..ReplayOptions::default()
    };
    let report = replay("x = load.i32 null\nh = alloc 4", &options)?;
    assert!(report.stopped_early);
    assert_eq!(report.executed, 1);
    assert!(report.output[0].contains("null handle"));
    Ok(())
}

#[test]
fn test_script_errors_abort() {
    assert!(replay_seeded("free nope").is_err());
    assert!(replay_seeded("h = alloc 4\nload.i32 h h").is_err());
}
