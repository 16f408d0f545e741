// tests/diff_tests.rs
// Diff engine: parse / apply / reverse / create round-trips and the safety
// screens. Pure functions, no workspace needed.

use skillpatch::services::diff::{
    self, ApplyOutcome, check_safety, check_target_paths, create, create_named, parse, reverse,
};

const TARGET_DIFF: &str = "--- a/skills/demo/SKILL.md\n\
+++ b/skills/demo/SKILL.md\n\
@@ -1,2 +1,3 @@\n \
# Title\n \
Content\n\
+Added line\n";

#[test]
fn parse_empty_input_yields_no_sections() {
    assert!(parse("").is_empty());
    assert!(parse("   \n").is_empty());
}

#[test]
fn parse_reads_headers_and_hunks() {
    let files = parse(TARGET_DIFF);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].old_path.as_deref(), Some("a/skills/demo/SKILL.md"));
    assert_eq!(files[0].new_path.as_deref(), Some("b/skills/demo/SKILL.md"));
    assert_eq!(files[0].hunks.len(), 1);
    let hunk = &files[0].hunks[0];
    assert_eq!((hunk.old_start, hunk.old_count), (1, 2));
    assert_eq!((hunk.new_start, hunk.new_count), (1, 3));
    assert_eq!(hunk.lines.len(), 3);
}

#[test]
fn parse_tolerates_multiple_file_sections() {
    let text = format!("{}{}", TARGET_DIFF, TARGET_DIFF.replace("demo", "other"));
    let files = parse(&text);
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].old_path.as_deref(), Some("a/skills/other/SKILL.md"));
}

#[test]
fn apply_adds_line_at_stated_position() {
    let out = diff::apply("# Title\nContent\n", TARGET_DIFF, 0);
    assert_eq!(
        out,
        ApplyOutcome::Applied("# Title\nContent\nAdded line\n".to_string())
    );
}

#[test]
fn apply_returns_sentinel_when_removal_does_not_match() {
    let bad = "--- a/skills/demo/SKILL.md\n\
+++ b/skills/demo/SKILL.md\n\
@@ -1,2 +1,1 @@\n \
# Title\n\
-Absent line\n";
    match diff::apply("# Title\nContent\n", bad, 5) {
        ApplyOutcome::NoMatch { hunk, .. } => assert_eq!(hunk, 1),
        other => panic!("expected NoMatch, got {:?}", other),
    }
}

#[test]
fn apply_tolerates_context_drift_within_fuzz() {
    let drifted = "--- a/skills/demo/SKILL.md\n\
+++ b/skills/demo/SKILL.md\n\
@@ -1,3 +1,4 @@\n \
line1\n \
lineX\n \
line3\n\
+line4\n";
    let original = "line1\nline2\nline3\n";
    // One mismatched context line: allowed at fuzz 2, file content kept.
    assert_eq!(
        diff::apply(original, drifted, 2),
        ApplyOutcome::Applied("line1\nline2\nline3\nline4\n".to_string())
    );
    // Refused at fuzz 0.
    assert!(matches!(
        diff::apply(original, drifted, 0),
        ApplyOutcome::NoMatch { .. }
    ));
}

#[test]
fn apply_locates_hunk_after_content_shifted() {
    // Two lines inserted above the patched region.
    let original = "new0\nnew1\nline1\nline2\n";
    let shifted = "--- a/skills/demo/SKILL.md\n\
+++ b/skills/demo/SKILL.md\n\
@@ -1,2 +1,3 @@\n \
line1\n \
line2\n\
+line3\n";
    assert_eq!(
        diff::apply(original, shifted, 0),
        ApplyOutcome::Applied("new0\nnew1\nline1\nline2\nline3\n".to_string())
    );
}

#[test]
fn apply_normalizes_crlf_before_matching() {
    let out = diff::apply("# Title\r\nContent\r\n", TARGET_DIFF, 0);
    assert_eq!(
        out,
        ApplyOutcome::Applied("# Title\nContent\nAdded line\n".to_string())
    );
}

#[test]
fn apply_empty_diff_is_refused() {
    assert!(matches!(
        diff::apply("content\n", "", 2),
        ApplyOutcome::NoMatch { hunk: 0, .. }
    ));
}

#[test]
fn creation_diff_builds_file_from_empty() {
    let text = "# New skill\nFirst line\n";
    let d = create_named("", text, "a/skills/new/SKILL.md", "b/skills/new/SKILL.md");
    assert!(d.starts_with("--- /dev/null\n"));
    let files = parse(&d);
    assert!(files[0].is_creation());
    assert_eq!(diff::apply("", &d, 0), ApplyOutcome::Applied(text.to_string()));
}

#[test]
fn reverse_of_creation_diff_empties_the_file() {
    let text = "# New skill\nFirst line\n";
    let d = create_named("", text, "a/skills/new/SKILL.md", "b/skills/new/SKILL.md");
    let inv = reverse(&d);
    assert_eq!(diff::apply(text, &inv, 0), ApplyOutcome::Applied(String::new()));
}

#[test]
fn round_trip_create_then_apply() {
    let old = "alpha\nbeta\ngamma\ndelta\n";
    let new = "alpha\nbeta changed\ngamma\ndelta\nepsilon\n";
    let d = create(old, new);
    assert_eq!(diff::apply(old, &d, 0), ApplyOutcome::Applied(new.to_string()));
}

#[test]
fn inverse_diff_restores_original() {
    let old = "one\ntwo\nthree\n";
    let new = "one\ntwo point five\nthree\nfour\n";
    let d = create(old, new);
    let patched = diff::apply(old, &d, 0).applied().expect("forward apply");
    assert_eq!(patched, new);
    let inv = reverse(&d);
    assert_eq!(diff::apply(&patched, &inv, 0), ApplyOutcome::Applied(old.to_string()));
}

#[test]
fn identical_content_creates_empty_diff() {
    assert_eq!(create("same\n", "same\n"), "");
}

#[test]
fn safety_rejects_empty_diff() {
    let check = check_safety("");
    assert!(!check.safe);
}

#[test]
fn safety_rejects_execution_patterns_in_added_lines() {
    let evil = "--- a/skills/demo/SKILL.md\n\
+++ b/skills/demo/SKILL.md\n\
@@ -1,1 +1,2 @@\n \
# Title\n\
+run eval(payload) on start\n";
    let check = check_safety(evil);
    assert!(!check.safe);
    assert!(check.reason.unwrap().contains("eval("));
    // Would otherwise apply cleanly; the screen is independent of apply.
    assert!(matches!(
        diff::apply("# Title\n", evil, 0),
        ApplyOutcome::Applied(_)
    ));
}

#[test]
fn safety_rejects_path_traversal_sequences() {
    let sneaky = "--- a/skills/../../etc/passwd\n\
+++ b/skills/../../etc/passwd\n\
@@ -1,1 +1,2 @@\n \
x\n\
+y\n";
    assert!(!check_safety(sneaky).safe);
}

#[test]
fn safety_accepts_clean_diff() {
    let check = check_safety(TARGET_DIFF);
    assert!(check.safe, "reason: {:?}", check.reason);
}

#[test]
fn target_paths_enforce_allow_list() {
    let allowed = vec!["skills/".to_string()];
    assert!(check_target_paths(TARGET_DIFF, &allowed).safe);

    let outside = TARGET_DIFF.replace("skills/demo/SKILL.md", "etc/passwd");
    let check = check_target_paths(&outside, &allowed);
    assert!(!check.safe);
    assert!(check.reason.unwrap().contains("outside allowed"));
}

#[test]
fn target_paths_exempt_dev_null_old_side() {
    let d = create_named("", "body\n", "/dev/null", "b/skills/new/SKILL.md");
    assert!(check_target_paths(&d, &["skills/".to_string()]).safe);
}
