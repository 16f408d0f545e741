// src/services/diff.rs
//! Unified-diff parsing, fuzzy application, inverse derivation, and safety
//! screening.
//!
//! Minimal-diff *generation* is delegated to `diffy` (`create`); this module
//! owns the rest of the patch lifecycle: locating hunks in drifted content
//! within a fuzz tolerance, deriving the inverse diff for rollback, and
//! screening diff text before any privileged operation.
//!
//! Content and diff text are both normalized CRLF→LF before matching; the
//! result is returned as produced by the applier, so callers must not assume
//! the original line-ending style survives.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
    /// `\ No newline at end of file` seen after an old-side line.
    pub no_newline_old: bool,
    /// `\ No newline at end of file` seen after a new-side line.
    pub no_newline_new: bool,
}

impl FileDiff {
    /// `--- /dev/null` marks a file-creation diff.
    pub fn is_creation(&self) -> bool {
        self.old_path.as_deref() == Some("/dev/null")
    }
}

/// Result of a patch application. Mismatched content is data, not an error;
/// every caller must check for `NoMatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(String),
    NoMatch { hunk: usize, detail: String },
}

impl ApplyOutcome {
    pub fn applied(self) -> Option<String> {
        match self {
            ApplyOutcome::Applied(s) => Some(s),
            ApplyOutcome::NoMatch { .. } => None,
        }
    }
}

/// Outcome of a safety or target-path screen.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SafetyCheck {
    pub safe: bool,
    pub reason: Option<String>,
}

impl SafetyCheck {
    fn ok() -> Self {
        Self { safe: true, reason: None }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

/// Substrings in added lines that mark a diff as unsafe to auto-approve.
const EXEC_PATTERNS: &[&str] = &[
    "eval(",
    "exec(",
    "os.system(",
    "subprocess.",
    "child_process",
    "sh -c",
    "bash -c",
    "| sh",
    "| bash",
    "rm -rf",
];

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
}

// ---------------------------------------------------------------------------
// parse
// ---------------------------------------------------------------------------

/// Parse unified-diff text into per-file sections.
///
/// Empty input parses to an empty list. Multiple file sections are tolerated;
/// `diff --git` / `index` decoration lines are skipped. Content lines outside
/// any hunk are ignored rather than rejected.
pub fn parse(diff_text: &str) -> Vec<FileDiff> {
    let text = normalize(diff_text);
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut hunk: Option<Hunk> = None;
    // Lines the open hunk still owes per its header counts. While either side
    // is owed, header-looking lines (a removal reading `--- x`) stay content.
    let mut remaining: (usize, usize) = (0, 0);
    // Which side the most recent content line belonged to, for `\ No newline`.
    let mut last_sides: (bool, bool) = (false, false);

    fn flush_hunk(current: &mut Option<FileDiff>, hunk: &mut Option<Hunk>) {
        if let (Some(file), Some(h)) = (current.as_mut(), hunk.take()) {
            file.hunks.push(h);
        }
    }

    for line in text.lines() {
        let in_hunk_body = remaining.0 > 0 || remaining.1 > 0;
        if !in_hunk_body {
            if let Some(rest) = line.strip_prefix("--- ") {
                flush_hunk(&mut current, &mut hunk);
                if let Some(done) = current.take() {
                    if done.old_path.is_some() || done.new_path.is_some() || !done.hunks.is_empty()
                    {
                        files.push(done);
                    }
                }
                current = Some(FileDiff {
                    old_path: Some(header_path(rest)),
                    ..FileDiff::default()
                });
                continue;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                if let Some(file) = current.as_mut() {
                    file.new_path = Some(header_path(rest));
                } else {
                    current = Some(FileDiff {
                        new_path: Some(header_path(rest)),
                        ..FileDiff::default()
                    });
                }
                continue;
            }
            if line.starts_with("@@") {
                flush_hunk(&mut current, &mut hunk);
                if current.is_none() {
                    // Hunks without file headers still apply; synthesize a section.
                    current = Some(FileDiff::default());
                }
                if let Some(h) = parse_hunk_header(line) {
                    remaining = (h.old_count, h.new_count);
                    hunk = Some(h);
                }
                continue;
            }
        }
        if line.starts_with('\\') {
            // `\ No newline at end of file` refers to the preceding line.
            if let Some(file) = current.as_mut() {
                if last_sides.0 {
                    file.no_newline_old = true;
                }
                if last_sides.1 {
                    file.no_newline_new = true;
                }
            }
            continue;
        }
        if let Some(h) = hunk.as_mut() {
            if let Some(rest) = line.strip_prefix('+') {
                h.lines.push(DiffLine::Add(rest.to_string()));
                remaining.1 = remaining.1.saturating_sub(1);
                last_sides = (false, true);
            } else if let Some(rest) = line.strip_prefix('-') {
                h.lines.push(DiffLine::Remove(rest.to_string()));
                remaining.0 = remaining.0.saturating_sub(1);
                last_sides = (true, false);
            } else if let Some(rest) = line.strip_prefix(' ') {
                h.lines.push(DiffLine::Context(rest.to_string()));
                remaining.0 = remaining.0.saturating_sub(1);
                remaining.1 = remaining.1.saturating_sub(1);
                last_sides = (true, true);
            } else if line.is_empty() {
                // Some emitters drop the leading space on blank context lines.
                h.lines.push(DiffLine::Context(String::new()));
                remaining.0 = remaining.0.saturating_sub(1);
                remaining.1 = remaining.1.saturating_sub(1);
                last_sides = (true, true);
            }
            // `diff --git`, `index`, and similar decoration falls through.
        }
    }
    flush_hunk(&mut current, &mut hunk);
    if let Some(done) = current.take() {
        if done.old_path.is_some() || done.new_path.is_some() || !done.hunks.is_empty() {
            files.push(done);
        }
    }
    files
}

/// Strip a `--- ` / `+++ ` header down to its path (drops timestamp suffix).
fn header_path(rest: &str) -> String {
    rest.split('\t').next().unwrap_or(rest).trim().to_string()
}

/// Parse `@@ -a[,b] +c[,d] @@`; counts default to 1 when omitted.
fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let body = line.strip_prefix("@@")?;
    let body = body.split("@@").next()?.trim();
    let mut old = None;
    let mut new = None;
    for token in body.split_whitespace() {
        if let Some(spec) = token.strip_prefix('-') {
            old = parse_range(spec);
        } else if let Some(spec) = token.strip_prefix('+') {
            new = parse_range(spec);
        }
    }
    let (old_start, old_count) = old?;
    let (new_start, new_count) = new?;
    Some(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
    })
}

fn parse_range(spec: &str) -> Option<(usize, usize)> {
    match spec.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((spec.parse().ok()?, 1)),
    }
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Apply `diff_text` to `original` with the given fuzz tolerance.
///
/// Hunks are located at their stated position first, then by an expanding
/// search over nearby positions. Within a candidate position, removed lines
/// must match exactly; up to `fuzz` context lines may mismatch. All file
/// sections are applied in order against the same content (the target here is
/// always a single skill file).
pub fn apply(original: &str, diff_text: &str, fuzz: usize) -> ApplyOutcome {
    let files = parse(diff_text);
    let total_hunks: usize = files.iter().map(|f| f.hunks.len()).sum();
    if total_hunks == 0 {
        return ApplyOutcome::NoMatch {
            hunk: 0,
            detail: "no hunks parsed from diff text".to_string(),
        };
    }

    let original = normalize(original);
    let mut lines = split_lines(&original);
    let mut no_trailing_newline = false;
    let mut hunk_no = 0usize;

    for file in &files {
        let mut offset: i64 = 0;
        for hunk in &file.hunks {
            hunk_no += 1;
            let intended = hunk.old_start.saturating_sub(1) as i64 + offset;
            let Some(pos) = locate_hunk(&lines, hunk, intended, fuzz) else {
                return ApplyOutcome::NoMatch {
                    hunk: hunk_no,
                    detail: format!(
                        "context for hunk {} (old line {}) not found within fuzz {}",
                        hunk_no, hunk.old_start, fuzz
                    ),
                };
            };
            let (new_lines, consumed, produced) = splice_hunk(&lines, pos, hunk);
            lines = new_lines;
            offset = pos as i64 - hunk.old_start.saturating_sub(1) as i64
                + (produced as i64 - consumed as i64);
        }
        no_trailing_newline = file.no_newline_new;
    }

    let mut out = lines.join("\n");
    if !out.is_empty() && !no_trailing_newline {
        out.push('\n');
    }
    ApplyOutcome::Applied(out)
}

fn split_lines(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let mut v: Vec<String> = content.split('\n').map(|s| s.to_string()).collect();
    if content.ends_with('\n') {
        v.pop();
    }
    v
}

/// Number of original lines a hunk consumes (context + removals).
fn hunk_old_len(hunk: &Hunk) -> usize {
    hunk.lines
        .iter()
        .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Remove(_)))
        .count()
}

/// Search for a position where the hunk matches, starting at `intended` and
/// expanding outward one line at a time.
fn locate_hunk(lines: &[String], hunk: &Hunk, intended: i64, fuzz: usize) -> Option<usize> {
    let max_pos = lines.len().saturating_sub(hunk_old_len(hunk)) as i64;
    let mut candidates = Vec::new();
    let clamp = |p: i64| -> Option<i64> { (0..=max_pos).contains(&p).then_some(p) };
    if let Some(p) = clamp(intended) {
        candidates.push(p);
    }
    for d in 1..=(lines.len() as i64 + 1) {
        let mut any = false;
        for p in [intended - d, intended + d] {
            if let Some(p) = clamp(p) {
                candidates.push(p);
                any = true;
            }
        }
        // Once both probes fall outside the valid range they stay outside.
        if !any {
            break;
        }
    }
    candidates
        .into_iter()
        .find(|&p| matches_at(lines, p as usize, hunk, fuzz))
        .map(|p| p as usize)
}

fn matches_at(lines: &[String], pos: usize, hunk: &Hunk, fuzz: usize) -> bool {
    let mut idx = pos;
    let mut mismatched_context = 0usize;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(expected) => {
                match lines.get(idx) {
                    Some(actual) if actual == expected => {}
                    Some(_) => {
                        mismatched_context += 1;
                        if mismatched_context > fuzz {
                            return false;
                        }
                    }
                    None => return false,
                }
                idx += 1;
            }
            DiffLine::Remove(expected) => {
                // Removals must match exactly; fuzz applies to context only.
                match lines.get(idx) {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                }
                idx += 1;
            }
            DiffLine::Add(_) => {}
        }
    }
    true
}

/// Apply a hunk at a verified position. Context lines keep the file's actual
/// content (a fuzz match must not overwrite drifted context).
fn splice_hunk(lines: &[String], pos: usize, hunk: &Hunk) -> (Vec<String>, usize, usize) {
    let mut out: Vec<String> = lines[..pos].to_vec();
    let mut idx = pos;
    let mut consumed = 0usize;
    let mut produced = 0usize;
    for line in &hunk.lines {
        match line {
            DiffLine::Context(_) => {
                if let Some(actual) = lines.get(idx) {
                    out.push(actual.clone());
                    produced += 1;
                }
                idx += 1;
                consumed += 1;
            }
            DiffLine::Remove(_) => {
                idx += 1;
                consumed += 1;
            }
            DiffLine::Add(text) => {
                out.push(text.clone());
                produced += 1;
            }
        }
    }
    out.extend_from_slice(&lines[idx.min(lines.len())..]);
    (out, consumed, produced)
}

// ---------------------------------------------------------------------------
// reverse
// ---------------------------------------------------------------------------

/// Derive the inverse diff: markers swapped in place, old/new header paths and
/// line-count ranges exchanged per hunk. Applying the result to the patched
/// content reproduces the original.
pub fn reverse(diff_text: &str) -> String {
    let files = parse(diff_text);
    let mut out = String::new();
    for file in &files {
        let old = file.new_path.clone().unwrap_or_else(|| "a".to_string());
        let new = file.old_path.clone().unwrap_or_else(|| "b".to_string());
        out.push_str(&format!("--- {}\n+++ {}\n", old, new));
        for hunk in &file.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.new_start, hunk.new_count, hunk.old_start, hunk.old_count
            ));
            for line in &hunk.lines {
                match line {
                    DiffLine::Context(s) => {
                        out.push(' ');
                        out.push_str(s);
                        out.push('\n');
                    }
                    DiffLine::Add(s) => {
                        out.push('-');
                        out.push_str(s);
                        out.push('\n');
                    }
                    DiffLine::Remove(s) => {
                        out.push('+');
                        out.push_str(s);
                        out.push('\n');
                    }
                }
            }
        }
        if file.no_newline_old {
            // Old side becomes the new side of the inverse.
            out.push_str("\\ No newline at end of file\n");
        }
    }
    out
}

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

/// Produce a minimal unified diff from `old` to `new` via `diffy`.
/// `old == ""` renders a `/dev/null` creation diff. Identical inputs produce
/// an empty string (which `check_safety` rejects as an empty diff).
pub fn create(old: &str, new: &str) -> String {
    create_named(old, new, "original", "modified")
}

/// Like [`create`], with explicit header paths.
pub fn create_named(old: &str, new: &str, old_path: &str, new_path: &str) -> String {
    let old_n = normalize(old);
    let new_n = normalize(new);
    if old_n == new_n {
        return String::new();
    }
    if old_n.is_empty() {
        return creation_diff(&new_n, new_path);
    }
    let patch = diffy::create_patch(&old_n, &new_n).to_string();
    rewrite_headers(&patch, old_path, new_path)
}

fn creation_diff(new: &str, new_path: &str) -> String {
    let lines = split_lines(new);
    let mut out = format!("--- /dev/null\n+++ {}\n", new_path);
    out.push_str(&format!("@@ -0,0 +1,{} @@\n", lines.len()));
    for line in &lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    if !new.is_empty() && !new.ends_with('\n') {
        out.push_str("\\ No newline at end of file\n");
    }
    out
}

/// Replace diffy's fixed `original`/`modified` header names.
fn rewrite_headers(patch: &str, old_path: &str, new_path: &str) -> String {
    let mut out = String::with_capacity(patch.len());
    let mut seen_old = false;
    let mut seen_new = false;
    for line in patch.lines() {
        if !seen_old && line.starts_with("--- ") {
            out.push_str(&format!("--- {}", old_path));
            seen_old = true;
        } else if !seen_new && line.starts_with("+++ ") {
            out.push_str(&format!("+++ {}", new_path));
            seen_new = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// safety screens
// ---------------------------------------------------------------------------

/// Screen diff text for patterns that must never ride in on an automated
/// approval: execution idioms in added lines and path-traversal sequences
/// anywhere in the text. Empty diffs are rejected outright.
pub fn check_safety(diff_text: &str) -> SafetyCheck {
    if diff_text.trim().is_empty() {
        return SafetyCheck::rejected("empty diff");
    }
    let text = normalize(diff_text);
    if text.contains("../") || text.contains("..\\") {
        return SafetyCheck::rejected("diff contains path traversal sequence");
    }
    for line in text.lines() {
        let Some(added) = line.strip_prefix('+') else {
            continue;
        };
        if line.starts_with("+++") {
            continue;
        }
        for pat in EXEC_PATTERNS {
            if added.contains(pat) {
                return SafetyCheck::rejected(format!(
                    "added line contains execution pattern {:?}",
                    pat
                ));
            }
        }
    }
    SafetyCheck::ok()
}

/// Verify every header path in the diff falls under one of the allowed
/// directory prefixes (after stripping `a/`, `b/`, `./`). `/dev/null` is
/// exempt. A diff with no recognizable target path is rejected.
pub fn check_target_paths(diff_text: &str, allowed: &[String]) -> SafetyCheck {
    let files = parse(diff_text);
    if files.is_empty() {
        return SafetyCheck::rejected("no file sections in diff");
    }
    let mut saw_path = false;
    for file in &files {
        for path in [file.old_path.as_deref(), file.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            if path == "/dev/null" {
                continue;
            }
            saw_path = true;
            let stripped = path
                .strip_prefix("a/")
                .or_else(|| path.strip_prefix("b/"))
                .or_else(|| path.strip_prefix("./"))
                .unwrap_or(path);
            if stripped.contains("..") {
                return SafetyCheck::rejected(format!("target path {:?} contains traversal", path));
            }
            if !allowed.iter().any(|prefix| stripped.starts_with(prefix.as_str())) {
                return SafetyCheck::rejected(format!(
                    "target path {:?} is outside allowed directories",
                    path
                ));
            }
        }
    }
    if !saw_path {
        return SafetyCheck::rejected("no target path in diff headers");
    }
    SafetyCheck::ok()
}
