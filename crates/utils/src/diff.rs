use similar::{ChangeTag, TextDiff};

/// Converts a before/after pair into a unified diff hunk, without the `---`/`+++` file header.
pub fn create_unified_diff_hunk(old: &str, new: &str) -> String {
    let mut old = old.to_string();
    let mut new = new.to_string();
    if !old.ends_with('\n') {
        old.push('\n');
    }
    if !new.ends_with('\n') {
        new.push('\n');
    }

    let diff = TextDiff::from_lines(&old, &new);
    let old_count = diff.old_slices().len();
    let new_count = diff.new_slices().len();

    let mut out = format!("@@ -0,{old_count} +0,{new_count} @@\n");
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Equal => ' ',
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
        };
        out.push(sign);
        out.push_str(change.value());
    }
    out
}

/// Full unified diff with a file-path header, used when formatting `git diff` output for a
/// single file into the State Store's `diff` channel payload.
pub fn create_unified_diff(file_path: &str, old: &str, new: &str) -> String {
    let mut out = format!("--- a/{file_path}\n+++ b/{file_path}\n");
    out.push_str(&create_unified_diff_hunk(old, new));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_diff_hunk_replaces_lines() {
        let hunk = create_unified_diff_hunk("a\nb\n", "a\nc\n");
        assert!(hunk.contains("-b"));
        assert!(hunk.contains("+c"));
        assert!(hunk.contains(" a"));
    }
}
