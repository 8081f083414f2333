use rand::Rng;
use regex::Regex;

/// Sanitize an issue title into the branch-name segment: lowercase, non-alphanumeric runs
/// collapsed to a single '-', trimmed of leading/trailing '-', truncated to 25 chars.
///
/// A title made up entirely of non-alphanumeric characters sanitizes to the empty string; the
/// branch grammar tolerates that (double dash: `ai-fix/<n>--<ts>-...`).
pub fn sanitize_branch_title(title: &str) -> String {
    let lower = title.to_lowercase();
    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    let slug = re.replace_all(&lower, "-");
    let trimmed = slug.trim_matches('-');
    let cut: String = trimmed.chars().take(25).collect();
    cut.trim_end_matches('-').to_string()
}

/// 3-character lowercase alphanumeric salt used to guarantee uniqueness of worktree/branch/
/// container names for a given (issue, model, timestamp).
pub fn random_salt(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_normal_title() {
        assert_eq!(sanitize_branch_title("Fix the Bug!!"), "fix-the-bug");
    }

    #[test]
    fn empty_title_sanitizes_to_empty() {
        assert_eq!(sanitize_branch_title(""), "");
    }

    #[test]
    fn non_alnum_only_title_sanitizes_to_empty() {
        assert_eq!(sanitize_branch_title("!!!@@@###"), "");
    }

    #[test]
    fn truncates_to_25_chars() {
        let title = "a".repeat(40);
        assert_eq!(sanitize_branch_title(&title).len(), 25);
    }

    #[test]
    fn salt_has_requested_length() {
        assert_eq!(random_salt(3).len(), 3);
    }
}
