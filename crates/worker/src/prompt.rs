use hosting::types::{Comment, Issue};

const PROHIBITIONS: &str = "Do not run git commit, git push, git checkout, git branch, git merge, \
     or any other git workflow command. Do not run `git init` or delete the `.git` directory. \
     Committing, pushing, and opening the pull request are handled outside this process.";

/// Builds the subprocess prompt for a fresh issue-fix run. Pre-fetched issue data and non-bot
/// comments are inlined so the subprocess doesn't need its own hosting-service calls.
pub fn build_issue_prompt(
    owner: &str,
    repo: &str,
    branch_name: &str,
    model: &str,
    issue: &Issue,
    comments: &[Comment],
    bot_username: &str,
    retry: bool,
) -> String {
    let mut out = String::new();
    if retry {
        out.push_str("RETRY NOTICE: a previous attempt at this task did not complete successfully. \
            Re-read the issue and existing branch state carefully before proceeding.\n\n");
    }

    out.push_str(&format!(
        "You are working in repository {owner}/{repo} on branch `{branch_name}` using model `{model}`.\n\n"
    ));
    out.push_str(&format!("## Issue #{}: {}\n\n", issue.number, issue.title));
    out.push_str(issue.body.as_deref().unwrap_or("(no description provided)"));
    out.push_str("\n\n");
    if !issue.labels.is_empty() {
        out.push_str(&format!("Labels: {}\n\n", issue.labels.join(", ")));
    }

    let human_comments: Vec<&Comment> = comments.iter().filter(|c| c.author != bot_username).collect();
    if !human_comments.is_empty() {
        out.push_str("## Discussion\n\n");
        for c in human_comments {
            out.push_str(&format!("**{}**: {}\n\n", c.author, c.body));
        }
    }

    out.push_str(
        "## Steps\n\n1. Read the issue above carefully.\n2. Search the codebase for the \
         relevant files and existing conventions.\n3. Implement a fix that addresses the issue.\n\n",
    );
    out.push_str(PROHIBITIONS);
    out.push('\n');
    out
}

/// Short follow-up prompt used for the emergency re-invocation (§4.7 step 8) when the first run
/// reported success but no PR was found - asks only for a PR-ready summary, not new changes.
pub fn build_pr_only_prompt(issue: &Issue) -> String {
    format!(
        "Your previous work on issue #{} ({}) appears complete but no pull request was opened. \
         Do not make further code changes. Summarize the change you made in one paragraph \
         suitable for a pull request description.\n\n{}",
        issue.number, issue.title, PROHIBITIONS
    )
}

/// Builds the subprocess prompt for a PR-comment follow-up run: combined unprocessed comments
/// plus a reverse-chronological history excerpt, explicit instructions to apply only the new
/// request and not touch git state.
pub fn build_pr_comment_prompt(
    owner: &str,
    repo: &str,
    worktree_path: &std::path::Path,
    unprocessed: &[Comment],
    history: &[Comment],
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are working in repository {owner}/{repo}, worktree `{}`.\n\n",
        worktree_path.display()
    ));
    out.push_str("## New requests to apply\n\n");
    for c in unprocessed {
        out.push_str(&format!("**{}**: {}\n\n", c.author, c.body));
    }

    if !history.is_empty() {
        out.push_str("## Prior discussion (most recent first)\n\n");
        let mut sorted: Vec<&Comment> = history.iter().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for c in sorted {
            out.push_str(&format!("**{}**: {}\n\n", c.author, c.body));
        }
    }

    out.push_str("Apply only the new requests above. Do not re-do prior work already present \
         on this branch.\n\n");
    out.push_str(PROHIBITIONS);
    out.push('\n');
    out
}
