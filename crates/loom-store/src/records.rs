//! Message type tags and link relations.

/// Content type of a repository announcement.
pub const GIT_REPO_TYPE: &str = "git-repo";

/// Content type of a push to a repository.
pub const GIT_UPDATE_TYPE: &str = "git-update";

/// Content type of a name/avatar assertion.
pub const ABOUT_TYPE: &str = "about";

/// Content type of a vote ("dig").
pub const VOTE_TYPE: &str = "vote";

/// Content type of an issue.
pub const ISSUE_TYPE: &str = "issue";

/// Content type of a pull request.
pub const PULL_REQUEST_TYPE: &str = "pull-request";

/// Content type of a state change or rename of an issue or pull request.
pub const ISSUE_EDIT_TYPE: &str = "issue-edit";

/// Content type of a comment or plain post.
pub const POST_TYPE: &str = "post";

/// Message types that show up in activity feeds.
pub const FEED_TYPES: &[&str] = &[
    GIT_REPO_TYPE,
    GIT_UPDATE_TYPE,
    ISSUE_TYPE,
    PULL_REQUEST_TYPE,
];

/// Prefix of message ids.
pub const MSG_SIGIL: char = '%';

/// Prefix of feed ids.
pub const FEED_SIGIL: char = '@';

/// Prefix of blob ids.
pub const BLOB_SIGIL: char = '&';
