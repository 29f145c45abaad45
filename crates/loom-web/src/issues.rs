//! Issue, pull request and compare pages.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Redirect, Response},
};
use futures_util::{StreamExt, stream};
use loom_store::{GitRepo, Message, StoreError};
use loom_view::compare::{COMPARE_COMMIT_LIMIT, Comparison, compare};
use loom_view::issues::{Issue, IssueKind, PullTarget, StateFilter, ThreadEntry, ThreadEvent, get_issue, list_issues, thread};
use loom_view::repos::{default_branch, forks};
use loom_view::{NAME_LOOKUP_CONCURRENCY, Translator, ViewError, fallback_name};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WebError;
use crate::html::{error_section, format_date, href, html_escape, item_error, link, url_segment};
use crate::routes::{
    AppState, DiffRevs, IdKind, LocaleParams, PageParams, commit_row, feed_name_html, page, render_file_diff,
    repo_message, repo_name_html, require, translator,
};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct IssueParams {
    state: Option<String>,
    locale: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompareParams {
    base: Option<String>,
    /// `branch` of this repository or `%repo:branch` of another.
    head: Option<String>,
    locale: Option<String>,
}

fn title_of(t: &Translator, issue: &Issue) -> String {
    if issue.title.is_empty() {
        t.t("Untitled")
    } else {
        issue.title.clone()
    }
}

fn state_badge(t: &Translator, open: bool) -> String {
    let (class, key) = if open { ("open", "Open") } else { ("closed", "Closed") };
    format!(r#"<span class="state {}">{}</span>"#, class, html_escape(&t.t(key)))
}

/// Linked name of a repository, looked up through its announcing message.
async fn repo_label(state: &AppState, repo: &str) -> String {
    match state.log.get(repo).await {
        Ok(message) => repo_name_html(state, message.author(), repo).await,
        Err(e) => {
            warn!(repo = %repo, error = %e, "web: repo lookup failed");
            format!("{}{}", link(&href(repo, ""), &fallback_name(repo)), item_error(&e.to_string()))
        }
    }
}

async fn heads(repo: &dyn GitRepo) -> Result<Vec<String>, StoreError> {
    Ok(repo.ref_names().await?.remove("heads").unwrap_or_default())
}

pub(crate) async fn issues_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<IssueParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    issue_list(&state, &id, IssueKind::Issue, &params, &headers).await
}

pub(crate) async fn pulls_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<IssueParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    issue_list(&state, &id, IssueKind::PullRequest, &params, &headers).await
}

async fn issue_list(
    state: &AppState,
    id: &str,
    kind: IssueKind,
    params: &IssueParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(state, headers, params.locale.as_deref()).await?;
    let filter = StateFilter::parse(params.state.as_deref())?;
    let message = repo_message(state, id).await?;
    let name = state.about.get_repo_name(message.author(), id).await?;
    let issues = list_issues(&*state.log, id, kind, filter).await?;

    let (rest, heading, empty) = match kind {
        IssueKind::Issue => ("issues", "Issues", "NoIssues"),
        IssueKind::PullRequest => ("pulls", "PullRequests", "NoPullRequests"),
    };
    let tabs: Vec<String> = [
        (StateFilter::Open, "Open"),
        (StateFilter::Closed, "Closed"),
        (StateFilter::All, "All"),
    ]
    .iter()
    .map(|(tab, key)| {
        if *tab == filter {
            format!("<strong>{}</strong>", html_escape(&t.t(key)))
        } else {
            link(&format!("{}?state={}", href(id, rest), tab.as_str()), &t.t(key))
        }
    })
    .collect();

    let mut body = format!(
        r#"<h1>{}</h1><h2>{}</h2><nav class="states">{}</nav>"#,
        link(&href(id, ""), &name),
        html_escape(&t.t(heading)),
        tabs.join(" "),
    );
    if issues.is_empty() {
        body.push_str(&format!("<p>{}</p>", html_escape(&t.t(empty))));
    }
    let t = &*t;
    let rows: Vec<String> = stream::iter(issues)
        .map(|issue| async move {
            let author = feed_name_html(state, &issue.author).await;
            format!(
                r#"<div class="issue">{} {} <span class="author">{}</span> <span class="date">{}</span></div>"#,
                link(&href(&issue.id, ""), &title_of(t, &issue)),
                state_badge(t, issue.open),
                author,
                format_date(issue.created),
            )
        })
        .buffered(NAME_LOOKUP_CONCURRENCY)
        .collect()
        .await;
    for row in rows {
        body.push_str(&row);
    }
    Ok(page(t, &name, &body))
}

/// Repositories and branches a pull request compares.
struct PullSides {
    base: Arc<dyn GitRepo>,
    base_branch: String,
    head: Arc<dyn GitRepo>,
    head_branch: String,
}

async fn branch_or_default(repo: &dyn GitRepo, branch: Option<&str>) -> Result<String, WebError> {
    match branch {
        Some(branch) => Ok(branch.to_string()),
        None => default_branch(repo)
            .await?
            .ok_or_else(|| ViewError::not_found(format!("{} has no branches", repo.id())).into()),
    }
}

async fn pull_sides(state: &AppState, issue: &Issue, pull: &PullTarget) -> Result<PullSides, WebError> {
    let (base, head) = tokio::try_join!(state.repos.get_repo(&issue.repo), state.repos.get_repo(&pull.head_repo))?;
    let base_branch = branch_or_default(&*base, pull.base_branch.as_deref()).await?;
    let head_branch = branch_or_default(&*head, pull.head_branch.as_deref()).await?;
    Ok(PullSides {
        base,
        base_branch,
        head,
        head_branch,
    })
}

/// `/%issue` and `/%pull-request`: the header, the discussion and, for a
/// pull request, what it would merge.
pub(crate) async fn issue_page(
    state: &AppState,
    message: &Message,
    params: &PageParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(state, headers, params.locale.as_deref()).await?;
    let issue = get_issue(&*state.log, &message.key).await?;
    let title = title_of(&t, &issue);
    let author = feed_name_html(state, &issue.author).await;
    let date = format_date(issue.created);

    let mut body = format!(
        r#"<p class="repo">{}</p><h1>{} {}</h1><p class="opened">{}</p>"#,
        repo_label(state, &issue.repo).await,
        html_escape(&title),
        state_badge(&t, issue.open),
        t.t_with("issue.opened", &[("author", author.as_str()), ("date", date.as_str())]),
    );
    if !issue.text.is_empty() {
        body.push_str(&format!(r#"<div class="text"><pre>{}</pre></div>"#, html_escape(&issue.text)));
    }

    let mut sides = None;
    if let Some(pull) = &issue.pull {
        match pull_sides(state, &issue, pull).await {
            Ok(found) => {
                let base = format!("{}:{}", repo_label(state, &issue.repo).await, html_escape(&found.base_branch));
                let head = format!("{}:{}", repo_label(state, &pull.head_repo).await, html_escape(&found.head_branch));
                body.push_str(&format!(
                    r#"<p class="merge">{}</p>"#,
                    t.t_with("pullRequest.wantsToMerge", &[("head", head.as_str()), ("base", base.as_str())])
                ));
                sides = Some(found);
            }
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "web: pull request repos unavailable");
                body.push_str(&error_section(&e.to_string()));
            }
        }
    }

    match thread(&*state.log, &issue).await {
        Ok(entries) => {
            for entry in &entries {
                body.push_str(&render_thread_entry(state, &t, &issue, entry).await);
            }
        }
        Err(e) => body.push_str(&error_section(&e.to_string())),
    }

    if let (Some(sides), Some(pull)) = (sides, &issue.pull) {
        match compare(&*sides.base, &sides.base_branch, &*sides.head, &sides.head_branch).await {
            Ok(cmp) => body.push_str(&render_comparison(&t, &issue.repo, &pull.head_repo, &cmp)),
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "web: pull request comparison failed");
                body.push_str(&error_section(&e.to_string()));
            }
        }
    }
    Ok(page(&t, &title, &body))
}

async fn render_thread_entry(state: &AppState, t: &Translator, issue: &Issue, entry: &ThreadEntry) -> String {
    let author = feed_name_html(state, &entry.author).await;
    let what = match &entry.event {
        ThreadEvent::Comment(text) => format!(
            r#"{}<div class="text"><pre>{}</pre></div>"#,
            html_escape(&t.t("issue.commented")),
            html_escape(text)
        ),
        ThreadEvent::Edited { open, title } => {
            let mut parts = Vec::new();
            match open {
                Some(true) => parts.push(html_escape(&t.t("issue.reopened"))),
                Some(false) => parts.push(html_escape(&t.t("issue.closed"))),
                None => {}
            }
            if let Some(title) = title {
                let title = html_escape(title);
                parts.push(t.t_with("issue.renamed", &[("title", title.as_str())]));
            }
            parts.join(", ")
        }
        ThreadEvent::BranchUpdated(Some(rev)) => {
            let head = issue.pull.as_ref().map(|p| p.head_repo.as_str()).unwrap_or(&issue.repo);
            let rev_link = link(&href(head, &format!("commit/{}", url_segment(rev))), rev.get(..8).unwrap_or(rev));
            t.t_with("pullRequest.pushed", &[("rev", rev_link.as_str())])
        }
        ThreadEvent::BranchUpdated(None) => html_escape(&t.t("pullRequest.deletedBranch")),
    };
    format!(
        r#"<div class="event">{} {} <span class="date">{}</span></div>"#,
        author,
        what,
        format_date(entry.timestamp)
    )
}

fn render_comparison(t: &Translator, base_repo: &str, head_repo: &str, cmp: &Comparison) -> String {
    if cmp.is_empty() {
        return format!("<p>{}</p>", html_escape(&t.t("NothingToCompare")));
    }
    let mut html = format!("<h2>{}</h2>", html_escape(&t.t("Commits")));
    for commit in &cmp.commits {
        html.push_str(&commit_row(head_repo, commit));
    }
    if cmp.truncated {
        let limit = COMPARE_COMMIT_LIMIT.to_string();
        html.push_str(&format!(
            r#"<p class="paginate">{}</p>"#,
            html_escape(&t.t_with("MoreCommits", &[("count", limit.as_str())]))
        ));
    }
    html.push_str(&format!(
        "<h2>{}</h2>",
        html_escape(&t.t_count("FilesChanged", cmp.files.len() as i64, &[]))
    ));
    let revs = DiffRevs {
        before: Some((base_repo, cmp.base.as_str())),
        after: (head_repo, cmp.head.as_str()),
    };
    for file in &cmp.files {
        html.push_str(&render_file_diff(t, revs, file));
    }
    html
}

fn radio(name: &str, value: &str, label: &str, checked: bool) -> String {
    format!(
        r#"<label><input type="radio" name="{}" value="{}"{}> {}</label><br>"#,
        name,
        html_escape(value),
        if checked { " checked" } else { "" },
        label
    )
}

/// `/%repo/compare`: pick a base branch here and a head branch here or in
/// any fork.
pub(crate) async fn compare_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let repo = state.repos.get_repo(&id).await?;
    let branches = heads(&*repo).await?;
    let preferred = default_branch(&*repo).await?;

    let mut body = format!(
        "<h1>{}</h1><h2>{}</h2>",
        link(&href(&id, ""), &name),
        html_escape(&t.t("CompareChanges"))
    );
    if branches.is_empty() {
        body.push_str(&format!("<p>{}</p>", html_escape(&t.t("NoBranches"))));
        return Ok(page(&t, &name, &body));
    }

    let mut base_html = String::new();
    let mut head_html = String::new();
    for branch in &branches {
        let checked = preferred.as_deref() == Some(branch.as_str());
        base_html.push_str(&radio("base", branch, &html_escape(branch), checked));
        let label = format!("{}:{}", html_escape(&name), html_escape(branch));
        head_html.push_str(&radio("head", &format!("{}:{}", id, branch), &label, false));
    }
    for fork in forks(&*state.log, &state.about, &id).await? {
        let owner = feed_name_html(&state, &fork.owner).await;
        let fork_name = fork.name.unwrap_or_else(|_| fallback_name(&fork.id));
        let fork_branches = match state.repos.get_repo(&fork.id).await {
            Ok(fork_repo) => heads(&*fork_repo).await,
            Err(e) => Err(e),
        };
        match fork_branches {
            Ok(fork_branches) => {
                for branch in fork_branches {
                    let label = format!("{} / {}:{}", owner, html_escape(&fork_name), html_escape(&branch));
                    head_html.push_str(&radio("head", &format!("{}:{}", fork.id, branch), &label, false));
                }
            }
            Err(e) => {
                warn!(fork = %fork.id, error = %e, "web: fork branches unavailable");
                head_html.push_str(&format!("{} / {}{}<br>", owner, html_escape(&fork_name), item_error(&e.to_string())));
            }
        }
    }

    body.push_str(&format!(
        r#"<form method="get" action="{}"><fieldset><legend>{}</legend>{}</fieldset><fieldset><legend>{}</legend>{}</fieldset><button type="submit">{}</button></form>"#,
        html_escape(&href(&id, "comparing")),
        html_escape(&t.t("Base")),
        base_html,
        html_escape(&t.t("Head")),
        head_html,
        html_escape(&t.t("Compare")),
    ));
    Ok(page(&t, &name, &body))
}

/// `/%repo/comparing?base=master&head=%fork:feature`
pub(crate) async fn comparing_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<CompareParams>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    require(&id, IdKind::Msg)?;
    let base = params.base.as_deref().filter(|b| !b.is_empty());
    let head = params.head.as_deref().filter(|h| !h.is_empty());
    let (Some(base), Some(head)) = (base, head) else {
        return Ok(Redirect::to(&href(&id, "compare")).into_response());
    };
    let (head_id, head_branch) = head.split_once(':').unwrap_or((id.as_str(), head));
    require(head_id, IdKind::Msg)?;

    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let (base_repo, head_repo) = tokio::try_join!(state.repos.get_repo(&id), state.repos.get_repo(head_id))?;
    let cmp = compare(&*base_repo, base, &*head_repo, head_branch).await?;
    debug!(repo = %id, base = %base, head = %head, commits = cmp.commits.len(), "web: comparing");

    let head_label = if head_id == id {
        link(&href(&id, ""), &name)
    } else {
        repo_label(&state, head_id).await
    };
    let body = format!(
        r#"<h1>{}</h1><h2>{}</h2><p class="sides">{} {}:{} &larr; {} {}:{}</p>{}"#,
        link(&href(&id, ""), &name),
        html_escape(&t.t("CompareChanges")),
        html_escape(&t.t("Base")),
        link(&href(&id, ""), &name),
        html_escape(base),
        html_escape(&t.t("Head")),
        head_label,
        html_escape(head_branch),
        render_comparison(&t, &id, head_id, &cmp),
    );
    Ok(page(&t, &name, &body).into_response())
}
