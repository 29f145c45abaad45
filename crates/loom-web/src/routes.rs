//! Web routes.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use futures_util::{StreamExt, stream};
use loom_store::git::MODE_SUBMODULE;
use loom_store::{
    BLOB_SIGIL, BlobStore, Commit, Content, FEED_SIGIL, FEED_TYPES, GitRepo, GitRepoContent,
    LogStore, MSG_SIGIL, Message, RepoStore, TreeEntry,
};
use loom_view::diff::{DiffLine, FileContent, FileDiff, Side};
use loom_view::paginate::{commit_page, feed_page};
use loom_view::repos::{default_branch, dug_repos, forks, repo_activity, user_repos};
use loom_view::{
    AboutResolver, Catalogs, ChangeKind, Cursor, DiffSides, FeedPage, FeedQuery, LineTag,
    NAME_LOOKUP_CONCURRENCY, Paged, Translator, ViewError, VoteAggregator, fallback_name,
};
use serde::Deserialize;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

use crate::error::WebError;
use crate::html::{error_section, format_date, href, html_escape, item_error, layout, link, url_segment};
use crate::issues::{compare_page, comparing_page, issue_page, issues_page, pulls_page};

/// Shared state for the web server.
pub struct AppState {
    pub log: Arc<dyn LogStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub repos: Arc<dyn RepoStore>,
    pub about: AboutResolver,
    pub votes: VoteAggregator,
    pub catalogs: Catalogs,
    /// Items per feed page and commits per log page.
    pub page_size: usize,
}

impl AppState {
    /// Build the state and start the live read models for `viewer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        log: Arc<dyn LogStore>,
        blobs: Arc<dyn BlobStore>,
        repos: Arc<dyn RepoStore>,
        viewer: &str,
        catalogs: Catalogs,
        page_size: usize,
    ) -> Self {
        Self {
            about: AboutResolver::new(Arc::clone(&log), viewer),
            votes: VoteAggregator::new(Arc::clone(&log)),
            log,
            blobs,
            repos,
            catalogs,
            page_size,
        }
    }
}

/// Create the web router.
pub fn create_router(state: Arc<AppState>, static_dir: Option<&FsPath>) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/{id}", get(id_page))
        .route("/{id}/repos", get(user_repos_page))
        .route("/{id}/digs", get(digs_page))
        .route("/{id}/commits", get(commits_page))
        .route("/{id}/commit/{rev}", get(commit_detail))
        .route("/{id}/tree/{rev}", get(tree_root))
        .route("/{id}/tree/{rev}/{*path}", get(tree_page))
        .route("/{id}/blob/{rev}/{*path}", get(blob_page))
        .route("/{id}/raw/{rev}/{*path}", get(raw_file))
        .route("/{id}/activity", get(activity_page))
        .route("/{id}/forks", get(forks_page))
        .route("/{id}/issues", get(issues_page))
        .route("/{id}/pulls", get(pulls_page))
        .route("/{id}/compare", get(compare_page))
        .route("/{id}/comparing", get(comparing_page))
        .with_state(state);

    if let Some(dir) = static_dir {
        router = router.nest_service("/static", ServeDir::new(dir));
    }
    router
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageParams {
    lte: Option<i64>,
    gte: Option<i64>,
    pub(crate) locale: Option<String>,
}

impl PageParams {
    fn cursor(&self) -> Cursor {
        Cursor {
            lte: self.lte,
            gte: self.gte,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CommitParams {
    start: Option<String>,
    branch: Option<String>,
    locale: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LocaleParams {
    pub(crate) locale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdKind {
    Feed,
    Msg,
    Blob,
}

fn id_kind(id: &str) -> Result<IdKind, WebError> {
    match id.chars().next() {
        Some(FEED_SIGIL) => Ok(IdKind::Feed),
        Some(MSG_SIGIL) => Ok(IdKind::Msg),
        Some(BLOB_SIGIL) => Ok(IdKind::Blob),
        _ => Err(WebError::BadRequest(format!("not an id: {}", id))),
    }
}

pub(crate) fn require(id: &str, kind: IdKind) -> Result<(), WebError> {
    if id_kind(id)? == kind {
        Ok(())
    } else {
        Err(WebError::BadRequest(format!("wrong kind of id: {}", id)))
    }
}

pub(crate) async fn translator(
    state: &AppState,
    headers: &HeaderMap,
    locale: Option<&str>,
) -> Result<Arc<Translator>, WebError> {
    let accept = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok());
    Ok(state.catalogs.pick_catalog(accept, locale).await?)
}

pub(crate) fn page(t: &Translator, title: &str, body: &str) -> Html<String> {
    Html(layout(t.locale(), title, body))
}

/// Display name of a feed, or a placeholder with the failure attached.
pub(crate) async fn feed_name_html(state: &AppState, feed: &str) -> String {
    match state.about.get_name(feed).await {
        Ok(name) => link(&href(feed, ""), &name),
        Err(e) => {
            warn!(feed = %feed, error = %e, "web: name lookup failed");
            format!("{}{}", link(&href(feed, ""), &fallback_name(feed)), item_error(&e.to_string()))
        }
    }
}

pub(crate) async fn repo_name_html(state: &AppState, owner: &str, repo: &str) -> String {
    render_repo_name(repo, state.about.get_repo_name(owner, repo).await)
}

pub(crate) fn render_repo_name(repo: &str, name: Result<String, ViewError>) -> String {
    match name {
        Ok(name) => link(&href(repo, ""), &name),
        Err(e) => {
            warn!(repo = %repo, error = %e, "web: repo name lookup failed");
            format!("{}{}", link(&href(repo, ""), &fallback_name(repo)), item_error(&e.to_string()))
        }
    }
}

fn is_feed_message(message: &Message) -> bool {
    FEED_TYPES.contains(&message.content().type_name())
}

async fn render_feed_item(state: &AppState, t: &Translator, message: &Message) -> String {
    let author = message.author();
    let author_html = feed_name_html(state, author).await;
    let action = match message.content() {
        Content::GitRepo(_) => {
            let repo = repo_name_html(state, author, &message.key).await;
            t.t_with("action.createdRepo", &[("repo", repo.as_str())])
        }
        Content::GitUpdate(update) => {
            let repo = repo_name_html(state, author, &update.repo).await;
            let refs = update.refs.len() as i64;
            t.t_count("action.pushed", refs, &[("repo", repo.as_str())])
        }
        Content::Issue(issue) => {
            let title = html_escape(issue.title.as_deref().unwrap_or_default());
            t.t_with("action.openedIssue", &[("title", title.as_str())])
        }
        Content::PullRequest(pr) => {
            let title = html_escape(pr.title.as_deref().unwrap_or_default());
            t.t_with("action.openedPullRequest", &[("title", title.as_str())])
        }
        _ => t.t("action.published"),
    };
    format!(
        r#"<div class="feed-item">{} {} <span class="date">{}</span></div>"#,
        author_html,
        action,
        format_date(message.timestamp())
    )
}

async fn render_feed(
    state: &AppState,
    t: &Translator,
    base: &str,
    paged: Paged<Message>,
) -> String {
    let Some(FeedPage {
        items,
        newer,
        older,
    }) = paged.page()
    else {
        return format!(r#"<p class="empty">{}</p>"#, html_escape(&t.t("NoMessages")));
    };

    let rendered: Vec<String> = stream::iter(items)
        .map(|message| async move { render_feed_item(state, t, &message).await })
        .buffered(NAME_LOOKUP_CONCURRENCY)
        .collect()
        .await;

    let mut html = String::new();
    html.push_str(&paginate_nav(t, base, newer, older));
    for item in rendered {
        html.push_str(&item);
    }
    html.push_str(&paginate_nav(t, base, newer, older));
    html
}

fn paginate_nav(t: &Translator, base: &str, newer: Option<Cursor>, older: Option<Cursor>) -> String {
    let mut nav = String::from(r#"<div class="paginate">"#);
    if let Some(cursor) = newer {
        nav.push_str(&link(&format!("{}?{}", base, cursor.to_query()), &t.t("Newer")));
        nav.push(' ');
    }
    if let Some(cursor) = older {
        nav.push_str(&link(&format!("{}?{}", base, cursor.to_query()), &t.t("Older")));
    }
    nav.push_str("</div>");
    nav
}

fn user_nav(t: &Translator, feed: &str) -> String {
    format!(
        "<nav>{} {} {}</nav>",
        link(&href(feed, ""), &t.t("Activity")),
        link(&href(feed, "repos"), &t.t("Repos")),
        link(&href(feed, "digs"), &t.t("Digs")),
    )
}

async fn index(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let query = FeedQuery::global(state.page_size).with_cursor(params.cursor());
    let paged = feed_page(&*state.log, &query, is_feed_message).await?;
    let feed = render_feed(&state, &t, "/", paged).await;
    let body = format!("<h1>{}</h1>{}", html_escape(&t.t("Feed")), feed);
    Ok(page(&t, &t.t("Feed"), &body))
}

/// `/@feed` is a user's activity, `/%repo` a repository, `/&blob` a blob.
async fn id_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    match id_kind(&id)? {
        IdKind::Feed => Ok(user_page(&state, &id, &params, &headers).await?.into_response()),
        IdKind::Msg => Ok(msg_page(&state, &id, &params, &headers).await?.into_response()),
        IdKind::Blob => serve_blob(&state, &id).await,
    }
}

async fn user_page(
    state: &AppState,
    feed: &str,
    params: &PageParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(state, headers, params.locale.as_deref()).await?;
    let name = state.about.get_name(feed).await?;
    let query = FeedQuery::author(feed, state.page_size).with_cursor(params.cursor());
    let paged = feed_page(&*state.log, &query, is_feed_message).await?;
    let activity = render_feed(state, &t, &href(feed, ""), paged).await;
    let body = format!("<h1>{}</h1>{}{}", html_escape(&name), user_nav(&t, feed), activity);
    Ok(page(&t, &name, &body))
}

/// Repositories, issues and pull requests all live at `/%msg`.
async fn msg_page(
    state: &AppState,
    id: &str,
    params: &PageParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let message = state.log.get(id).await?;
    match message.content() {
        Content::GitRepo(_) => repo_page(state, &message, params, headers).await,
        Content::Issue(_) | Content::PullRequest(_) => issue_page(state, &message, params, headers).await,
        _ => Err(ViewError::not_found(format!("{} has no page", id)).into()),
    }
}

/// The announcing message of a repository, with its owner.
pub(crate) async fn repo_message(state: &AppState, id: &str) -> Result<Message, WebError> {
    require(id, IdKind::Msg)?;
    let message = state.log.get(id).await?;
    match message.content() {
        Content::GitRepo(_) => Ok(message),
        _ => Err(ViewError::not_found(format!("{} is not a repository", id)).into()),
    }
}

fn repo_nav(t: &Translator, id: &str) -> String {
    let links: Vec<String> = [
        ("commits", "Commits"),
        ("activity", "Activity"),
        ("issues", "Issues"),
        ("pulls", "PullRequests"),
        ("forks", "Forks"),
        ("compare", "Compare"),
    ]
    .iter()
    .map(|(rest, key)| link(&href(id, rest), &t.t(key)))
    .collect();
    format!("<nav>{}</nav>", links.join(" "))
}

/// `view/rev/a/b` with every segment encoded.
pub(crate) fn object_path(view: &str, rev: &str, segments: &[String]) -> String {
    let mut path = format!("{}/{}", view, url_segment(rev));
    for segment in segments {
        path.push('/');
        path.push_str(&url_segment(segment));
    }
    path
}

fn breadcrumbs(id: &str, name: &str, rev: &str, segments: &[String]) -> String {
    let mut crumbs = vec![link(&href(id, &object_path("tree", rev, &[])), name)];
    for (i, segment) in segments.iter().enumerate() {
        if i + 1 == segments.len() {
            crumbs.push(html_escape(segment));
        } else {
            crumbs.push(link(&href(id, &object_path("tree", rev, &segments[..=i])), segment));
        }
    }
    format!(r#"<nav class="breadcrumbs">{}</nav>"#, crumbs.join(" / "))
}

fn render_tree(id: &str, rev: &str, dir: &[String], entries: &[TreeEntry]) -> String {
    let mut html = String::from(r#"<ul class="tree">"#);
    for entry in entries {
        let mut path = dir.to_vec();
        path.push(entry.name.clone());
        let item = if entry.is_tree() {
            link(&href(id, &object_path("tree", rev, &path)), &format!("{}/", entry.name))
        } else if entry.mode == MODE_SUBMODULE {
            html_escape(&entry.name)
        } else {
            link(&href(id, &object_path("blob", rev, &path)), &entry.name)
        };
        html.push_str(&format!("<li>{}</li>", item));
    }
    html.push_str("</ul>");
    html
}

async fn repo_page(
    state: &AppState,
    message: &Message,
    params: &PageParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(state, headers, params.locale.as_deref()).await?;
    let id = message.key.as_str();
    let owner = message.author();
    let (name, tally) = tokio::join!(state.about.get_repo_name(owner, id), state.votes.get_votes(id));
    let name = name?;

    let digs = match tally {
        Ok(tally) => link(
            &href(id, "digs"),
            &t.t_count("DigCount", tally.upvotes as i64, &[]),
        ),
        Err(e) => item_error(&e.to_string()),
    };

    let owner_html = feed_name_html(state, owner).await;
    let mut body = format!(
        r#"<h1>{} / {}</h1><p class="digs">{}</p>"#,
        owner_html,
        html_escape(&name),
        digs,
    );
    if let Content::GitRepo(GitRepoContent {
        upstream: Some(upstream),
        ..
    }) = message.content()
    {
        let upstream_html = match state.log.get(upstream).await {
            Ok(up) => repo_name_html(state, up.author(), upstream).await,
            Err(e) => format!("{}{}", link(&href(upstream, ""), &fallback_name(upstream)), item_error(&e.to_string())),
        };
        body.push_str(&format!(
            r#"<p class="upstream">{}</p>"#,
            t.t_with("ForkedFrom", &[("repo", upstream_html.as_str())])
        ));
    }
    body.push_str(&repo_nav(&t, id));

    let repo = state.repos.get_repo(id).await?;
    match default_branch(&*repo).await? {
        None => body.push_str(&format!("<p>{}</p>", html_escape(&t.t("EmptyRepo")))),
        Some(branch) => match repo.read_dir(&branch, &[]).await {
            Ok(entries) => body.push_str(&render_tree(id, &branch, &[], &entries)),
            Err(e) => body.push_str(&error_section(&e.to_string())),
        },
    }
    Ok(page(&t, &name, &body))
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

async fn tree_root(
    State(state): State<Arc<AppState>>,
    Path((id, rev)): Path<(String, String)>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    tree_view(&state, &id, &rev, &[], &params, &headers).await
}

async fn tree_page(
    State(state): State<Arc<AppState>>,
    Path((id, rev, path)): Path<(String, String, String)>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    tree_view(&state, &id, &rev, &path_segments(&path), &params, &headers).await
}

async fn tree_view(
    state: &AppState,
    id: &str,
    rev: &str,
    segments: &[String],
    params: &LocaleParams,
    headers: &HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(state, headers, params.locale.as_deref()).await?;
    let message = repo_message(state, id).await?;
    let name = state.about.get_repo_name(message.author(), id).await?;
    let repo = state.repos.get_repo(id).await?;
    let entries = repo.read_dir(rev, segments).await?;

    let body = format!(
        "<h1>{}</h1>{}{}",
        link(&href(id, ""), &name),
        breadcrumbs(id, &name, rev, segments),
        render_tree(id, rev, segments, &entries),
    );
    Ok(page(&t, &name, &body))
}

/// Split `a/b/file` into its directory segments and file name.
fn split_file_path(path: &str) -> Result<(Vec<String>, String), WebError> {
    let mut segments = path_segments(path);
    match segments.pop() {
        Some(file) => Ok((segments, file)),
        None => Err(WebError::BadRequest("empty file path".to_string())),
    }
}

async fn find_file(repo: &dyn GitRepo, rev: &str, dir: &[String], file: &str) -> Result<TreeEntry, WebError> {
    let entries = repo.read_dir(rev, dir).await?;
    let entry = entries
        .into_iter()
        .find(|e| e.name == file && !e.is_tree())
        .ok_or_else(|| ViewError::not_found(format!("{} at {}", file, rev)))?;
    Ok(entry)
}

async fn blob_page(
    State(state): State<Arc<AppState>>,
    Path((id, rev, path)): Path<(String, String, String)>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let repo = state.repos.get_repo(&id).await?;
    let (dir, file) = split_file_path(&path)?;
    let entry = find_file(&*repo, &rev, &dir, &file).await?;

    let mut segments = dir;
    segments.push(file.clone());
    let raw = href(&id, &object_path("raw", &rev, &segments));
    let mut body = format!(
        r#"<h1>{}</h1>{}<p>{}</p>"#,
        link(&href(&id, ""), &name),
        breadcrumbs(&id, &name, &rev, &segments),
        link(&raw, &t.t("Raw")),
    );
    if content_type(&file).starts_with("image/") {
        body.push_str(&format!(r#"<img src="{}" alt="{}">"#, html_escape(&raw), html_escape(&file)));
    } else {
        let data = repo.read_blob(&entry.id).await?;
        match String::from_utf8(data) {
            Ok(text) => {
                body.push_str(r#"<table class="blob">"#);
                for (i, line) in text.lines().enumerate() {
                    let n = i + 1;
                    body.push_str(&format!(
                        r##"<tr id="L{n}"><td class="line-num"><a href="#L{n}">{n}</a></td><td>{}</td></tr>"##,
                        html_escape(line),
                    ));
                }
                body.push_str("</table>");
            }
            Err(e) => {
                let size = e.as_bytes().len() as i64;
                body.push_str(&format!("<p>{}</p>", html_escape(&t.t_count("Bytes", size, &[]))));
            }
        }
    }
    Ok(page(&t, &file, &body))
}

async fn activity_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let owner = message.author();
    let name = state.about.get_repo_name(owner, &id).await?;
    let updates = repo_activity(&*state.log, &id, owner).await?;

    let mut body = format!(
        "<h1>{}</h1>{}<h2>{}</h2>",
        link(&href(&id, ""), &name),
        repo_nav(&t, &id),
        html_escape(&t.t("Activity")),
    );
    if updates.is_empty() {
        body.push_str(&format!("<p>{}</p>", html_escape(&t.t("NoActivity"))));
    }
    for update in updates {
        body.push_str(&format!(r#"<div class="update"><span class="date">{}</span><ul>"#, format_date(update.timestamp)));
        for r in update.refs {
            let label = if r.is_tag {
                format!("{} ({})", html_escape(&r.name), html_escape(&t.t("Tag")))
            } else {
                html_escape(&r.name)
            };
            let target = match &r.rev {
                Some(rev) => link(
                    &href(&id, &format!("commit/{}", url_segment(rev))),
                    rev.get(..8).unwrap_or(rev),
                ),
                None => html_escape(&t.t("Deleted")),
            };
            body.push_str(&format!("<li>{} &rarr; {}</li>", label, target));
        }
        body.push_str("</ul></div>");
    }
    Ok(page(&t, &name, &body))
}

async fn forks_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let found = forks(&*state.log, &state.about, &id).await?;

    let mut body = format!(
        "<h1>{}</h1>{}<h2>{}</h2>",
        link(&href(&id, ""), &name),
        repo_nav(&t, &id),
        html_escape(&t.t("Forks")),
    );
    if found.is_empty() {
        body.push_str(&format!("<p>{}</p>", html_escape(&t.t("NoForks"))));
    }
    for fork in found {
        let owner = feed_name_html(&state, &fork.owner).await;
        body.push_str(&format!(
            r#"<div class="repo">{} / {} <span class="date">{}</span></div>"#,
            owner,
            render_repo_name(&fork.id, fork.name),
            format_date(fork.created),
        ));
    }
    Ok(page(&t, &name, &body))
}

async fn serve_blob(state: &AppState, id: &str) -> Result<Response, WebError> {
    if !state.blobs.want(id).await? {
        return Err(ViewError::not_found(format!("blob {} is not available", id)).into());
    }
    let data = state.blobs.get_blob(id).await?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        data,
    )
        .into_response())
}

async fn user_repos_page(
    State(state): State<Arc<AppState>>,
    Path(feed): Path<String>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    require(&feed, IdKind::Feed)?;
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let name = state.about.get_name(&feed).await?;
    let repos = user_repos(&*state.log, &state.about, &state.votes, &feed).await?;

    let mut list = String::new();
    if repos.is_empty() {
        list.push_str(&format!("<p>{}</p>", html_escape(&t.t("NoRepos"))));
    }
    for repo in repos {
        let digs = match repo.digs {
            Ok(n) => html_escape(&t.t_count("DigCount", n as i64, &[])),
            Err(e) => item_error(&e.to_string()),
        };
        list.push_str(&format!(
            r#"<div class="repo">{} <span class="digs">{}</span> <span class="date">{}</span></div>"#,
            render_repo_name(&repo.id, repo.name),
            digs,
            format_date(repo.updated),
        ));
    }
    let body = format!("<h1>{}</h1>{}{}", html_escape(&name), user_nav(&t, &feed), list);
    Ok(page(&t, &name, &body))
}

/// `/@feed/digs` lists what a user dug, `/%repo/digs` who dug a repo.
async fn digs_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    match id_kind(&id)? {
        IdKind::Feed => {
            let name = state.about.get_name(&id).await?;
            let dug = dug_repos(&*state.log, &state.about, &id).await?;
            let mut list = String::new();
            if dug.is_empty() {
                list.push_str(&format!("<p>{}</p>", html_escape(&t.t("NoDigs"))));
            }
            for repo in dug {
                let owner = feed_name_html(&state, &repo.owner).await;
                list.push_str(&format!(
                    r#"<div class="repo">{} / {}</div>"#,
                    owner,
                    render_repo_name(&repo.id, repo.name),
                ));
            }
            let body = format!("<h1>{}</h1>{}{}", html_escape(&name), user_nav(&t, &id), list);
            Ok(page(&t, &name, &body))
        }
        IdKind::Msg => {
            let message = repo_message(&state, &id).await?;
            let name = state.about.get_repo_name(message.author(), &id).await?;
            let tally = state.votes.get_votes(&id).await?;
            let state = &state;
            let voters: Vec<String> = stream::iter(tally.upvoters.into_keys())
                .map(|voter| async move { feed_name_html(state, &voter).await })
                .buffered(NAME_LOOKUP_CONCURRENCY)
                .collect()
                .await;

            let mut body = format!(
                "<h1>{}</h1><p>{}</p><ul>",
                link(&href(&id, ""), &name),
                html_escape(&t.t_count("DigCount", tally.upvotes as i64, &[])),
            );
            for voter in voters {
                body.push_str(&format!("<li>{}</li>", voter));
            }
            body.push_str("</ul>");
            Ok(page(&t, &name, &body))
        }
        IdKind::Blob => Err(WebError::BadRequest(format!("blobs have no digs: {}", id))),
    }
}

pub(crate) fn commit_row(repo: &str, commit: &Commit) -> String {
    format!(
        r#"<div class="commit">{} <span class="author">{}</span> <span class="date">{}</span> <code>{}</code></div>"#,
        link(&href(repo, &format!("commit/{}", url_segment(&commit.id))), &commit.title),
        html_escape(&commit.author.name),
        commit.author.date.format("%Y-%m-%d %H:%M"),
        html_escape(commit.id.get(..8).unwrap_or(&commit.id)),
    )
}

async fn commits_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<CommitParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let repo = state.repos.get_repo(&id).await?;

    let branch = match params.branch {
        Some(branch) => branch,
        None => match default_branch(&*repo).await? {
            Some(branch) => branch,
            None => {
                let body = format!("<h1>{}</h1><p>{}</p>", html_escape(&name), html_escape(&t.t("EmptyRepo")));
                return Ok(page(&t, &name, &body));
            }
        },
    };
    let log = commit_page(&*repo, &branch, params.start.as_deref(), state.page_size).await?;
    debug!(repo = %id, branch = %branch, commits = log.commits.len(), "web: commit page");

    let mut body = format!(
        "<h1>{}</h1><h2>{}</h2>",
        link(&href(&id, ""), &name),
        html_escape(&t.t_with("CommitsOn", &[("branch", branch.as_str())])),
    );
    if !log.is_first {
        body.push_str(r#"<div class="paginate">&hellip;</div>"#);
    }
    for commit in &log.commits {
        body.push_str(&commit_row(&id, commit));
    }
    if let Some(older) = &log.older {
        let target = format!(
            "{}?branch={}&start={}",
            href(&id, "commits"),
            url_segment(&branch),
            url_segment(older)
        );
        body.push_str(&format!(r#"<div class="paginate">{}</div>"#, link(&target, &t.t("Older"))));
    }
    Ok(page(&t, &name, &body))
}

fn render_line(filename: &str, line: &DiffLine) -> String {
    let class = match line.tag {
        LineTag::Added => "added",
        LineTag::Removed => "removed",
        LineTag::Context => "context",
    };
    let marker = match line.tag {
        LineTag::Added => '+',
        LineTag::Removed => '-',
        LineTag::Context => ' ',
    };
    let num = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_default();
    let anchor = html_escape(&line.anchor(filename));
    format!(
        r##"<tr class="{}" id="{}"><td class="line-num"><a href="#{}">{}</a></td><td class="line-num">{}</td><td>{}{}</td></tr>"##,
        class,
        anchor,
        anchor,
        num(line.old_line),
        num(line.new_line),
        marker,
        html_escape(&line.text),
    )
}

/// Repository and revision each side of a diff can be viewed at. A root
/// commit has nothing before it.
#[derive(Clone, Copy)]
pub(crate) struct DiffRevs<'a> {
    pub(crate) before: Option<(&'a str, &'a str)>,
    pub(crate) after: (&'a str, &'a str),
}

impl<'a> DiffRevs<'a> {
    fn of_commit(repo: &'a str, commit: &'a Commit) -> Self {
        Self {
            before: commit.parents.first().map(|parent| (repo, parent.as_str())),
            after: (repo, commit.id.as_str()),
        }
    }
}

pub(crate) fn render_file_diff(t: &Translator, revs: DiffRevs<'_>, file: &FileDiff) -> String {
    let entry = &file.entry;
    let filename = entry.filename();
    let side = match entry.view_side() {
        Side::After => Some(revs.after),
        Side::Before => revs.before,
    };
    let view = side
        .map(|(repo, rev)| link(&href(repo, &object_path("raw", rev, &entry.path)), &t.t("View")))
        .unwrap_or_default();

    let kind = match entry.kind() {
        ChangeKind::Added => t.t("NewFile"),
        ChangeKind::Deleted => t.t("DeletedFile"),
        ChangeKind::ModeChanged { before, after } => t.t_with(
            "ModeChanged",
            &[
                ("before", format!("{:o}", before).as_str()),
                ("after", format!("{:o}", after).as_str()),
            ],
        ),
        ChangeKind::Changed => String::new(),
    };

    let mut html = format!(
        r#"<section class="file"><h3 id="{}">{} <small>{}</small> {}</h3>"#,
        html_escape(&filename),
        html_escape(&filename),
        html_escape(&kind),
        view,
    );
    match &file.content {
        Ok(FileContent::Image) | Ok(FileContent::Unchanged) => {}
        Ok(FileContent::Lines(hunks)) => {
            html.push_str(r#"<table class="diff">"#);
            for hunk in hunks {
                html.push_str(&format!(
                    r#"<tr class="hunk"><td colspan="3">{}</td></tr>"#,
                    html_escape(&hunk.header())
                ));
                for line in &hunk.lines {
                    html.push_str(&render_line(&filename, line));
                }
            }
            html.push_str("</table>");
        }
        Err(e) => html.push_str(&error_section(&e.to_string())),
    }
    html.push_str("</section>");
    html
}

async fn commit_detail(
    State(state): State<Arc<AppState>>,
    Path((id, rev)): Path<(String, String)>,
    Query(params): Query<LocaleParams>,
    headers: HeaderMap,
) -> Result<Html<String>, WebError> {
    let t = translator(&state, &headers, params.locale.as_deref()).await?;
    let message = repo_message(&state, &id).await?;
    let name = state.about.get_repo_name(message.author(), &id).await?;
    let repo = state.repos.get_repo(&id).await?;
    let commit = repo.get_commit(&rev).await?;

    let sides = DiffSides::same(&*repo);
    let entries = sides.diff(commit.parents.first().map(String::as_str), &commit.id).await?;
    let files = sides.file_diffs(entries).await;

    let date = commit.author.date.format("%Y-%m-%d %H:%M").to_string();
    let mut body = format!(
        r#"<h1>{}</h1><h2>{}</h2><p class="author">{}</p>"#,
        link(&href(&id, ""), &name),
        html_escape(&commit.title),
        html_escape(&t.t_with(
            "AuthoredOn",
            &[
                ("author", commit.author.name.as_str()),
                ("date", date.as_str()),
            ],
        )),
    );
    if !commit.body.is_empty() {
        body.push_str(&format!("<pre>{}</pre>", html_escape(&commit.body)));
    }
    if commit.separate_author() {
        body.push_str(&format!(
            r#"<p class="committer">{}</p>"#,
            html_escape(&t.t_with("CommittedBy", &[("committer", commit.committer.name.as_str())]))
        ));
    }
    for parent in &commit.parents {
        body.push_str(&format!(
            r#"<p class="parent">{} {}</p>"#,
            html_escape(&t.t("Parent")),
            link(&href(&id, &format!("commit/{}", url_segment(parent))), parent),
        ));
    }
    for file in &files {
        body.push_str(&render_file_diff(&t, DiffRevs::of_commit(&id, &commit), file));
    }
    Ok(page(&t, &commit.title, &body))
}

fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("bmp") => "image/bmp",
        Some("tif") => "image/tiff",
        _ => "text/plain; charset=utf-8",
    }
}

async fn raw_file(
    State(state): State<Arc<AppState>>,
    Path((id, rev, path)): Path<(String, String, String)>,
) -> Result<Response, WebError> {
    require(&id, IdKind::Msg)?;
    let repo = state.repos.get_repo(&id).await?;
    let (dir, file) = split_file_path(&path)?;
    let entry = find_file(&*repo, &rev, &dir, &file).await?;
    let data = repo.read_blob(&entry.id).await?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&file)))],
        data,
    )
        .into_response())
}
