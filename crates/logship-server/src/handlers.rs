//! HTTP handlers: the agent protocol under `/ws` and the search API under
//! `/ajax`.
//!
//! Store work runs on the blocking pool with one pooled handle per request.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum_extra::extract::cookie::CookieJar;
use axum_extra::extract::WithRejection;
use chrono::Utc;
use logship_core::time::format_subsecond;
use logship_core::{Host, Record, Response, SearchQuery};
use logship_store::{Database, Pool};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{ApiError, Reply};
use crate::search;
use crate::server::AppState;
use crate::session::{self, Session};

async fn with_pool<T, F>(pool: &Arc<Pool>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Pool) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let pool = Arc::clone(pool);
    tokio::task::spawn_blocking(move || f(&pool)).await?
}

async fn with_db<T, F>(pool: &Arc<Pool>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&mut Database) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    with_pool(pool, move |pool| {
        let mut db = pool.get();
        f(&mut *db)
    })
    .await
}

// ── Agent protocol ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct InitParams {
    /// Host id the agent was assigned earlier, if any.
    pub id: Option<i64>,
}

/// `GET /ws/init/{hostname}`
#[instrument(skip_all, fields(hostname = %hostname, claimed = ?params.id))]
pub async fn register(
    State(state): State<AppState>,
    WithRejection(Path(hostname), _): WithRejection<Path<String>, ApiError>,
    WithRejection(Query(params), _): WithRejection<Query<InitParams>, ApiError>,
    jar: CookieJar,
) -> Result<(CookieJar, Reply), ApiError> {
    let hostname = hostname.trim().to_owned();
    if hostname.is_empty() {
        return Err(ApiError::rejected("host name must not be empty"));
    }

    let (jar, token) = session::ensure_token(jar);
    let bound = state
        .sessions
        .get(&token)
        .filter(Session::is_bound)
        .map(|s| s.host);

    let sessions = Arc::clone(&state.sessions);
    let host = with_db(&state.pool, move |db| {
        let host = resolve_host(db, &hostname, params.id, bound)?;
        // Binding rewrites the session file, so it stays off the runtime.
        sessions.bind(&token, host.id);
        Ok(host)
    })
    .await?;

    info!(host_id = host.id, name = %host.name, "agent registered");
    let reply = Response::ok(format!("Welcome, {}", host.name)).with_payload("ID", host.id);
    Ok((jar, reply.into()))
}

/// Look up or create `name`, checking it against the id the agent claims
/// and the host its session is already bound to.
fn resolve_host(
    db: &mut Database,
    name: &str,
    claimed: Option<i64>,
    bound: Option<i64>,
) -> Result<Host, ApiError> {
    let mut host = match db.host_get_by_name(name)? {
        Some(host) => host,
        None if claimed.is_some() || bound.is_some() => {
            return Err(ApiError::rejected(format!(
                "unknown host {name} for an already registered agent"
            )));
        }
        None => {
            let mut host = Host::new(name);
            match db.host_add(&mut host) {
                Ok(()) => host,
                // Lost a race with another registration of the same name.
                Err(e) if e.is_duplicate() => db.host_get_by_name(name)?.ok_or_else(|| {
                    ApiError::Internal(format!("host {name} vanished after insert"))
                })?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    if let Some(id) = claimed.filter(|&id| id != host.id) {
        return Err(ApiError::rejected(format!(
            "host {name} has id {}, not {id}",
            host.id
        )));
    }
    if let Some(id) = bound.filter(|&id| id != host.id) {
        return Err(ApiError::rejected(format!(
            "session is bound to host {id}, not {name}"
        )));
    }

    db.host_update_last_seen(&mut host, Utc::now())?;
    Ok(host)
}

/// `GET /ws/most_recent`
#[instrument(skip_all)]
pub async fn most_recent(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Reply, ApiError> {
    let host_id = state.sessions.host_for(&jar).ok_or(ApiError::AuthRequired)?;
    let stamp = with_db(&state.pool, move |db| Ok(db.record_get_most_recent(host_id)?)).await?;
    debug!(host_id, %stamp, "most recent record");

    let reply = Response::ok("most recent record").with_payload("timestamp", format_subsecond(&stamp));
    Ok(reply.into())
}

/// `POST /ws/submit_records`
#[instrument(skip_all, fields(bytes = body.len()))]
pub async fn submit_records(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<Reply, ApiError> {
    let host_id = state.sessions.host_for(&jar).ok_or(ApiError::AuthRequired)?;
    let records: Vec<Record> = serde_json::from_slice(&body)?;
    let received = records.len();

    let (added, skipped) = with_db(&state.pool, move |db| ingest(db, host_id, records)).await?;
    info!(host_id, received, added, skipped, "records ingested");

    let reply = Response::ok(format!("added {added} of {received} records"))
        .with_payload("added", added)
        .with_payload("skipped", skipped);
    Ok(reply.into())
}

/// Store a batch for one host in a single transaction. Records already
/// present are skipped; any other failure discards the whole batch.
fn ingest(
    db: &mut Database,
    host_id: i64,
    records: Vec<Record>,
) -> Result<(usize, usize), ApiError> {
    let mut host = db
        .host_get_by_id(host_id)?
        .ok_or_else(|| ApiError::rejected(format!("unknown host {host_id}")))?;

    let counts = db.with_transaction(|db| {
        db.host_update_last_seen(&mut host, Utc::now())?;
        let (mut added, mut skipped) = (0, 0);
        for mut record in records {
            record.id = 0;
            record.host_id = host_id;
            if db.record_check_exist(&record.compute_checksum())? {
                skipped += 1;
                continue;
            }
            db.record_add(&mut record)?;
            added += 1;
        }
        Ok((added, skipped))
    })?;
    Ok(counts)
}

// ── Search API ──────────────────────────────────────────────────────

/// `POST /ajax/search/create`
#[instrument(skip_all)]
pub async fn search_create(State(state): State<AppState>, body: Bytes) -> Result<Reply, ApiError> {
    let query: SearchQuery = serde_json::from_slice(&body)?;
    let search = with_pool(&state.pool, move |pool| search::execute(pool, query)).await?;

    let reply = Response::ok(format!("Got {} results", search.count))
        .with_payload("id", search.id)
        .with_payload("cnt", search.count);
    Ok(reply.into())
}

/// `GET /ajax/search/load/{id}/{page}`
#[instrument(skip_all, fields(id = id, page = page))]
pub async fn search_load(
    State(state): State<AppState>,
    WithRejection(Path((id, page)), _): WithRejection<Path<(i64, i64)>, ApiError>,
) -> Result<Reply, ApiError> {
    let page_size = state.page_size;
    let page = with_pool(&state.pool, move |pool| search::load_page(pool, id, page, page_size)).await?;

    let reply = Response::ok(format!("page {} of {}", page.page, page.max_page))
        .with_payload("records", serde_json::to_string(&page.records)?)
        .with_payload("page", page.page)
        .with_payload("max_page", page.max_page)
        .with_payload("count", page.count)
        .with_payload("hostnames", serde_json::to_string(&page.hostnames)?);
    Ok(reply.into())
}

/// `GET /ajax/search/list`
pub async fn search_list(State(state): State<AppState>) -> Result<Reply, ApiError> {
    let searches = with_db(&state.pool, |db| Ok(db.search_get_all_id()?)).await?;
    let reply = Response::ok(format!("{} searches", searches.len()))
        .with_payload("searches", serde_json::to_string(&searches)?);
    Ok(reply.into())
}

/// `GET /ajax/search/delete/{id}`
#[instrument(skip_all, fields(id = id))]
pub async fn search_delete(
    State(state): State<AppState>,
    WithRejection(Path(id), _): WithRejection<Path<i64>, ApiError>,
) -> Result<Reply, ApiError> {
    if with_db(&state.pool, move |db| Ok(db.search_delete(id)?)).await? {
        Ok(Response::ok(format!("search {id} deleted")).into())
    } else {
        Err(ApiError::rejected(format!("no search with id {id}")))
    }
}

/// `GET /ajax/hosts`
pub async fn hosts(State(state): State<AppState>) -> Result<Reply, ApiError> {
    let hosts = with_db(&state.pool, |db| Ok(db.host_get_all()?)).await?;
    let reply = Response::ok(format!("{} hosts", hosts.len()))
        .with_payload("hosts", serde_json::to_string(&hosts)?);
    Ok(reply.into())
}

/// `GET /ajax/sources`
pub async fn sources(State(state): State<AppState>) -> Result<Reply, ApiError> {
    let sources = with_db(&state.pool, |db| Ok(db.record_get_sources()?)).await?;
    let reply = Response::ok(format!("{} sources", sources.len()))
        .with_payload("sources", serde_json::to_string(&sources)?);
    Ok(reply.into())
}

/// `GET /ajax/records/recent/{cnt}`
pub async fn recent_records(
    State(state): State<AppState>,
    WithRejection(Path(cnt), _): WithRejection<Path<i64>, ApiError>,
) -> Result<Reply, ApiError> {
    let records = with_db(&state.pool, move |db| Ok(db.record_get_recent(cnt)?)).await?;
    let reply = Response::ok(format!("{} records", records.len()))
        .with_payload("records", serde_json::to_string(&records)?);
    Ok(reply.into())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Result<Reply, ApiError> {
    let hosts = with_db(&state.pool, |db| Ok(db.host_get_all()?.len())).await?;
    let reply = Response::ok("healthy")
        .with_payload("hosts", hosts)
        .with_payload("sessions", state.sessions.len());
    Ok(reply.into())
}
