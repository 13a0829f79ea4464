//! Search execution and result paging.

use std::collections::BTreeMap;
use std::thread;

use logship_core::{Record, Search, SearchQuery};
use logship_store::Pool;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::error::ApiError;

const SEARCH_QUEUE: usize = 64;

/// Run `query` over the record table and store the matching ids.
///
/// The scan runs on a scoped producer thread holding its own pooled handle
/// while the caller's thread drains the channel. Blocks; call from a
/// blocking context.
#[instrument(skip_all, fields(terms = query.terms.len()))]
pub fn execute(pool: &Pool, query: SearchQuery) -> Result<Search, ApiError> {
    let matcher = query
        .compile()
        .map_err(|e| ApiError::rejected(format!("invalid search term: {e}")))?;

    let (tx, mut rx) = mpsc::channel::<Record>(SEARCH_QUEUE);
    let (ids, scanned) = thread::scope(|s| {
        let producer = s.spawn(|| {
            let db = pool.get();
            db.record_search(&matcher, tx)
        });

        let mut ids = Vec::new();
        while let Some(record) = rx.blocking_recv() {
            ids.push(record.id);
        }
        let scanned = producer
            .join()
            .map_err(|_| ApiError::Internal("search producer panicked".into()));
        (ids, scanned)
    });
    let sent = scanned??;
    debug!(sent, collected = ids.len(), "search scan complete");

    let mut search = Search::new(query, ids);
    pool.get().search_add(&mut search)?;
    info!(id = search.id, count = search.count, "search stored");
    Ok(search)
}

/// One page of a stored search.
#[derive(Clone, Debug)]
pub struct Page {
    pub records: Vec<Record>,
    pub page: i64,
    pub max_page: i64,
    pub count: i64,
    pub hostnames: BTreeMap<i64, String>,
}

/// Highest valid zero-based page index for `count` results.
pub fn max_page(count: i64, page_size: i64) -> i64 {
    if count <= 0 || page_size <= 0 {
        0
    } else {
        (count - 1) / page_size
    }
}

/// Load page `page` (zero-based) of search `id`.
pub fn load_page(pool: &Pool, id: i64, page: i64, page_size: i64) -> Result<Page, ApiError> {
    let db = pool.get();
    let count = db
        .search_get_result_count(id)?
        .ok_or_else(|| ApiError::rejected(format!("no search with id {id}")))?;

    let max_page = max_page(count, page_size);
    if page < 0 || page > max_page {
        return Err(ApiError::rejected(format!(
            "page {page} out of range 0..={max_page}"
        )));
    }

    let records = db.search_get_results(id, page * page_size, page_size)?;
    let hostnames = db
        .host_get_all()?
        .into_iter()
        .map(|h| (h.id, h.name))
        .collect();

    Ok(Page {
        records,
        page,
        max_page,
        count,
        hostnames,
    })
}
