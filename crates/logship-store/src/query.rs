//! Every statement the store runs, keyed for the connection's statement cache.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryId {
    HostAdd,
    HostGetByName,
    HostGetById,
    HostGetAll,
    HostUpdateLastSeen,
    HostDelete,
    RecordAdd,
    RecordCheckExist,
    RecordGetMostRecent,
    RecordGetByHost,
    RecordGetByPeriod,
    RecordGetRecent,
    RecordGetSources,
    RecordGetAll,
    SearchAdd,
    SearchGetById,
    SearchDelete,
    SearchGetResults,
    SearchGetAllId,
    SearchGetResultCount,
}

impl QueryId {
    pub const ALL: [QueryId; 20] = [
        Self::HostAdd,
        Self::HostGetByName,
        Self::HostGetById,
        Self::HostGetAll,
        Self::HostUpdateLastSeen,
        Self::HostDelete,
        Self::RecordAdd,
        Self::RecordCheckExist,
        Self::RecordGetMostRecent,
        Self::RecordGetByHost,
        Self::RecordGetByPeriod,
        Self::RecordGetRecent,
        Self::RecordGetSources,
        Self::RecordGetAll,
        Self::SearchAdd,
        Self::SearchGetById,
        Self::SearchDelete,
        Self::SearchGetResults,
        Self::SearchGetAllId,
        Self::SearchGetResultCount,
    ];

    pub fn sql(self) -> &'static str {
        match self {
            Self::HostAdd => "INSERT INTO host (name, last_seen) VALUES (?1, ?2) RETURNING id",
            Self::HostGetByName => "SELECT id, name, last_seen FROM host WHERE name = ?1",
            Self::HostGetById => "SELECT id, name, last_seen FROM host WHERE id = ?1",
            Self::HostGetAll => "SELECT id, name, last_seen FROM host ORDER BY name",
            Self::HostUpdateLastSeen => "UPDATE host SET last_seen = ?1 WHERE id = ?2",
            Self::HostDelete => "DELETE FROM host WHERE id = ?1",
            Self::RecordAdd => {
                "INSERT INTO record (host_id, stamp, source, message, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING id"
            }
            Self::RecordCheckExist => "SELECT COUNT(id) FROM record WHERE checksum = ?1",
            Self::RecordGetMostRecent => {
                "SELECT COALESCE(MAX(stamp), 0) FROM record WHERE host_id = ?1"
            }
            Self::RecordGetByHost => {
                "SELECT id, host_id, stamp, source, message, checksum
                 FROM record
                 WHERE host_id = ?1
                 ORDER BY stamp DESC, id DESC
                 LIMIT ?2"
            }
            Self::RecordGetByPeriod => {
                "SELECT id, host_id, stamp, source, message, checksum
                 FROM record
                 WHERE stamp BETWEEN ?1 AND ?2
                 ORDER BY stamp, id"
            }
            Self::RecordGetRecent => {
                "SELECT id, host_id, stamp, source, message, checksum
                 FROM record
                 ORDER BY stamp DESC, id DESC
                 LIMIT ?1"
            }
            Self::RecordGetSources => {
                "SELECT source, COUNT(id) FROM record GROUP BY source ORDER BY source"
            }
            Self::RecordGetAll => {
                "SELECT id, host_id, stamp, source, message, checksum
                 FROM record
                 ORDER BY stamp, id"
            }
            Self::SearchAdd => {
                "INSERT INTO search (timestamp, query, results, cnt)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id"
            }
            Self::SearchGetById => {
                "SELECT id, timestamp, query, results, cnt FROM search WHERE id = ?1"
            }
            Self::SearchDelete => "DELETE FROM search WHERE id = ?1",
            Self::SearchGetResults => {
                "SELECT r.id, r.host_id, r.stamp, r.source, r.message, r.checksum
                 FROM search s, json_each(s.results) j
                 INNER JOIN record r ON r.id = j.value
                 WHERE s.id = ?1
                 ORDER BY j.key
                 LIMIT ?3 OFFSET ?2"
            }
            Self::SearchGetAllId => "SELECT id, cnt FROM search ORDER BY id",
            Self::SearchGetResultCount => "SELECT cnt FROM search WHERE id = ?1",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_lists_every_query_once() {
        let unique: HashSet<_> = QueryId::ALL.iter().collect();
        assert_eq!(unique.len(), QueryId::ALL.len());
    }

    #[test]
    fn every_statement_prepares_against_the_schema() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::schema::CREATE_TABLES).unwrap();
        for id in QueryId::ALL {
            conn.prepare(id.sql())
                .unwrap_or_else(|e| panic!("{id:?} failed to prepare: {e}"));
        }
    }
}
